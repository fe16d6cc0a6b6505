//! Detection of bot challenges and authentication walls.

use regex::Regex;

const CHALLENGE_URL_MARKERS: &[&str] = &["/checkpoint/challenge", "/checkpoint/lg/", "/captcha"];
const CHALLENGE_BODY_PATTERN: &str = r#"(?i)(captcha-internal|g-recaptcha|h-captcha|arkose|funcaptcha|id="challenge-form"|let's do a quick security check|security verification)"#;
const AUTH_WALL_URL_MARKERS: &[&str] = &["/authwall", "/uas/login", "/login", "/signup"];
const AUTH_WALL_BODY_PATTERN: &str =
	r#"(?i)(class="[^"]*authwall|form[^>]+class="[^"]*login__form|join-form|sign in to view)"#;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChallengeKind {
	Captcha,
	Checkpoint,
}

pub fn detect_challenge(url: &str, html: &str) -> Option<ChallengeKind> {
	let lower_url = url.to_ascii_lowercase();

	if CHALLENGE_URL_MARKERS.iter().any(|marker| lower_url.contains(marker)) {
		return Some(ChallengeKind::Checkpoint);
	}
	if body_matches(CHALLENGE_BODY_PATTERN, html) {
		return Some(ChallengeKind::Captcha);
	}

	None
}

pub fn is_auth_wall(url: &str, html: &str) -> bool {
	let lower_url = url.to_ascii_lowercase();

	AUTH_WALL_URL_MARKERS.iter().any(|marker| lower_url.contains(marker))
		|| body_matches(AUTH_WALL_BODY_PATTERN, html)
}

fn body_matches(pattern: &str, html: &str) -> bool {
	Regex::new(pattern).map(|re| re.is_match(html)).unwrap_or(false)
}
