use serde::Serialize;

/// Net stack and socket errors that point at the proxy tunnel rather than the target site.
pub const TRANSIENT_SIGNATURES: &[&str] = &[
	"err_tunnel_connection_failed",
	"err_proxy_connection_failed",
	"err_connection_reset",
	"err_connection_closed",
	"err_timed_out",
	"err_empty_response",
	"econnreset",
	"econnrefused",
	"etimedout",
	"socket hang up",
	"proxy authentication required",
];
pub const CHALLENGE_SIGNATURES: &[&str] = &[
	"captcha",
	"checkpoint/challenge",
	"security verification",
	"unusual activity",
	"let's do a quick security check",
];
pub const SESSION_SIGNATURES: &[&str] =
	&["authwall", "session expired", "login required", "uas/login", "status 401", "status 403"];
pub const RATE_LIMIT_SIGNATURES: &[&str] = &["too many requests", "status 429", "status 999"];

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
	ProxyTransient,
	Challenge,
	SessionInvalid,
	RateLimited,
	Fatal,
}
impl FailureKind {
	pub fn is_retryable(self) -> bool {
		matches!(self, Self::ProxyTransient)
	}
}

pub fn classify(message: &str) -> FailureKind {
	let lower = message.to_ascii_lowercase();
	let matches = |signatures: &[&str]| signatures.iter().any(|sig| lower.contains(sig));

	if matches(TRANSIENT_SIGNATURES) {
		FailureKind::ProxyTransient
	} else if matches(CHALLENGE_SIGNATURES) {
		FailureKind::Challenge
	} else if matches(SESSION_SIGNATURES) {
		FailureKind::SessionInvalid
	} else if matches(RATE_LIMIT_SIGNATURES) {
		FailureKind::RateLimited
	} else {
		FailureKind::Fatal
	}
}
