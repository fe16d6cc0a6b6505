use std::str::FromStr;

use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::job::UnknownStatus;

const STICKY_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const STICKY_LEN: usize = 12;
const MAX_SCORE: i32 = 100;
const FAILURE_PENALTY: i32 = 25;
const SCORE_WEIGHT_PREV: f64 = 0.7;
const LATENCY_WEIGHT_PREV: f64 = 0.8;
const FAST_LATENCY_MS: f64 = 500.0;
const SLOW_LATENCY_MS: f64 = 5_000.0;
const SLOW_SCORE: f64 = 20.0;

macro_rules! text_enum {
	($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
		#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
		#[serde(rename_all = "snake_case")]
		pub enum $name {
			$($variant),+
		}
		impl $name {
			pub fn as_str(self) -> &'static str {
				match self {
					$(Self::$variant => $text),+
				}
			}
		}
		impl FromStr for $name {
			type Err = UnknownStatus;

			fn from_str(raw: &str) -> Result<Self, Self::Err> {
				match raw {
					$($text => Ok(Self::$variant),)+
					other => Err(UnknownStatus(other.to_string())),
				}
			}
		}
	};
}

text_enum!(ProxyKind { Master => "master", Dedicated => "dedicated" });
text_enum!(ProxyStatus {
	Available => "available",
	Allocated => "allocated",
	Unhealthy => "unhealthy",
	Disabled => "disabled",
});
text_enum!(AllocationStatus { Active => "active", Revoked => "revoked" });

impl ProxyKind {
	pub fn is_exclusive(self) -> bool {
		matches!(self, Self::Dedicated)
	}
}

/// Resolved upstream address and credentials for one sticky session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProxyEndpoint {
	pub host: String,
	pub port: u16,
	pub username: Option<String>,
	pub password: Option<String>,
}
impl ProxyEndpoint {
	pub fn server(&self) -> String {
		format!("http://{}:{}", self.host, self.port)
	}
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProbeOutcome {
	pub success: bool,
	pub latency_ms: Option<u32>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ProxyHealth {
	pub score: i32,
	pub last_latency_ms: Option<i32>,
	pub avg_latency_ms: Option<f64>,
	pub consecutive_failures: i32,
}

pub fn new_sticky_session_id<R>(rng: &mut R) -> String
where
	R: Rng,
{
	(0..STICKY_LEN)
		.map(|_| STICKY_ALPHABET[rng.random_range(0..STICKY_ALPHABET.len())] as char)
		.collect()
}

pub fn render_sticky_username(template: &str, username: &str, session: &str) -> String {
	template.replace("{username}", username).replace("{session}", session)
}

/// Score contribution of one successful probe: 100 up to 500 ms, falling linearly to 20 at 5 s.
pub fn latency_score(latency_ms: u32) -> i32 {
	let latency = f64::from(latency_ms);

	if latency <= FAST_LATENCY_MS {
		return MAX_SCORE;
	}
	if latency >= SLOW_LATENCY_MS {
		return SLOW_SCORE as i32;
	}

	let ratio = (latency - FAST_LATENCY_MS) / (SLOW_LATENCY_MS - FAST_LATENCY_MS);

	(f64::from(MAX_SCORE) - ratio * (f64::from(MAX_SCORE) - SLOW_SCORE)).round() as i32
}

pub fn apply_probe(health: &ProxyHealth, outcome: ProbeOutcome) -> ProxyHealth {
	if !outcome.success {
		return ProxyHealth {
			score: (health.score - FAILURE_PENALTY).max(0),
			consecutive_failures: health.consecutive_failures.saturating_add(1),
			..*health
		};
	}

	let latency = outcome.latency_ms.unwrap_or(SLOW_LATENCY_MS as u32);
	let sample = f64::from(latency_score(latency));
	let score = (SCORE_WEIGHT_PREV * f64::from(health.score) + (1.0 - SCORE_WEIGHT_PREV) * sample)
		.round() as i32;
	let avg_latency_ms = match health.avg_latency_ms {
		Some(prev) => LATENCY_WEIGHT_PREV * prev + (1.0 - LATENCY_WEIGHT_PREV) * f64::from(latency),
		None => f64::from(latency),
	};

	ProxyHealth {
		score: score.clamp(0, MAX_SCORE),
		last_latency_ms: Some(latency as i32),
		avg_latency_ms: Some(avg_latency_ms),
		consecutive_failures: 0,
	}
}

/// Status after a probe. `held` is true when a dedicated proxy still has an active allocation.
pub fn status_after_probe(current: ProxyStatus, success: bool, held: bool) -> ProxyStatus {
	match (current, success) {
		(ProxyStatus::Disabled, _) => ProxyStatus::Disabled,
		(_, false) => ProxyStatus::Unhealthy,
		(ProxyStatus::Unhealthy, true) if held => ProxyStatus::Allocated,
		(ProxyStatus::Unhealthy, true) => ProxyStatus::Available,
		// No allocation holds it any more.
		(ProxyStatus::Allocated, true) if !held => ProxyStatus::Available,
		(status, true) => status,
	}
}

pub fn next_rotation_at(
	now: OffsetDateTime,
	auto_rotate: bool,
	interval_hours: i32,
) -> Option<OffsetDateTime> {
	if !auto_rotate || interval_hours <= 0 {
		return None;
	}

	Some(now + Duration::hours(i64::from(interval_hours)))
}
