//! Account health windows.
//!
//! Every function here is a pure function of the counters and a caller-supplied `now`, so the
//! tracker in the service layer can run them inside a row lock and tests can use any clock.

use serde::Serialize;
use time::{Date, Duration, OffsetDateTime, Time, UtcOffset};

const HOUR: Duration = Duration::HOUR;

#[derive(Clone, Copy, Debug)]
pub struct HealthPolicy {
	pub pages_per_hour: u32,
	pub daily_captcha_cap: u32,
	pub cooldown: Duration,
	pub utc_offset: UtcOffset,
}
impl HealthPolicy {
	pub fn from_config(cfg: &prospect_config::AccountHealth) -> Self {
		let utc_offset =
			UtcOffset::from_whole_seconds(cfg.utc_offset_minutes * 60).unwrap_or(UtcOffset::UTC);

		Self {
			pages_per_hour: cfg.pages_per_hour,
			daily_captcha_cap: cfg.daily_captcha_cap,
			cooldown: Duration::hours(i64::from(cfg.cooldown_hours)),
			utc_offset,
		}
	}
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct HealthCounters {
	pub pages_this_hour: u32,
	#[serde(with = "time::serde::rfc3339")]
	pub hour_start: OffsetDateTime,
	pub captchas_today: u32,
	pub captcha_day: Date,
	#[serde(with = "time::serde::rfc3339::option")]
	pub last_captcha_at: Option<OffsetDateTime>,
	#[serde(with = "time::serde::rfc3339::option")]
	pub cooldown_until: Option<OffsetDateTime>,
	pub consecutive_successes: u32,
}
impl HealthCounters {
	pub fn fresh(now: OffsetDateTime, policy: &HealthPolicy) -> Self {
		Self {
			pages_this_hour: 0,
			hour_start: now,
			captchas_today: 0,
			captcha_day: local_day(now, policy.utc_offset),
			last_captcha_at: None,
			cooldown_until: None,
			consecutive_successes: 0,
		}
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockReason {
	Cooldown {
		#[serde(with = "time::serde::rfc3339")]
		until: OffsetDateTime,
	},
	HourlyBudget {
		#[serde(with = "time::serde::rfc3339")]
		resets_at: OffsetDateTime,
	},
	DailyCaptchaCap {
		#[serde(with = "time::serde::rfc3339")]
		resets_at: OffsetDateTime,
	},
}
impl BlockReason {
	pub fn message(&self) -> String {
		match self {
			Self::Cooldown { until } =>
				format!("Account is cooling down after a CAPTCHA until {until}."),
			Self::HourlyBudget { resets_at } =>
				format!("Hourly page budget exhausted; resets at {resets_at}."),
			Self::DailyCaptchaCap { resets_at } =>
				format!("Daily CAPTCHA cap reached; resets at {resets_at}."),
		}
	}

	pub fn retry_at(&self) -> OffsetDateTime {
		match *self {
			Self::Cooldown { until } => until,
			Self::HourlyBudget { resets_at } | Self::DailyCaptchaCap { resets_at } => resets_at,
		}
	}
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct HealthDecision {
	pub allowed: bool,
	pub reason: Option<BlockReason>,
}
impl HealthDecision {
	fn allow() -> Self {
		Self { allowed: true, reason: None }
	}

	fn block(reason: BlockReason) -> Self {
		Self { allowed: false, reason: Some(reason) }
	}
}

pub fn local_day(now: OffsetDateTime, offset: UtcOffset) -> Date {
	now.to_offset(offset).date()
}

pub fn next_local_midnight(now: OffsetDateTime, offset: UtcOffset) -> OffsetDateTime {
	let local = now.to_offset(offset);
	let tomorrow = local.date().next_day().unwrap_or(local.date());

	tomorrow.with_time(Time::MIDNIGHT).assume_offset(offset).to_offset(UtcOffset::UTC)
}

/// Start of the local calendar day that contains `now`, expressed in UTC.
pub fn local_day_start(now: OffsetDateTime, offset: UtcOffset) -> OffsetDateTime {
	local_day(now, offset).with_time(Time::MIDNIGHT).assume_offset(offset).to_offset(UtcOffset::UTC)
}

pub fn hour_window_expired(hour_start: OffsetDateTime, now: OffsetDateTime) -> bool {
	now - hour_start >= HOUR
}

/// Applies window resets without recording anything.
pub fn roll_windows(
	counters: &HealthCounters,
	now: OffsetDateTime,
	policy: &HealthPolicy,
) -> HealthCounters {
	let mut next = counters.clone();

	if hour_window_expired(next.hour_start, now) {
		next.pages_this_hour = 0;
		next.hour_start = now;
	}

	let today = local_day(now, policy.utc_offset);

	if next.captcha_day != today {
		next.captchas_today = 0;
		next.captcha_day = today;
	}
	if next.cooldown_until.is_some_and(|until| until <= now) {
		next.cooldown_until = None;
	}

	next
}

pub fn evaluate(
	counters: &HealthCounters,
	now: OffsetDateTime,
	policy: &HealthPolicy,
) -> HealthDecision {
	let current = roll_windows(counters, now, policy);

	if let Some(until) = current.cooldown_until {
		return HealthDecision::block(BlockReason::Cooldown { until });
	}
	if current.pages_this_hour >= policy.pages_per_hour {
		return HealthDecision::block(BlockReason::HourlyBudget {
			resets_at: current.hour_start + HOUR,
		});
	}
	if current.captchas_today >= policy.daily_captcha_cap {
		return HealthDecision::block(BlockReason::DailyCaptchaCap {
			resets_at: next_local_midnight(now, policy.utc_offset),
		});
	}

	HealthDecision::allow()
}

pub fn pages_remaining(counters: &HealthCounters, now: OffsetDateTime, policy: &HealthPolicy) -> u32 {
	let current = roll_windows(counters, now, policy);

	policy.pages_per_hour.saturating_sub(current.pages_this_hour)
}

pub fn record_page_load(
	counters: &HealthCounters,
	now: OffsetDateTime,
	policy: &HealthPolicy,
) -> HealthCounters {
	let mut next = roll_windows(counters, now, policy);

	next.pages_this_hour = next.pages_this_hour.saturating_add(1);
	next.consecutive_successes = next.consecutive_successes.saturating_add(1);

	next
}

pub fn record_captcha(
	counters: &HealthCounters,
	now: OffsetDateTime,
	policy: &HealthPolicy,
) -> HealthCounters {
	let mut next = roll_windows(counters, now, policy);

	next.captchas_today = next.captchas_today.saturating_add(1);
	next.last_captcha_at = Some(now);
	next.cooldown_until = Some(now + policy.cooldown);
	next.consecutive_successes = 0;

	next
}
