use serde::Serialize;
use time::OffsetDateTime;

use prospect_domain::health::{self, HealthCounters, HealthDecision, HealthPolicy};
use prospect_storage::{
	db::Db,
	health::{self as health_store, HealthWrite},
	models::AccountHealth,
};

use crate::Result;

#[derive(Clone, Debug, Serialize)]
pub struct HealthStats {
	pub workspace_id: String,
	pub account_id: String,
	pub counters: HealthCounters,
	pub decision: HealthDecision,
	pub pages_remaining: u32,
	pub pages_per_hour: u32,
	pub daily_captcha_cap: u32,
}

/// Per-account page budget and CAPTCHA cooldown gate, persisted in `account_health`.
#[derive(Clone)]
pub struct AccountHealthTracker {
	db: Db,
	policy: HealthPolicy,
}
impl AccountHealthTracker {
	pub fn new(db: Db, cfg: &prospect_config::AccountHealth) -> Self {
		Self { db, policy: HealthPolicy::from_config(cfg) }
	}

	pub fn policy(&self) -> &HealthPolicy {
		&self.policy
	}

	pub async fn can_make_request(
		&self,
		workspace_id: &str,
		account_id: &str,
	) -> Result<HealthDecision> {
		let now = OffsetDateTime::now_utc();
		let counters = self.load(workspace_id, account_id, now).await?;

		Ok(health::evaluate(&counters, now, &self.policy))
	}

	pub async fn record_page_load(
		&self,
		workspace_id: &str,
		account_id: &str,
	) -> Result<HealthCounters> {
		self.mutate(workspace_id, account_id, health::record_page_load).await
	}

	pub async fn record_captcha(
		&self,
		workspace_id: &str,
		account_id: &str,
	) -> Result<HealthCounters> {
		let counters = self.mutate(workspace_id, account_id, health::record_captcha).await?;

		tracing::warn!(
			workspace_id,
			account_id,
			captchas_today = counters.captchas_today,
			cooldown_until = ?counters.cooldown_until,
			"CAPTCHA recorded; account cooling down."
		);

		Ok(counters)
	}

	pub async fn stats(&self, workspace_id: &str, account_id: &str) -> Result<HealthStats> {
		let now = OffsetDateTime::now_utc();
		let stored = self.load(workspace_id, account_id, now).await?;
		let counters = health::roll_windows(&stored, now, &self.policy);

		Ok(HealthStats {
			workspace_id: workspace_id.to_string(),
			account_id: account_id.to_string(),
			decision: health::evaluate(&stored, now, &self.policy),
			pages_remaining: health::pages_remaining(&stored, now, &self.policy),
			pages_per_hour: self.policy.pages_per_hour,
			daily_captcha_cap: self.policy.daily_captcha_cap,
			counters,
		})
	}

	async fn load(
		&self,
		workspace_id: &str,
		account_id: &str,
		now: OffsetDateTime,
	) -> Result<HealthCounters> {
		let row = health_store::get(&self.db.pool, workspace_id, account_id).await?;

		Ok(row.map(counters_from_row).unwrap_or_else(|| HealthCounters::fresh(now, &self.policy)))
	}

	/// Row lock, pure update, write back. One transaction.
	async fn mutate<F>(
		&self,
		workspace_id: &str,
		account_id: &str,
		update: F,
	) -> Result<HealthCounters>
	where
		F: FnOnce(&HealthCounters, OffsetDateTime, &HealthPolicy) -> HealthCounters,
	{
		let now = OffsetDateTime::now_utc();
		let today = health::local_day(now, self.policy.utc_offset);
		let mut tx = self.db.pool.begin().await?;
		let row = health_store::lock_or_init(&mut tx, workspace_id, account_id, now, today).await?;
		let next = update(&counters_from_row(row), now, &self.policy);

		health_store::save(&mut *tx, workspace_id, account_id, &write_from_counters(&next), now)
			.await?;

		tx.commit().await?;

		Ok(next)
	}
}

fn counters_from_row(row: AccountHealth) -> HealthCounters {
	HealthCounters {
		pages_this_hour: non_negative(row.pages_this_hour),
		hour_start: row.hour_start,
		captchas_today: non_negative(row.captchas_today),
		captcha_day: row.captcha_day,
		last_captcha_at: row.last_captcha_at,
		cooldown_until: row.cooldown_until,
		consecutive_successes: non_negative(row.consecutive_successes),
	}
}

fn write_from_counters(counters: &HealthCounters) -> HealthWrite {
	HealthWrite {
		pages_this_hour: saturating_i32(counters.pages_this_hour),
		hour_start: counters.hour_start,
		captchas_today: saturating_i32(counters.captchas_today),
		captcha_day: counters.captcha_day,
		last_captcha_at: counters.last_captcha_at,
		cooldown_until: counters.cooldown_until,
		consecutive_successes: saturating_i32(counters.consecutive_successes),
	}
}

fn non_negative(value: i32) -> u32 {
	u32::try_from(value).unwrap_or(0)
}

pub(crate) fn saturating_i32(value: u32) -> i32 {
	i32::try_from(value).unwrap_or(i32::MAX)
}
