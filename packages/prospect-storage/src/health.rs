use sqlx::{PgConnection, PgExecutor};
use time::{Date, OffsetDateTime};

use crate::{Result, models::AccountHealth};

const HEALTH_COLUMNS: &str = "\
workspace_id, account_id, pages_this_hour, hour_start, captchas_today, captcha_day, \
last_captcha_at, cooldown_until, consecutive_successes, updated_at";

/// Counter values written back after an update.
pub struct HealthWrite {
	pub pages_this_hour: i32,
	pub hour_start: OffsetDateTime,
	pub captchas_today: i32,
	pub captcha_day: Date,
	pub last_captcha_at: Option<OffsetDateTime>,
	pub cooldown_until: Option<OffsetDateTime>,
	pub consecutive_successes: i32,
}

pub async fn get<'e, E>(executor: E, workspace_id: &str, account_id: &str) -> Result<Option<AccountHealth>>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"SELECT {HEALTH_COLUMNS} FROM account_health WHERE workspace_id = $1 AND account_id = $2"
	);
	let row = sqlx::query_as::<_, AccountHealth>(&sql)
		.bind(workspace_id)
		.bind(account_id)
		.fetch_optional(executor)
		.await?;

	Ok(row)
}

/// Creates the row when missing, then locks it for the rest of the transaction.
pub async fn lock_or_init(
	conn: &mut PgConnection,
	workspace_id: &str,
	account_id: &str,
	now: OffsetDateTime,
	today: Date,
) -> Result<AccountHealth> {
	sqlx::query(
		"\
INSERT INTO account_health (workspace_id, account_id, hour_start, captcha_day, updated_at)
VALUES ($1,$2,$3,$4,$3)
ON CONFLICT (workspace_id, account_id) DO NOTHING",
	)
	.bind(workspace_id)
	.bind(account_id)
	.bind(now)
	.bind(today)
	.execute(&mut *conn)
	.await?;

	let sql = format!(
		"SELECT {HEALTH_COLUMNS} FROM account_health \
		WHERE workspace_id = $1 AND account_id = $2 FOR UPDATE"
	);
	let row = sqlx::query_as::<_, AccountHealth>(&sql)
		.bind(workspace_id)
		.bind(account_id)
		.fetch_one(conn)
		.await?;

	Ok(row)
}

pub async fn save<'e, E>(
	executor: E,
	workspace_id: &str,
	account_id: &str,
	write: &HealthWrite,
	now: OffsetDateTime,
) -> Result<()>
where
	E: PgExecutor<'e>,
{
	sqlx::query(
		"\
UPDATE account_health
SET pages_this_hour = $1,
\thour_start = $2,
\tcaptchas_today = $3,
\tcaptcha_day = $4,
\tlast_captcha_at = $5,
\tcooldown_until = $6,
\tconsecutive_successes = $7,
\tupdated_at = $8
WHERE workspace_id = $9 AND account_id = $10",
	)
	.bind(write.pages_this_hour)
	.bind(write.hour_start)
	.bind(write.captchas_today)
	.bind(write.captcha_day)
	.bind(write.last_captcha_at)
	.bind(write.cooldown_until)
	.bind(write.consecutive_successes)
	.bind(now)
	.bind(workspace_id)
	.bind(account_id)
	.execute(executor)
	.await?;

	Ok(())
}
