use sqlx::PgExecutor;
use time::OffsetDateTime;

use crate::{Result, models::AccountSession};

pub async fn get<'e, E>(executor: E, workspace_id: &str, account_id: &str) -> Result<Option<AccountSession>>
where
	E: PgExecutor<'e>,
{
	let row = sqlx::query_as::<_, AccountSession>(
		"\
SELECT workspace_id, account_id, sealed_payload, ip_bound, updated_at
FROM account_sessions
WHERE workspace_id = $1 AND account_id = $2",
	)
	.bind(workspace_id)
	.bind(account_id)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

pub async fn upsert<'e, E>(
	executor: E,
	workspace_id: &str,
	account_id: &str,
	sealed_payload: &str,
	ip_bound: bool,
	now: OffsetDateTime,
) -> Result<()>
where
	E: PgExecutor<'e>,
{
	sqlx::query(
		"\
INSERT INTO account_sessions (workspace_id, account_id, sealed_payload, ip_bound, updated_at)
VALUES ($1,$2,$3,$4,$5)
ON CONFLICT (workspace_id, account_id) DO UPDATE
SET sealed_payload = EXCLUDED.sealed_payload,
\tip_bound = EXCLUDED.ip_bound,
\tupdated_at = EXCLUDED.updated_at",
	)
	.bind(workspace_id)
	.bind(account_id)
	.bind(sealed_payload)
	.bind(ip_bound)
	.bind(now)
	.execute(executor)
	.await?;

	Ok(())
}
