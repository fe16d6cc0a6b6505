use sqlx::PgExecutor;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Result, models::RetrievalLease};

/// Takes the (workspace, account) lease for `job_id` when it is free, expired, or already held by
/// the same job. Returns `false` when another job holds a live lease.
pub async fn acquire<'e, E>(
	executor: E,
	workspace_id: &str,
	account_id: &str,
	job_id: Uuid,
	now: OffsetDateTime,
	lease_until: OffsetDateTime,
) -> Result<bool>
where
	E: PgExecutor<'e>,
{
	let holder: Option<Uuid> = sqlx::query_scalar(
		"\
INSERT INTO retrieval_leases (workspace_id, account_id, holder_job_id, lease_until, acquired_at)
VALUES ($1,$2,$3,$4,$5)
ON CONFLICT (workspace_id, account_id) DO UPDATE
SET holder_job_id = EXCLUDED.holder_job_id,
\tlease_until = EXCLUDED.lease_until,
\tacquired_at = EXCLUDED.acquired_at
WHERE retrieval_leases.lease_until <= $5
\tOR retrieval_leases.holder_job_id = EXCLUDED.holder_job_id
RETURNING holder_job_id",
	)
	.bind(workspace_id)
	.bind(account_id)
	.bind(job_id)
	.bind(lease_until)
	.bind(now)
	.fetch_optional(executor)
	.await?;

	Ok(holder == Some(job_id))
}

/// Extends a lease the job still holds. Returns `false` when it was lost.
pub async fn renew<'e, E>(
	executor: E,
	workspace_id: &str,
	account_id: &str,
	job_id: Uuid,
	lease_until: OffsetDateTime,
) -> Result<bool>
where
	E: PgExecutor<'e>,
{
	let result = sqlx::query(
		"\
UPDATE retrieval_leases
SET lease_until = $1
WHERE workspace_id = $2 AND account_id = $3 AND holder_job_id = $4",
	)
	.bind(lease_until)
	.bind(workspace_id)
	.bind(account_id)
	.bind(job_id)
	.execute(executor)
	.await?;

	Ok(result.rows_affected() == 1)
}

pub async fn release<'e, E>(executor: E, workspace_id: &str, account_id: &str, job_id: Uuid) -> Result<bool>
where
	E: PgExecutor<'e>,
{
	let result = sqlx::query(
		"DELETE FROM retrieval_leases WHERE workspace_id = $1 AND account_id = $2 AND holder_job_id = $3",
	)
	.bind(workspace_id)
	.bind(account_id)
	.bind(job_id)
	.execute(executor)
	.await?;

	Ok(result.rows_affected() == 1)
}

pub async fn release_for_job<'e, E>(executor: E, job_id: Uuid) -> Result<u64>
where
	E: PgExecutor<'e>,
{
	let result = sqlx::query("DELETE FROM retrieval_leases WHERE holder_job_id = $1")
		.bind(job_id)
		.execute(executor)
		.await?;

	Ok(result.rows_affected())
}

pub async fn get<'e, E>(executor: E, workspace_id: &str, account_id: &str) -> Result<Option<RetrievalLease>>
where
	E: PgExecutor<'e>,
{
	let row = sqlx::query_as::<_, RetrievalLease>(
		"\
SELECT workspace_id, account_id, holder_job_id, lease_until, acquired_at
FROM retrieval_leases
WHERE workspace_id = $1 AND account_id = $2",
	)
	.bind(workspace_id)
	.bind(account_id)
	.fetch_optional(executor)
	.await?;

	Ok(row)
}

pub async fn delete_expired<'e, E>(executor: E, now: OffsetDateTime) -> Result<u64>
where
	E: PgExecutor<'e>,
{
	let result = sqlx::query("DELETE FROM retrieval_leases WHERE lease_until <= $1")
		.bind(now)
		.execute(executor)
		.await?;

	Ok(result.rows_affected())
}
