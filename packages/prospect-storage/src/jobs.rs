use serde_json::Value;
use sqlx::PgExecutor;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Result, models::SearchJob};

const JOB_COLUMNS: &str = "\
job_id, workspace_id, account_id, campaign_id, criteria, max_results, status, progress, \
total_found, total_pulled, credits_used, data_source, error, owner_instance, heartbeat_at, \
created_at, updated_at, started_at, completed_at";

pub struct NewJob<'a> {
	pub job_id: Uuid,
	pub workspace_id: &'a str,
	pub account_id: &'a str,
	pub campaign_id: Option<&'a str>,
	pub criteria: &'a Value,
	pub max_results: i32,
	pub owner_instance: &'a str,
}

pub struct JobProgress<'a> {
	pub progress: i32,
	pub total_found: i32,
	pub total_pulled: i32,
	pub credits_used: i32,
	pub data_source: Option<&'a str>,
}

/// A status change guarded by the status the caller last observed.
pub struct StatusChange<'a> {
	pub expected: &'a str,
	pub next: &'a str,
	pub error: Option<&'a str>,
	pub owner_instance: Option<&'a str>,
}

pub async fn insert_job<'e, E>(executor: E, job: &NewJob<'_>, now: OffsetDateTime) -> Result<SearchJob>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"\
INSERT INTO search_jobs (
\tjob_id,
\tworkspace_id,
\taccount_id,
\tcampaign_id,
\tcriteria,
\tmax_results,
\tstatus,
\towner_instance,
\theartbeat_at,
\tcreated_at,
\tupdated_at
)
VALUES ($1,$2,$3,$4,$5,$6,'pending',$7,$8,$8,$8)
RETURNING {JOB_COLUMNS}"
	);
	let row = sqlx::query_as::<_, SearchJob>(&sql)
		.bind(job.job_id)
		.bind(job.workspace_id)
		.bind(job.account_id)
		.bind(job.campaign_id)
		.bind(job.criteria)
		.bind(job.max_results)
		.bind(job.owner_instance)
		.bind(now)
		.fetch_one(executor)
		.await?;

	Ok(row)
}

pub async fn get_job<'e, E>(executor: E, job_id: Uuid) -> Result<Option<SearchJob>>
where
	E: PgExecutor<'e>,
{
	let sql = format!("SELECT {JOB_COLUMNS} FROM search_jobs WHERE job_id = $1");
	let row = sqlx::query_as::<_, SearchJob>(&sql).bind(job_id).fetch_optional(executor).await?;

	Ok(row)
}

pub async fn list_jobs<'e, E>(executor: E, workspace_id: &str, limit: i64) -> Result<Vec<SearchJob>>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"SELECT {JOB_COLUMNS} FROM search_jobs WHERE workspace_id = $1 \
		ORDER BY created_at DESC LIMIT $2"
	);
	let rows = sqlx::query_as::<_, SearchJob>(&sql)
		.bind(workspace_id)
		.bind(limit)
		.fetch_all(executor)
		.await?;

	Ok(rows)
}

/// Jobs in `pending` or `running`, oldest first.
pub async fn list_active<'e, E>(executor: E) -> Result<Vec<SearchJob>>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"SELECT {JOB_COLUMNS} FROM search_jobs WHERE status IN ('pending','running') \
		ORDER BY created_at ASC"
	);
	let rows = sqlx::query_as::<_, SearchJob>(&sql).fetch_all(executor).await?;

	Ok(rows)
}

/// Applies `change` only when the row still carries `change.expected`. Returns the new row.
pub async fn compare_and_set_status<'e, E>(
	executor: E,
	job_id: Uuid,
	change: &StatusChange<'_>,
	now: OffsetDateTime,
) -> Result<Option<SearchJob>>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"\
UPDATE search_jobs
SET status = $1,
\terror = CASE WHEN $1 = 'running' THEN NULL ELSE COALESCE($2, error) END,
\towner_instance = COALESCE($3, owner_instance),
\tstarted_at = CASE WHEN $1 = 'running' THEN COALESCE(started_at, $4) ELSE started_at END,
\tcompleted_at = CASE
\t\tWHEN $1 IN ('completed','failed','rate_limited','interrupted') THEN $4
\t\tWHEN $1 = 'running' THEN NULL
\t\tELSE completed_at
\tEND,
\theartbeat_at = CASE WHEN $1 = 'running' THEN $4 ELSE heartbeat_at END,
\tupdated_at = $4
WHERE job_id = $5 AND status = $6
RETURNING {JOB_COLUMNS}"
	);
	let row = sqlx::query_as::<_, SearchJob>(&sql)
		.bind(change.next)
		.bind(change.error)
		.bind(change.owner_instance)
		.bind(now)
		.bind(job_id)
		.bind(change.expected)
		.fetch_optional(executor)
		.await?;

	Ok(row)
}

/// Persists counters and refreshes the heartbeat. Only applies while the job is running.
pub async fn update_progress<'e, E>(
	executor: E,
	job_id: Uuid,
	progress: &JobProgress<'_>,
	now: OffsetDateTime,
) -> Result<bool>
where
	E: PgExecutor<'e>,
{
	let result = sqlx::query(
		"\
UPDATE search_jobs
SET progress = $1,
\ttotal_found = $2,
\ttotal_pulled = $3,
\tcredits_used = $4,
\tdata_source = COALESCE($5, data_source),
\theartbeat_at = $6,
\tupdated_at = $6
WHERE job_id = $7 AND status = 'running'",
	)
	.bind(progress.progress)
	.bind(progress.total_found)
	.bind(progress.total_pulled)
	.bind(progress.credits_used)
	.bind(progress.data_source)
	.bind(now)
	.bind(job_id)
	.execute(executor)
	.await?;

	Ok(result.rows_affected() == 1)
}

/// Counters for a job that a pause or cancel moved off `running` between two batches. The
/// batch was already charged, so the row must still reflect it.
pub async fn update_stopped_progress<'e, E>(
	executor: E,
	job_id: Uuid,
	progress: &JobProgress<'_>,
	now: OffsetDateTime,
) -> Result<bool>
where
	E: PgExecutor<'e>,
{
	let result = sqlx::query(
		"\
UPDATE search_jobs
SET progress = $1,
\ttotal_found = $2,
\ttotal_pulled = $3,
\tcredits_used = $4,
\tdata_source = COALESCE($5, data_source),
\tupdated_at = $6
WHERE job_id = $7 AND status IN ('paused','cancelled','interrupted')",
	)
	.bind(progress.progress)
	.bind(progress.total_found)
	.bind(progress.total_pulled)
	.bind(progress.credits_used)
	.bind(progress.data_source)
	.bind(now)
	.bind(job_id)
	.execute(executor)
	.await?;

	Ok(result.rows_affected() == 1)
}

pub async fn heartbeat<'e, E>(executor: E, job_id: Uuid, now: OffsetDateTime) -> Result<()>
where
	E: PgExecutor<'e>,
{
	sqlx::query(
		"UPDATE search_jobs SET heartbeat_at = $1 WHERE job_id = $2 AND status IN ('pending','running')",
	)
	.bind(now)
	.bind(job_id)
	.execute(executor)
	.await?;

	Ok(())
}

/// Marks a `pending`/`running` job interrupted. With `stale_before`, only when its heartbeat
/// (or last update, if it never beat) is older than that instant.
pub async fn interrupt_if_active<'e, E>(
	executor: E,
	job_id: Uuid,
	error: &str,
	stale_before: Option<OffsetDateTime>,
	now: OffsetDateTime,
) -> Result<bool>
where
	E: PgExecutor<'e>,
{
	let result = sqlx::query(
		"\
UPDATE search_jobs
SET status = 'interrupted', error = $1, completed_at = $2, updated_at = $2
WHERE job_id = $3
\tAND status IN ('pending','running')
\tAND ($4::timestamptz IS NULL OR COALESCE(heartbeat_at, updated_at) < $4)",
	)
	.bind(error)
	.bind(now)
	.bind(job_id)
	.bind(stale_before)
	.execute(executor)
	.await?;

	Ok(result.rows_affected() == 1)
}

/// Active jobs whose heartbeat is older than `stale_before`.
pub async fn list_stale<'e, E>(executor: E, stale_before: OffsetDateTime) -> Result<Vec<SearchJob>>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"SELECT {JOB_COLUMNS} FROM search_jobs \
		WHERE status IN ('pending','running') AND COALESCE(heartbeat_at, updated_at) < $1 \
		ORDER BY created_at ASC"
	);
	let rows = sqlx::query_as::<_, SearchJob>(&sql).bind(stale_before).fetch_all(executor).await?;

	Ok(rows)
}
