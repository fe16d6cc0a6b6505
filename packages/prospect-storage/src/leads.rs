use sqlx::{PgExecutor, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Result, db::Db, models::Lead};

const LEAD_COLUMNS: &str = "\
l.lead_id, l.workspace_id, l.profile_url, l.first_name, l.last_name, l.full_name, l.headline, \
l.company, l.location, l.connection_degree, l.data_source, l.created_at";

pub struct NewLead<'a> {
	pub lead_id: Uuid,
	pub profile_url: &'a str,
	pub first_name: Option<&'a str>,
	pub last_name: Option<&'a str>,
	pub full_name: Option<&'a str>,
	pub headline: Option<&'a str>,
	pub company: Option<&'a str>,
	pub location: Option<&'a str>,
	pub connection_degree: Option<&'a str>,
	pub data_source: &'a str,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InsertOutcome {
	/// Leads never seen before in the workspace.
	pub new_in_workspace: u32,
	/// Leads appended to the job's ordered result list.
	pub appended_to_job: u32,
}

/// Upserts a batch in one transaction: new leads are inserted, existing ones are left untouched,
/// and every lead not yet linked to the job is appended after the job's current last position.
pub async fn insert_batch(
	db: &Db,
	workspace_id: &str,
	job_id: Uuid,
	leads: &[NewLead<'_>],
	now: OffsetDateTime,
) -> Result<InsertOutcome> {
	let mut tx = db.pool.begin().await?;

	// Serializes concurrent appends to the same job's position sequence.
	sqlx::query("SELECT job_id FROM search_jobs WHERE job_id = $1 FOR UPDATE")
		.bind(job_id)
		.execute(&mut *tx)
		.await?;

	let mut position: i32 =
		sqlx::query_scalar("SELECT COALESCE(MAX(position) + 1, 0) FROM job_leads WHERE job_id = $1")
			.bind(job_id)
			.fetch_one(&mut *tx)
			.await?;
	let mut outcome = InsertOutcome::default();

	for lead in leads {
		if insert_lead(&mut tx, workspace_id, lead, now).await? {
			outcome.new_in_workspace += 1;
		}

		let linked = sqlx::query(
			"\
INSERT INTO job_leads (job_id, lead_id, position, created_at)
VALUES ($1,$2,$3,$4)
ON CONFLICT (job_id, lead_id) DO NOTHING",
		)
		.bind(job_id)
		.bind(lead.lead_id)
		.bind(position)
		.bind(now)
		.execute(&mut *tx)
		.await?;

		if linked.rows_affected() == 1 {
			outcome.appended_to_job += 1;
			position += 1;
		}
	}

	tx.commit().await?;

	Ok(outcome)
}

async fn insert_lead(
	tx: &mut Transaction<'_, Postgres>,
	workspace_id: &str,
	lead: &NewLead<'_>,
	now: OffsetDateTime,
) -> Result<bool> {
	let inserted: Option<Uuid> = sqlx::query_scalar(
		"\
INSERT INTO leads (
\tlead_id,
\tworkspace_id,
\tprofile_url,
\tfirst_name,
\tlast_name,
\tfull_name,
\theadline,
\tcompany,
\tlocation,
\tconnection_degree,
\tdata_source,
\tcreated_at
)
VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12)
ON CONFLICT DO NOTHING
RETURNING lead_id",
	)
	.bind(lead.lead_id)
	.bind(workspace_id)
	.bind(lead.profile_url)
	.bind(lead.first_name)
	.bind(lead.last_name)
	.bind(lead.full_name)
	.bind(lead.headline)
	.bind(lead.company)
	.bind(lead.location)
	.bind(lead.connection_degree)
	.bind(lead.data_source)
	.bind(now)
	.fetch_optional(&mut **tx)
	.await?;

	Ok(inserted.is_some())
}

pub async fn list_for_job<'e, E>(executor: E, job_id: Uuid) -> Result<Vec<Lead>>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"\
SELECT {LEAD_COLUMNS}
FROM job_leads j
JOIN leads l ON l.lead_id = j.lead_id
WHERE j.job_id = $1
ORDER BY j.position ASC"
	);
	let rows = sqlx::query_as::<_, Lead>(&sql).bind(job_id).fetch_all(executor).await?;

	Ok(rows)
}

pub async fn count_for_job<'e, E>(executor: E, job_id: Uuid) -> Result<i64>
where
	E: PgExecutor<'e>,
{
	let count: i64 = sqlx::query_scalar("SELECT count(*) FROM job_leads WHERE job_id = $1")
		.bind(job_id)
		.fetch_one(executor)
		.await?;

	Ok(count)
}

/// Leads pulled for one account since `since`, across all of its jobs.
pub async fn pulled_since<'e, E>(
	executor: E,
	workspace_id: &str,
	account_id: &str,
	since: OffsetDateTime,
) -> Result<i64>
where
	E: PgExecutor<'e>,
{
	let count: i64 = sqlx::query_scalar(
		"\
SELECT count(*)
FROM job_leads j
JOIN search_jobs s ON s.job_id = j.job_id
WHERE s.workspace_id = $1 AND s.account_id = $2 AND j.created_at >= $3",
	)
	.bind(workspace_id)
	.bind(account_id)
	.bind(since)
	.fetch_one(executor)
	.await?;

	Ok(count)
}

pub async fn count_in_workspace<'e, E>(executor: E, workspace_id: &str) -> Result<i64>
where
	E: PgExecutor<'e>,
{
	let count: i64 = sqlx::query_scalar("SELECT count(*) FROM leads WHERE workspace_id = $1")
		.bind(workspace_id)
		.fetch_one(executor)
		.await?;

	Ok(count)
}
