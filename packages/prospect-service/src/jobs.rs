use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use prospect_domain::{
	health,
	job::{self, DataSource, JobEvent, JobStatus, SearchCriteria},
};
use prospect_storage::{
	jobs::{self as job_store, NewJob, StatusChange},
	leads, leases,
	models::SearchJob,
};

use crate::{
	Error, Export, ExportFormat, JobCounters, Result, RunRequest,
	control::Control,
	runner::Engine,
};

const MAX_LIST_LIMIT: u32 = 500;
const CANCELLED: &str = "Cancelled by request.";

#[derive(Clone, Debug, Deserialize)]
pub struct CreateJobRequest {
	pub workspace_id: String,
	pub account_id: String,
	pub criteria: SearchCriteria,
	pub max_results: u32,
	#[serde(default)]
	pub campaign_id: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct JobView {
	pub job_id: Uuid,
	pub workspace_id: String,
	pub account_id: String,
	pub campaign_id: Option<String>,
	pub criteria: SearchCriteria,
	pub max_results: u32,
	pub status: JobStatus,
	pub progress: u8,
	pub total_found: u32,
	pub total_pulled: u32,
	pub credits_used: u32,
	pub data_source: Option<DataSource>,
	pub error: Option<String>,
	pub owner_instance: Option<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339")]
	pub updated_at: OffsetDateTime,
	#[serde(with = "time::serde::rfc3339::option")]
	pub started_at: Option<OffsetDateTime>,
	#[serde(with = "time::serde::rfc3339::option")]
	pub completed_at: Option<OffsetDateTime>,
	#[serde(with = "time::serde::rfc3339::option")]
	pub heartbeat_at: Option<OffsetDateTime>,
}
impl JobView {
	pub fn from_row(row: SearchJob) -> Result<Self> {
		let status = row.status.parse::<JobStatus>().map_err(|err| Error::Storage {
			message: format!("Job {} has an unreadable status: {err}", row.job_id),
		})?;
		let data_source =
			row.data_source.as_deref().and_then(|raw| raw.parse::<DataSource>().ok());
		let criteria = serde_json::from_value(row.criteria)?;

		Ok(Self {
			job_id: row.job_id,
			workspace_id: row.workspace_id,
			account_id: row.account_id,
			campaign_id: row.campaign_id,
			criteria,
			max_results: non_negative(row.max_results),
			status,
			progress: non_negative(row.progress).min(100) as u8,
			total_found: non_negative(row.total_found),
			total_pulled: non_negative(row.total_pulled),
			credits_used: non_negative(row.credits_used),
			data_source,
			error: row.error,
			owner_instance: row.owner_instance,
			created_at: row.created_at,
			updated_at: row.updated_at,
			started_at: row.started_at,
			completed_at: row.completed_at,
			heartbeat_at: row.heartbeat_at,
		})
	}

	pub(crate) fn counters(&self) -> JobCounters {
		JobCounters {
			target: self.max_results,
			total_found: self.total_found,
			total_pulled: self.total_pulled,
			credits_used: self.credits_used,
			data_source: self.data_source,
		}
	}

	pub(crate) fn run_request(&self) -> RunRequest {
		RunRequest {
			job_id: self.job_id,
			workspace_id: self.workspace_id.clone(),
			account_id: self.account_id.clone(),
			criteria: self.criteria.clone(),
			counters: self.counters(),
		}
	}
}

/// Admission, lifecycle control and read access for search jobs.
#[derive(Clone)]
pub struct SearchJobManager {
	engine: Engine,
}
impl SearchJobManager {
	pub(crate) fn new(engine: Engine) -> Self {
		Self { engine }
	}

	/// Admits a job and spawns its runner. Nothing is persisted when admission fails.
	pub async fn create_job(&self, req: CreateJobRequest) -> Result<JobView> {
		let req = self.validate(req)?;
		let engine = &self.engine;
		let decision = engine.health.can_make_request(&req.workspace_id, &req.account_id).await?;

		if !decision.allowed
			&& let Some(reason) = decision.reason
		{
			return Err(Error::RateLimited {
				message: reason.message(),
				retry_at: Some(reason.retry_at()),
			});
		}

		let job_id = Uuid::new_v4();
		let now = OffsetDateTime::now_utc();
		let acquired = leases::acquire(
			&engine.db.pool,
			&req.workspace_id,
			&req.account_id,
			job_id,
			now,
			engine.lease_until(now),
		)
		.await?;

		if !acquired {
			return Err(Error::AccountBusy {
				message: format!(
					"Account {}/{} already has an active retrieval session.",
					req.workspace_id, req.account_id
				),
			});
		}

		match self.admit(&req, job_id, now).await {
			Ok(view) => {
				tracing::info!(
					job_id = %view.job_id,
					workspace_id = %view.workspace_id,
					account_id = %view.account_id,
					max_results = view.max_results,
					"Search job admitted."
				);

				engine.spawn_run(view.run_request(), JobStatus::Pending);

				Ok(view)
			},
			Err(err) => {
				if let Err(release_err) =
					leases::release(&engine.db.pool, &req.workspace_id, &req.account_id, job_id)
						.await
				{
					tracing::warn!(
						%job_id,
						error = %release_err,
						"Failed to release lease after a rejected admission."
					);
				}

				Err(err)
			},
		}
	}

	pub async fn get(&self, job_id: Uuid) -> Result<JobView> {
		let row = job_store::get_job(&self.engine.db.pool, job_id)
			.await?
			.ok_or_else(|| Error::not_found(format!("Job {job_id} does not exist.")))?;

		JobView::from_row(row)
	}

	/// Most recent first.
	pub async fn list(&self, workspace_id: &str, limit: u32) -> Result<Vec<JobView>> {
		let limit = i64::from(limit.clamp(1, MAX_LIST_LIMIT));
		let rows = job_store::list_jobs(&self.engine.db.pool, workspace_id, limit).await?;

		rows.into_iter().map(JobView::from_row).collect()
	}

	pub async fn pause(&self, job_id: Uuid) -> Result<JobView> {
		let view = self.apply(job_id, JobEvent::Pause, None).await?;

		self.engine.registry.signal(job_id, Control::Pause);

		tracing::info!(%job_id, pulled = view.total_pulled, "Job paused.");

		Ok(view)
	}

	/// Re-enters the pipeline from the persisted offset.
	pub async fn resume(&self, job_id: Uuid) -> Result<JobView> {
		let current = self.get(job_id).await?;

		job::transition(current.status, JobEvent::Resume)?;

		if self.engine.registry.contains(job_id) {
			return Err(Error::Conflict {
				message: format!("Job {job_id} is still shutting down; retry shortly."),
			});
		}

		let view = self.reenter(current, JobEvent::Resume).await?;

		tracing::info!(%job_id, offset = view.total_pulled, "Job resumed.");

		Ok(view)
	}

	/// Persists `failed` first, then stops the runner at its next suspension point.
	pub async fn cancel(&self, job_id: Uuid) -> Result<JobView> {
		let view = self.apply(job_id, JobEvent::Cancel, Some(CANCELLED)).await?;
		let signalled = self.engine.registry.signal(job_id, Control::Cancel);

		if !signalled {
			// Paused or pending jobs have no runner to release the lease.
			leases::release_for_job(&self.engine.db.pool, job_id).await?;
		}

		tracing::info!(%job_id, "Job cancelled.");

		Ok(view)
	}

	pub async fn export(&self, job_id: Uuid, format: ExportFormat) -> Result<Export> {
		self.get(job_id).await?;

		let rows = leads::list_for_job(&self.engine.db.pool, job_id).await?;

		Export::render(format, &rows)
	}

	/// Runners alive in this process.
	pub fn running_jobs(&self) -> usize {
		self.engine.registry.len()
	}

	/// Reacquires the lease, moves the job to `running` and spawns a runner from its counters.
	pub(crate) async fn reenter(&self, current: JobView, event: JobEvent) -> Result<JobView> {
		let engine = &self.engine;
		let job_id = current.job_id;
		let next = job::transition(current.status, event)?;
		let decision =
			engine.health.can_make_request(&current.workspace_id, &current.account_id).await?;

		if !decision.allowed
			&& let Some(reason) = decision.reason
		{
			return Err(Error::RateLimited {
				message: reason.message(),
				retry_at: Some(reason.retry_at()),
			});
		}

		let now = OffsetDateTime::now_utc();
		let acquired = leases::acquire(
			&engine.db.pool,
			&current.workspace_id,
			&current.account_id,
			job_id,
			now,
			engine.lease_until(now),
		)
		.await?;

		if !acquired {
			return Err(Error::AccountBusy {
				message: format!(
					"Account {}/{} already has an active retrieval session.",
					current.workspace_id, current.account_id
				),
			});
		}

		let change = StatusChange {
			expected: current.status.as_str(),
			next: next.as_str(),
			error: None,
			owner_instance: Some(&*engine.instance_id),
		};
		let stored = job_store::compare_and_set_status(&engine.db.pool, job_id, &change, now).await?;
		let Some(row) = stored else {
			leases::release(&engine.db.pool, &current.workspace_id, &current.account_id, job_id)
				.await?;

			return Err(Error::Conflict {
				message: format!("Job {job_id} changed status concurrently."),
			});
		};
		let mut view = JobView::from_row(row)?;

		// Counters come from storage: the ordered result list is the source of truth.
		let pulled = leads::count_for_job(&engine.db.pool, job_id).await?;

		view.total_pulled = u32::try_from(pulled).unwrap_or(u32::MAX);

		engine.spawn_run(view.run_request(), JobStatus::Running);

		Ok(view)
	}

	fn validate(&self, mut req: CreateJobRequest) -> Result<CreateJobRequest> {
		req.workspace_id = req.workspace_id.trim().to_string();
		req.account_id = req.account_id.trim().to_string();
		req.campaign_id =
			req.campaign_id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty());

		if req.workspace_id.is_empty() || req.account_id.is_empty() {
			return Err(Error::invalid("workspace_id and account_id are required."));
		}
		if req.criteria.is_empty() {
			return Err(Error::invalid(
				"criteria must include at least one of keywords, title, company or location.",
			));
		}
		if req.max_results == 0 {
			return Err(Error::invalid("max_results must be greater than zero."));
		}

		let cap = self.engine.cfg.jobs.max_results_cap;

		if req.max_results > cap {
			tracing::debug!(requested = req.max_results, cap, "Clamping max_results to the cap.");

			req.max_results = cap;
		}

		Ok(req)
	}

	/// Daily quota clamp, credit check and the durable `pending` row.
	async fn admit(
		&self,
		req: &CreateJobRequest,
		job_id: Uuid,
		now: OffsetDateTime,
	) -> Result<JobView> {
		let engine = &self.engine;
		let policy = engine.health.policy();
		let day_start = health::local_day_start(now, policy.utc_offset);
		let pulled_today =
			leads::pulled_since(&engine.db.pool, &req.workspace_id, &req.account_id, day_start)
				.await?;
		let limit = i64::from(engine.cfg.jobs.daily_pull_limit);
		let remaining = u32::try_from((limit - pulled_today).max(0)).unwrap_or(0);

		if remaining == 0 {
			return Err(Error::QuotaExceeded {
				message: format!(
					"Daily pull limit of {limit} reached for {}/{}.",
					req.workspace_id, req.account_id
				),
			});
		}

		let max_results = req.max_results.min(remaining);
		let required = max_results.saturating_mul(engine.cfg.jobs.credits_per_lead);

		if !engine.providers.ledger.has_enough_credits(&req.workspace_id, required).await? {
			return Err(Error::QuotaExceeded {
				message: format!(
					"Workspace {} needs {required} credits for {max_results} lead(s).",
					req.workspace_id
				),
			});
		}

		let criteria = serde_json::to_value(&req.criteria)?;
		let row = job_store::insert_job(
			&engine.db.pool,
			&NewJob {
				job_id,
				workspace_id: &req.workspace_id,
				account_id: &req.account_id,
				campaign_id: req.campaign_id.as_deref(),
				criteria: &criteria,
				max_results: crate::health::saturating_i32(max_results),
				owner_instance: &engine.instance_id,
			},
			now,
		)
		.await?;

		JobView::from_row(row)
	}

	/// Persists one state-machine step guarded on the status just read.
	async fn apply(&self, job_id: Uuid, event: JobEvent, error: Option<&str>) -> Result<JobView> {
		let current = self.get(job_id).await?;
		let next = job::transition(current.status, event)?;
		let change = StatusChange {
			expected: current.status.as_str(),
			next: next.as_str(),
			error,
			owner_instance: None,
		};
		let row = job_store::compare_and_set_status(
			&self.engine.db.pool,
			job_id,
			&change,
			OffsetDateTime::now_utc(),
		)
		.await?
		.ok_or_else(|| Error::Conflict {
			message: format!("Job {job_id} changed status concurrently."),
		})?;

		JobView::from_row(row)
	}
}

fn non_negative(value: i32) -> u32 {
	u32::try_from(value).unwrap_or(0)
}
