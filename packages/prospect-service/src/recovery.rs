//! Crash recovery: interrupting orphaned jobs and restarting them on request.
//!
//! Nothing here resumes work on its own. Orphans are marked `interrupted` with their leases and
//! proxy allocations released, and an operator (or client) decides whether to restart them.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use prospect_domain::job::JobEvent;
use prospect_storage::{jobs as job_store, leases, models::SearchJob};

use crate::{Error, JobView, Result, SearchJobManager, runner::Engine};

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct RecoveryReport {
	pub scanned: u32,
	pub interrupted: u32,
	/// Active jobs with a runner alive in this process.
	pub live: u32,
	pub leases_released: u32,
}

#[derive(Clone)]
pub struct RecoveryCoordinator {
	engine: Engine,
	jobs: SearchJobManager,
}
impl RecoveryCoordinator {
	pub(crate) fn new(engine: Engine) -> Self {
		let jobs = SearchJobManager::new(engine.clone());

		Self { engine, jobs }
	}

	/// Interrupts `pending`/`running` jobs with no runner here that are either stale or owned by
	/// an earlier run of this instance.
	pub async fn reconcile_on_startup(&self) -> Result<RecoveryReport> {
		let now = OffsetDateTime::now_utc();
		let stale_before = self.stale_before(now);
		let active = job_store::list_active(&self.engine.db.pool).await?;
		let mut report = RecoveryReport::default();

		for job in active {
			report.scanned += 1;

			if self.engine.registry.contains(job.job_id) {
				report.live += 1;

				continue;
			}

			let reason = if self.is_predecessor(job.owner_instance.as_deref()) {
				let owner = job.owner_instance.as_deref().unwrap_or_default();

				Some((format!("Interrupted: owning instance {owner} stopped."), None))
			} else if is_stale(&job, stale_before) {
				Some((stale_message(&job), Some(stale_before)))
			} else {
				None
			};
			let Some((message, guard)) = reason else {
				continue;
			};

			self.interrupt(&job, &message, guard, now, &mut report).await?;
		}

		tracing::info!(
			instance_id = %self.engine.instance_id,
			scanned = report.scanned,
			interrupted = report.interrupted,
			live = report.live,
			"Startup reconciliation finished."
		);

		Ok(report)
	}

	/// Heartbeat-only reconciliation, run periodically by the worker.
	pub async fn sweep_stale(&self, now: OffsetDateTime) -> Result<RecoveryReport> {
		let stale_before = self.stale_before(now);
		let stale = job_store::list_stale(&self.engine.db.pool, stale_before).await?;
		let mut report = RecoveryReport::default();

		for job in stale {
			report.scanned += 1;

			if self.engine.registry.contains(job.job_id) {
				report.live += 1;

				continue;
			}

			self.interrupt(&job, &stale_message(&job), Some(stale_before), now, &mut report).await?;
		}

		if report.interrupted > 0 {
			tracing::warn!(interrupted = report.interrupted, "Stale jobs interrupted.");
		}

		Ok(report)
	}

	/// Re-enters the pipeline for an `interrupted`, `failed` or `rate_limited` job, carrying its
	/// stored counters over.
	pub async fn restart(&self, job_id: Uuid) -> Result<JobView> {
		let current = self.jobs.get(job_id).await?;

		if self.engine.registry.contains(job_id) {
			return Err(Error::Conflict {
				message: format!("Job {job_id} still has a live runner."),
			});
		}

		let previous = current.status;
		let view = self.jobs.reenter(current, JobEvent::Restart).await?;

		tracing::info!(
			%job_id,
			from = %previous,
			offset = view.total_pulled,
			"Job restarted."
		);

		Ok(view)
	}

	fn stale_before(&self, now: OffsetDateTime) -> OffsetDateTime {
		now - time::Duration::seconds(self.engine.cfg.jobs.stale_after_seconds)
	}

	/// Same instance name, different run id.
	fn is_predecessor(&self, owner: Option<&str>) -> bool {
		let Some(owner) = owner else {
			return false;
		};
		let ours = &*self.engine.instance_id;

		owner != ours && instance_name(owner) == instance_name(ours)
	}

	async fn interrupt(
		&self,
		job: &SearchJob,
		message: &str,
		stale_before: Option<OffsetDateTime>,
		now: OffsetDateTime,
		report: &mut RecoveryReport,
	) -> Result<()> {
		let pool = &self.engine.db.pool;
		let interrupted =
			job_store::interrupt_if_active(pool, job.job_id, message, stale_before, now).await?;

		if !interrupted {
			return Ok(());
		}

		report.interrupted += 1;

		let released = leases::release_for_job(pool, job.job_id).await?;

		if released > 0 {
			report.leases_released += 1;

			// The lease holder is the only user of the account's allocation.
			self.engine.proxy_pool.release(&job.workspace_id, &job.account_id).await?;
		}

		tracing::warn!(
			job_id = %job.job_id,
			workspace_id = %job.workspace_id,
			account_id = %job.account_id,
			reason = message,
			"Orphaned job interrupted."
		);

		Ok(())
	}
}

fn instance_name(instance_id: &str) -> &str {
	instance_id.split_once(':').map_or(instance_id, |(name, _)| name)
}

fn is_stale(job: &SearchJob, stale_before: OffsetDateTime) -> bool {
	job.heartbeat_at.unwrap_or(job.updated_at) < stale_before
}

fn stale_message(job: &SearchJob) -> String {
	match job.heartbeat_at {
		Some(at) => format!("Interrupted: no heartbeat since {at}."),
		None => "Interrupted: runner never reported a heartbeat.".to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn instance_name_strips_run_id() {
		assert_eq!(instance_name("prospect-a:0f3c"), "prospect-a");
		assert_eq!(instance_name("legacy"), "legacy");
	}
}
