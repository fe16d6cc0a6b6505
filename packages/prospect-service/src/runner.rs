//! One tokio task per active job, plus the registry the manager signals through.

use std::{
	collections::HashMap,
	sync::{
		Arc, Mutex, PoisonError,
		atomic::{AtomicU64, Ordering},
	},
	time::Duration,
};

use serde_json::json;
use time::OffsetDateTime;
use tokio::sync::{Mutex as AsyncMutex, watch};
use uuid::Uuid;

use prospect_config::Config;
use prospect_domain::{
	health::HealthDecision,
	job::{self, JobEvent, JobStatus},
	lead::Lead,
	proxy::ProxyEndpoint,
};
use prospect_storage::{
	db::Db,
	jobs::{self as job_store, JobProgress, StatusChange},
	leases,
};

use crate::{
	AccountHealthTracker, BatchOutcome, BoxFuture, Error, JobActivity, JobCounters, PipelineHost,
	Providers, ProxyAssignment, ProxyPool, Result, RetrievalPipeline, RunOutcome, RunRequest,
	control::{self, Control, Stop},
};

const MIN_HEARTBEAT: Duration = Duration::from_secs(1);

/// Shared handles every job runner needs.
#[derive(Clone)]
pub(crate) struct Engine {
	pub(crate) cfg: Arc<Config>,
	pub(crate) db: Db,
	pub(crate) providers: Providers,
	pub(crate) proxy_pool: ProxyPool,
	pub(crate) health: AccountHealthTracker,
	pub(crate) pipeline: Arc<RetrievalPipeline>,
	pub(crate) registry: JobRegistry,
	pub(crate) instance_id: Arc<str>,
}
impl Engine {
	pub(crate) fn lease_until(&self, now: OffsetDateTime) -> OffsetDateTime {
		now + time::Duration::seconds(self.cfg.jobs.lease_seconds)
	}

	/// Registers a control channel for the job and spawns its runner.
	///
	/// `from` is the status the job is in when the task starts: `pending` for fresh jobs,
	/// `running` when resume or restart already moved it.
	pub(crate) fn spawn_run(&self, req: RunRequest, from: JobStatus) {
		let (sender, receiver) = control::channel();
		let sender = Arc::new(sender);
		let token = self.registry.register(req.job_id, sender.clone());
		let engine = self.clone();

		tokio::spawn(async move {
			let job_id = req.job_id;

			engine.run_job(req, from, sender, receiver).await;
			engine.registry.remove(job_id, token);
		});
	}

	async fn run_job(
		&self,
		req: RunRequest,
		from: JobStatus,
		sender: Arc<watch::Sender<Control>>,
		receiver: watch::Receiver<Control>,
	) {
		if from == JobStatus::Pending && !self.start_pending(&req).await {
			self.release_lease(&req).await;

			return;
		}

		self.providers.activity.emit(&JobActivity::Started {
			job_id: req.job_id,
			workspace_id: req.workspace_id.clone(),
			account_id: req.account_id.clone(),
		});

		let host = RunHost {
			engine: self,
			job_id: req.job_id,
			workspace_id: &req.workspace_id,
			account_id: &req.account_id,
			assignment: AsyncMutex::new(None),
		};
		let run = self.pipeline.run(&req, &host, receiver);
		let mut lease_lost = false;

		tokio::pin!(run);

		let outcome = tokio::select! {
			outcome = &mut run => outcome,
			() = self.keep_alive(&req, &sender) => {
				lease_lost = true;

				run.await
			},
		};
		let assigned = host.assignment.lock().await.is_some();

		if assigned
			&& let Err(err) = self.proxy_pool.release(&req.workspace_id, &req.account_id).await
		{
			tracing::warn!(job_id = %req.job_id, error = %err, "Failed to release proxy.");
		}

		self.finish(&req, outcome, lease_lost).await;
		self.release_lease(&req).await;
	}

	async fn start_pending(&self, req: &RunRequest) -> bool {
		let change = StatusChange {
			expected: JobStatus::Pending.as_str(),
			next: JobStatus::Running.as_str(),
			error: None,
			owner_instance: Some(&*self.instance_id),
		};

		match job_store::compare_and_set_status(
			&self.db.pool,
			req.job_id,
			&change,
			OffsetDateTime::now_utc(),
		)
		.await
		{
			Ok(Some(_)) => true,
			Ok(None) => {
				tracing::info!(job_id = %req.job_id, "Job left pending before its runner started.");

				false
			},
			Err(err) => {
				tracing::error!(job_id = %req.job_id, error = %err, "Failed to start job.");

				false
			},
		}
	}

	/// Heartbeats and renews the lease. Returns only after the lease was lost and a cancel was
	/// signalled to the pipeline.
	async fn keep_alive(&self, req: &RunRequest, sender: &watch::Sender<Control>) {
		let period = Duration::from_secs((self.cfg.jobs.lease_seconds / 3).max(1) as u64)
			.max(MIN_HEARTBEAT);
		let mut ticker = tokio::time::interval(period);

		// The first tick completes immediately.
		ticker.tick().await;

		loop {
			ticker.tick().await;

			let now = OffsetDateTime::now_utc();

			if let Err(err) = job_store::heartbeat(&self.db.pool, req.job_id, now).await {
				tracing::warn!(job_id = %req.job_id, error = %err, "Heartbeat failed.");

				continue;
			}

			match leases::renew(
				&self.db.pool,
				&req.workspace_id,
				&req.account_id,
				req.job_id,
				self.lease_until(now),
			)
			.await
			{
				Ok(true) => {},
				Ok(false) => {
					tracing::warn!(
						job_id = %req.job_id,
						workspace_id = %req.workspace_id,
						account_id = %req.account_id,
						"Retrieval lease lost; stopping job."
					);

					sender.send_replace(Control::Cancel);

					return;
				},
				Err(err) => {
					tracing::warn!(job_id = %req.job_id, error = %err, "Lease renewal failed.");
				},
			}
		}
	}

	/// Persists the terminal status through a compare-and-set from `running`.
	async fn finish(&self, req: &RunRequest, outcome: RunOutcome, lease_lost: bool) {
		let counters = outcome.counters().clone();
		let (event, error) = match outcome {
			RunOutcome::Completed(_) => (JobEvent::Complete, None),
			RunOutcome::RateLimited { message, .. } => (JobEvent::RateLimit, Some(message)),
			RunOutcome::Failed { error, .. } => (JobEvent::Fail, Some(error.to_string())),
			RunOutcome::Stopped { stop: Stop::Cancelled, .. } if lease_lost => (
				JobEvent::Fail,
				Some("Retrieval lease lost to another holder.".to_string()),
			),
			// Pause and cancel were already persisted by whoever requested them.
			RunOutcome::Stopped { stop, .. } => {
				tracing::info!(
					job_id = %req.job_id,
					?stop,
					pulled = counters.total_pulled,
					"Job stopped."
				);

				return;
			},
		};
		let Ok(next) = job::transition(JobStatus::Running, event) else {
			return;
		};
		let change = StatusChange {
			expected: JobStatus::Running.as_str(),
			next: next.as_str(),
			error: error.as_deref(),
			owner_instance: None,
		};
		let stored = job_store::compare_and_set_status(
			&self.db.pool,
			req.job_id,
			&change,
			OffsetDateTime::now_utc(),
		)
		.await;

		match stored {
			Ok(Some(_)) => {},
			Ok(None) => {
				tracing::info!(
					job_id = %req.job_id,
					status = %next,
					"Job status changed elsewhere; final status not applied."
				);

				return;
			},
			Err(err) => {
				tracing::error!(
					job_id = %req.job_id,
					error = %err,
					"Failed to persist final status."
				);

				return;
			},
		}

		let activity = match (next, error) {
			(JobStatus::Completed, _) => JobActivity::Completed {
				job_id: req.job_id,
				workspace_id: req.workspace_id.clone(),
				total_pulled: counters.total_pulled,
				credits_used: counters.credits_used,
			},
			(JobStatus::RateLimited, reason) => JobActivity::RateLimited {
				job_id: req.job_id,
				workspace_id: req.workspace_id.clone(),
				reason: reason.unwrap_or_default(),
			},
			(_, error) => JobActivity::Failed {
				job_id: req.job_id,
				workspace_id: req.workspace_id.clone(),
				error: error.unwrap_or_default(),
			},
		};

		self.providers.activity.emit(&activity);
	}

	async fn release_lease(&self, req: &RunRequest) {
		if let Err(err) =
			leases::release(&self.db.pool, &req.workspace_id, &req.account_id, req.job_id).await
		{
			tracing::warn!(
				job_id = %req.job_id,
				error = %err,
				"Failed to release retrieval lease."
			);
		}
	}
}

struct RegisteredRun {
	token: u64,
	control: Arc<watch::Sender<Control>>,
}

/// Control channels of the runners alive in this process.
#[derive(Clone, Default)]
pub(crate) struct JobRegistry {
	runs: Arc<Mutex<HashMap<Uuid, RegisteredRun>>>,
	next_token: Arc<AtomicU64>,
}
impl JobRegistry {
	fn register(&self, job_id: Uuid, control: Arc<watch::Sender<Control>>) -> u64 {
		let token = self.next_token.fetch_add(1, Ordering::Relaxed);

		self.lock().insert(job_id, RegisteredRun { token, control });

		token
	}

	/// Removes the entry only if it still belongs to the run holding `token`.
	fn remove(&self, job_id: Uuid, token: u64) {
		let mut runs = self.lock();

		if runs.get(&job_id).is_some_and(|run| run.token == token) {
			runs.remove(&job_id);
		}
	}

	pub(crate) fn contains(&self, job_id: Uuid) -> bool {
		self.lock().contains_key(&job_id)
	}

	/// Returns `false` when no runner for the job lives in this process.
	pub(crate) fn signal(&self, job_id: Uuid, control: Control) -> bool {
		match self.lock().get(&job_id) {
			Some(run) => {
				run.control.send_replace(control);

				true
			},
			None => false,
		}
	}

	pub(crate) fn len(&self) -> usize {
		self.lock().len()
	}

	fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RegisteredRun>> {
		self.runs.lock().unwrap_or_else(PoisonError::into_inner)
	}
}

/// The production [`PipelineHost`]: health tracker, proxy pool, lead sink and ledger.
struct RunHost<'a> {
	engine: &'a Engine,
	job_id: Uuid,
	workspace_id: &'a str,
	account_id: &'a str,
	assignment: AsyncMutex<Option<ProxyAssignment>>,
}
impl RunHost<'_> {
	async fn renew_lease(&self) -> Result<()> {
		let until = self.engine.lease_until(OffsetDateTime::now_utc());
		let renewed = leases::renew(
			&self.engine.db.pool,
			self.workspace_id,
			self.account_id,
			self.job_id,
			until,
		)
		.await?;

		if !renewed {
			return Err(Error::AccountBusy {
				message: "Retrieval lease was taken over by another job.".to_string(),
			});
		}

		Ok(())
	}
}
impl PipelineHost for RunHost<'_> {
	fn check_health(&self) -> BoxFuture<'_, Result<HealthDecision>> {
		Box::pin(self.engine.health.can_make_request(self.workspace_id, self.account_id))
	}

	fn record_page_load(&self) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			self.engine.health.record_page_load(self.workspace_id, self.account_id).await?;
			self.renew_lease().await
		})
	}

	fn record_challenge(&self) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			self.engine.health.record_captcha(self.workspace_id, self.account_id).await?;

			Ok(())
		})
	}

	fn acquire_proxy(&self) -> BoxFuture<'_, Result<ProxyEndpoint>> {
		Box::pin(async move {
			let assignment =
				self.engine.proxy_pool.allocate(self.workspace_id, self.account_id).await?;
			let endpoint = assignment.endpoint.clone();

			*self.assignment.lock().await = Some(assignment);

			Ok(endpoint)
		})
	}

	fn rotate_proxy(&self) -> BoxFuture<'_, Result<ProxyEndpoint>> {
		Box::pin(async move {
			let mut current = self.assignment.lock().await;
			let Some(proxy_id) = current.as_ref().map(|assignment| assignment.proxy_id) else {
				return Err(Error::ProxyUnavailable {
					message: "No proxy is assigned to rotate.".to_string(),
				});
			};
			let rotated = self
				.engine
				.proxy_pool
				.rotate_sticky_session(proxy_id, self.workspace_id, self.account_id)
				.await?;
			let endpoint = rotated.endpoint.clone();

			*current = Some(rotated);

			Ok(endpoint)
		})
	}

	fn persist_batch<'a>(&'a self, leads: &'a [Lead]) -> BoxFuture<'a, Result<BatchOutcome>> {
		Box::pin(async move {
			let providers = &self.engine.providers;
			let stored =
				providers.leads.persist_and_dedupe(self.workspace_id, self.job_id, leads).await?;
			let charge = stored.new_leads.saturating_mul(self.engine.cfg.jobs.credits_per_lead);

			if charge > 0 {
				let meta = json!({ "job_id": self.job_id, "new_leads": stored.new_leads });
				let charged = providers.ledger.use_credits(self.workspace_id, charge, meta).await?;

				if !charged {
					return Err(Error::QuotaExceeded {
						message: format!(
							"Insufficient credits to pay for {} new lead(s).",
							stored.new_leads
						),
					});
				}
			}

			Ok(BatchOutcome {
				appended: stored.appended,
				new_leads: stored.new_leads,
				credits_charged: charge,
			})
		})
	}

	fn save_progress<'a>(&'a self, counters: &'a JobCounters) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let progress = counters.progress();
			let update = JobProgress {
				progress: i32::from(progress),
				total_found: crate::health::saturating_i32(counters.total_found),
				total_pulled: crate::health::saturating_i32(counters.total_pulled),
				credits_used: crate::health::saturating_i32(counters.credits_used),
				data_source: counters.data_source.map(|source| source.as_str()),
			};
			let now = OffsetDateTime::now_utc();
			let pool = &self.engine.db.pool;

			if !job_store::update_progress(pool, self.job_id, &update, now).await? {
				// Paused or cancelled after this batch was charged. Record it, then stop pulling.
				job_store::update_stopped_progress(pool, self.job_id, &update, now).await?;

				return Err(Error::InvalidTransition {
					message: format!("Job {} is no longer running.", self.job_id),
				});
			}

			self.engine.providers.activity.emit(&JobActivity::Progress {
				job_id: self.job_id,
				workspace_id: self.workspace_id.to_string(),
				total_pulled: counters.total_pulled,
				progress,
			});

			Ok(())
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn registry_ignores_removal_by_a_superseded_run() {
		let registry = JobRegistry::default();
		let job_id = Uuid::new_v4();
		let (first, _first_rx) = control::channel();
		let (second, second_rx) = control::channel();
		let old = registry.register(job_id, Arc::new(first));
		let _new = registry.register(job_id, Arc::new(second));

		registry.remove(job_id, old);

		assert!(registry.contains(job_id));
		assert!(registry.signal(job_id, Control::Pause));
		assert_eq!(*second_rx.borrow(), Control::Pause);
	}

	#[test]
	fn signal_without_runner_reports_false() {
		let registry = JobRegistry::default();

		assert!(!registry.signal(Uuid::new_v4(), Control::Cancel));
		assert_eq!(registry.len(), 0);
	}
}
