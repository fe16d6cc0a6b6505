use time::{Duration, OffsetDateTime};
use tokio::time as tokio_time;

use prospect_config::Config;
use prospect_service::ProspectService;
use prospect_storage::leases;

use crate::Result;

const POLL_INTERVAL_MS: u64 = 1_000;
const LEASE_CLEANUP_INTERVAL_SECONDS: i64 = 300;
const MIN_STALE_SWEEP_SECONDS: i64 = 15;

/// A task that runs at most once per `every`.
#[derive(Clone, Copy, Debug)]
pub struct Periodic {
	every: Duration,
	last_run: Option<OffsetDateTime>,
}
impl Periodic {
	pub fn new(every: Duration) -> Self {
		Self { every, last_run: None }
	}

	/// Never-run tasks are due immediately.
	pub fn due(&self, now: OffsetDateTime) -> bool {
		self.last_run.is_none_or(|last| now - last >= self.every)
	}

	pub fn mark(&mut self, now: OffsetDateTime) {
		self.last_run = Some(now);
	}
}

#[derive(Clone, Copy, Debug)]
pub struct Schedule {
	pub proxy_health: Periodic,
	pub rotation: Periodic,
	pub stale_sweep: Periodic,
	pub lease_cleanup: Periodic,
}
impl Schedule {
	pub fn from_config(cfg: &Config) -> Self {
		let health_every = cfg.proxy_pool.health_check_interval_seconds as i64;
		let rotation_every = cfg.proxy_pool.rotation_sweep_interval_seconds as i64;
		// Sweep often enough that a dead runner is noticed within about one stale window.
		let sweep_every = (cfg.jobs.stale_after_seconds / 2).max(MIN_STALE_SWEEP_SECONDS);

		Self {
			proxy_health: Periodic::new(Duration::seconds(health_every)),
			rotation: Periodic::new(Duration::seconds(rotation_every)),
			stale_sweep: Periodic::new(Duration::seconds(sweep_every)),
			lease_cleanup: Periodic::new(Duration::seconds(LEASE_CLEANUP_INTERVAL_SECONDS)),
		}
	}
}

pub async fn run_worker(
	service: &ProspectService,
	mut schedule: Schedule,
) -> color_eyre::Result<()> {
	tracing::info!(instance_id = service.instance_id(), "Worker started.");

	loop {
		let now = OffsetDateTime::now_utc();

		if schedule.proxy_health.due(now) {
			match check_proxy_health(service).await {
				Ok(()) => schedule.proxy_health.mark(now),
				Err(err) => tracing::error!(error = %err, "Proxy health check failed."),
			}
		}
		if schedule.rotation.due(now) {
			match rotate_due_sessions(service, now).await {
				Ok(()) => schedule.rotation.mark(now),
				Err(err) => tracing::error!(error = %err, "Sticky session rotation failed."),
			}
		}
		if schedule.stale_sweep.due(now) {
			match sweep_stale_jobs(service, now).await {
				Ok(()) => schedule.stale_sweep.mark(now),
				Err(err) => tracing::error!(error = %err, "Stale job sweep failed."),
			}
		}
		if schedule.lease_cleanup.due(now) {
			match purge_expired_leases(service, now).await {
				Ok(()) => schedule.lease_cleanup.mark(now),
				Err(err) => tracing::error!(error = %err, "Expired lease cleanup failed."),
			}
		}

		tokio_time::sleep(std::time::Duration::from_millis(POLL_INTERVAL_MS)).await;
	}
}

async fn check_proxy_health(service: &ProspectService) -> Result<()> {
	let probe = service.providers.probe.clone();
	let report = service.proxy_pool.health_check(probe.as_ref()).await?;

	tracing::info!(
		checked = report.checked,
		healthy = report.healthy,
		unhealthy = report.unhealthy,
		"Proxy health check finished."
	);

	Ok(())
}

async fn rotate_due_sessions(service: &ProspectService, now: OffsetDateTime) -> Result<()> {
	let rotated = service.proxy_pool.rotate_due(now).await?;

	if rotated > 0 {
		tracing::info!(rotated, "Rotated sticky sessions past their interval.");
	}

	Ok(())
}

async fn sweep_stale_jobs(service: &ProspectService, now: OffsetDateTime) -> Result<()> {
	let report = service.recovery.sweep_stale(now).await?;

	if report.interrupted > 0 {
		tracing::warn!(
			scanned = report.scanned,
			interrupted = report.interrupted,
			leases_released = report.leases_released,
			"Interrupted jobs with stale heartbeats."
		);
	}

	Ok(())
}

async fn purge_expired_leases(service: &ProspectService, now: OffsetDateTime) -> Result<()> {
	let purged = leases::delete_expired(&service.db.pool, now).await?;

	if purged > 0 {
		tracing::info!(purged, "Deleted expired retrieval leases.");
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use time::macros::datetime;

	use super::*;

	#[test]
	fn periodic_tasks_run_first_then_wait_their_interval() {
		let start = datetime!(2026-03-01 12:00 UTC);
		let mut task = Periodic::new(Duration::seconds(60));

		assert!(task.due(start));

		task.mark(start);

		assert!(!task.due(start + Duration::seconds(59)));
		assert!(task.due(start + Duration::seconds(60)));
	}

	#[test]
	fn failed_runs_stay_due() {
		let start = datetime!(2026-03-01 12:00 UTC);
		let task = Periodic::new(Duration::seconds(300));

		// Nothing marked it, so the next tick retries.
		assert!(task.due(start));
		assert!(task.due(start + Duration::seconds(1)));
	}
}
