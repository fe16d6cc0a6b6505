use std::{sync::Arc, time::Duration};

use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use prospect_domain::{
	job::{DataSource, JobStatus},
	lead::Lead,
	proxy::ProxyKind,
};
use prospect_service::{AddProxyRequest, JobView, ProspectService, Providers};
use prospect_storage::{
	credits,
	db::Db,
	jobs::{self, NewJob, StatusChange},
	leases,
};
use prospect_testkit::TestDatabase;

use super::{BrowserScript, FixedSessions, ScriptedLauncher};

const WORKSPACE: &str = "ws-recovery";
const ACCOUNT: &str = "acct-recovery";

async fn bootstrap(test_db: &TestDatabase, script: Arc<BrowserScript>) -> ProspectService {
	let cfg = super::test_config(test_db.dsn());
	let db = Db::connect(&cfg.storage.postgres).await.expect("Failed to connect to Postgres.");

	db.ensure_schema().await.expect("Failed to ensure schema.");

	let providers = Providers {
		credentials: Arc::new(FixedSessions(Some(super::session()))),
		browser: Arc::new(ScriptedLauncher(script)),
		..Providers::postgres_defaults(&cfg, &db).expect("Failed to build providers.")
	};

	ProspectService::with_providers(cfg, db, providers).expect("Failed to build service.")
}

/// Inserts a job and moves it to `running` as if `owner` had started it.
async fn running_job(service: &ProspectService, owner: &str, max_results: i32) -> Uuid {
	let criteria = json!({ "keywords": "founder" });
	let job_id = Uuid::new_v4();
	let now = OffsetDateTime::now_utc();
	let job = NewJob {
		job_id,
		workspace_id: WORKSPACE,
		account_id: ACCOUNT,
		campaign_id: None,
		criteria: &criteria,
		max_results,
		owner_instance: owner,
	};

	jobs::insert_job(&service.db.pool, &job, now).await.expect("Failed to insert job.");
	jobs::compare_and_set_status(
		&service.db.pool,
		job_id,
		&StatusChange { expected: "pending", next: "running", error: None, owner_instance: None },
		now,
	)
	.await
	.expect("Failed to start job.")
	.expect("Job was not pending.");

	let lease_until = now + time::Duration::minutes(10);
	let acquired = leases::acquire(&service.db.pool, WORKSPACE, ACCOUNT, job_id, now, lease_until)
		.await
		.expect("Failed to acquire lease.");

	assert!(acquired);

	job_id
}

async fn wait_for_terminal(service: &ProspectService, job_id: Uuid) -> JobView {
	for _ in 0..200 {
		let view = service.jobs.get(job_id).await.expect("Failed to read job.");

		if !view.status.is_active() && service.jobs.running_jobs() == 0 {
			return view;
		}

		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	panic!("Job {job_id} did not finish in time.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PROSPECT_PG_DSN to run."]
async fn predecessor_jobs_are_interrupted_and_restart_from_offset() {
	let Some(test_db) = super::test_db().await else {
		eprintln!("Skipping crash recovery test; set PROSPECT_PG_DSN to run this test.");

		return;
	};
	let script = Arc::new(BrowserScript::with_pages(vec![(
		format!("{}search/results/people/?keywords=founder", super::SITE),
		super::results_html(&["ada", "linus"], false),
	)]));
	let service = bootstrap(&test_db, script.clone()).await;
	let job_id = running_job(&service, "prospect-test:crashedrun", 3).await;

	// Two leads were persisted before the crash.
	let before_crash = [
		Lead::from_parts(
			format!("{}in/ada", super::SITE),
			Some("Ada".to_string()),
			None,
			None,
			None,
			DataSource::Browser,
		),
		Lead::from_parts(
			format!("{}in/grace", super::SITE),
			Some("Grace".to_string()),
			None,
			None,
			None,
			DataSource::Browser,
		),
	];

	service
		.providers
		.leads
		.persist_and_dedupe(WORKSPACE, job_id, &before_crash)
		.await
		.expect("Failed to persist leads.");

	let report = service.recovery.reconcile_on_startup().await.expect("Reconcile failed.");

	assert_eq!(report.interrupted, 1);
	assert_eq!(report.leases_released, 1);

	let interrupted = service.jobs.get(job_id).await.expect("Failed to read job.");

	assert_eq!(interrupted.status, JobStatus::Interrupted);
	assert!(interrupted.error.as_deref().is_some_and(|error| error.contains("crashedrun")));
	assert!(
		leases::get(&service.db.pool, WORKSPACE, ACCOUNT)
			.await
			.expect("Failed to read lease.")
			.is_none()
	);

	// Reconciliation never resumes on its own.
	let again = service.recovery.reconcile_on_startup().await.expect("Reconcile failed.");

	assert_eq!(again.interrupted, 0);

	service
		.proxy_pool
		.add_proxy(AddProxyRequest {
			provider: "test".to_string(),
			kind: ProxyKind::Master,
			host: "proxy.test".to_string(),
			port: 8080,
			username: Some("user".to_string()),
			password: Some("secret".to_string()),
			auto_rotate: false,
			rotation_interval_hours: None,
		})
		.await
		.expect("Failed to add proxy.");
	credits::credit(&service.db, WORKSPACE, "grant", 10, &json!({}), OffsetDateTime::now_utc())
		.await
		.expect("Failed to grant credits.");

	let restarted = service.recovery.restart(job_id).await.expect("Restart failed.");

	assert_eq!(restarted.status, JobStatus::Running);
	assert_eq!(restarted.total_pulled, 2);

	let finished = wait_for_terminal(&service, job_id).await;

	assert_eq!(finished.status, JobStatus::Completed, "Unexpected error {:?}.", finished.error);
	// "ada" was already linked to the job; only "linus" is new.
	assert_eq!(finished.total_pulled, 3);
	assert_eq!(finished.credits_used, 1);
	assert_eq!(credits::balance(&service.db.pool, WORKSPACE).await.expect("Balance failed."), 9);

	let export = service
		.jobs
		.export(job_id, prospect_service::ExportFormat::Ndjson)
		.await
		.expect("Export failed.");

	assert_eq!(export.count, 3);
	assert!(export.body.lines().last().is_some_and(|line| line.contains("/in/linus")));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PROSPECT_PG_DSN to run."]
async fn fresh_jobs_of_other_instances_are_left_alone() {
	let Some(test_db) = super::test_db().await else {
		eprintln!("Skipping stale sweep test; set PROSPECT_PG_DSN to run this test.");

		return;
	};
	let service = bootstrap(&test_db, Arc::new(BrowserScript::default())).await;
	let job_id = running_job(&service, "other-deployment:live", 10).await;
	let report = service.recovery.reconcile_on_startup().await.expect("Reconcile failed.");

	assert_eq!(report.scanned, 1);
	assert_eq!(report.interrupted, 0);

	let stale = service
		.recovery
		.sweep_stale(OffsetDateTime::now_utc() + time::Duration::hours(1))
		.await
		.expect("Sweep failed.");

	assert_eq!(stale.interrupted, 1);
	assert_eq!(
		service.jobs.get(job_id).await.expect("Failed to read job.").status,
		JobStatus::Interrupted
	);

	let missing = service.recovery.restart(Uuid::new_v4()).await;

	assert!(matches!(missing, Err(prospect_service::Error::NotFound { .. })));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
