use std::{
	sync::{
		Arc,
		atomic::{AtomicBool, Ordering},
	},
	time::Duration,
};

use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use prospect_domain::{
	health::BlockReason,
	job::{DataSource, JobStatus, SearchCriteria},
	lead::Lead,
	proxy::ProxyKind,
};
use prospect_service::{
	AddProxyRequest, BoxFuture, CreateJobRequest, Error, LeadSink, ProspectService, Providers,
	Result, SinkOutcome,
};
use prospect_storage::{
	credits,
	db::Db,
	jobs::{self, NewJob, StatusChange},
	leads, leases,
};

use super::{BrowserScript, FixedSessions, ScriptedLauncher};

const WORKSPACE: &str = "ws-admission";
const ACCOUNT: &str = "acct-admission";

async fn bootstrap(
	cfg: prospect_config::Config,
	script: Arc<BrowserScript>,
	wrap_leads: impl FnOnce(Arc<dyn LeadSink>, Db) -> Arc<dyn LeadSink>,
) -> ProspectService {
	let db = Db::connect(&cfg.storage.postgres).await.expect("Failed to connect to Postgres.");

	db.ensure_schema().await.expect("Failed to ensure schema.");

	let defaults = Providers::postgres_defaults(&cfg, &db).expect("Failed to build providers.");
	let providers = Providers {
		credentials: Arc::new(FixedSessions(Some(super::session()))),
		browser: Arc::new(ScriptedLauncher(script)),
		leads: wrap_leads(defaults.leads.clone(), db.clone()),
		..defaults
	};

	ProspectService::with_providers(cfg, db, providers).expect("Failed to build service.")
}

fn request(max_results: u32) -> CreateJobRequest {
	CreateJobRequest {
		workspace_id: WORKSPACE.to_string(),
		account_id: ACCOUNT.to_string(),
		criteria: SearchCriteria { keywords: "founder".to_string(), ..Default::default() },
		max_results,
		campaign_id: None,
	}
}

fn unchanged(sink: Arc<dyn LeadSink>, _db: Db) -> Arc<dyn LeadSink> {
	sink
}

/// Moves the job off `running` right after its first batch is stored, the way a pause request
/// landing between two batches would.
struct PauseAfterFirstBatch {
	inner: Arc<dyn LeadSink>,
	db: Db,
	paused: AtomicBool,
}
impl LeadSink for PauseAfterFirstBatch {
	fn persist_and_dedupe<'a>(
		&'a self,
		workspace_id: &'a str,
		job_id: Uuid,
		leads: &'a [Lead],
	) -> BoxFuture<'a, Result<SinkOutcome>> {
		Box::pin(async move {
			let outcome = self.inner.persist_and_dedupe(workspace_id, job_id, leads).await?;

			if !self.paused.swap(true, Ordering::SeqCst) {
				let change = StatusChange {
					expected: "running",
					next: "paused",
					error: None,
					owner_instance: None,
				};

				jobs::compare_and_set_status(
					&self.db.pool,
					job_id,
					&change,
					OffsetDateTime::now_utc(),
				)
				.await?;
			}

			Ok(outcome)
		})
	}
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PROSPECT_PG_DSN to run."]
async fn captcha_blocks_the_account_for_the_cooldown_window() {
	let Some(test_db) = super::test_db().await else {
		eprintln!("Skipping cooldown test; set PROSPECT_PG_DSN to run this test.");

		return;
	};
	let cfg = super::test_config(test_db.dsn());
	let service = bootstrap(cfg, Arc::new(BrowserScript::default()), unchanged).await;
	let before = OffsetDateTime::now_utc();
	let counters =
		service.health.record_captcha(WORKSPACE, ACCOUNT).await.expect("Failed to record CAPTCHA.");

	assert_eq!(counters.captchas_today, 1);

	let decision =
		service.health.can_make_request(WORKSPACE, ACCOUNT).await.expect("Health check failed.");

	assert!(!decision.allowed);

	let Some(BlockReason::Cooldown { until }) = decision.reason else {
		panic!("Expected a cooldown, got {:?}.", decision.reason);
	};
	let window = until - before;
	let six_hours = time::Duration::hours(6);

	assert!(
		window >= six_hours && window < six_hours + time::Duration::MINUTE,
		"Unexpected cooldown window {window}."
	);

	// New jobs for the account are refused while it cools down.
	let refused = service.jobs.create_job(request(5)).await;

	assert!(matches!(refused, Err(Error::RateLimited { .. })), "Unexpected result {refused:?}.");

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PROSPECT_PG_DSN to run."]
async fn insufficient_credits_reject_without_persisting_a_job() {
	let Some(test_db) = super::test_db().await else {
		eprintln!("Skipping credit admission test; set PROSPECT_PG_DSN to run this test.");

		return;
	};
	let cfg = super::test_config(test_db.dsn());
	let service = bootstrap(cfg, Arc::new(BrowserScript::default()), unchanged).await;

	credits::credit(&service.db, WORKSPACE, "grant", 4, &json!({}), OffsetDateTime::now_utc())
		.await
		.expect("Failed to grant credits.");

	let refused = service.jobs.create_job(request(5)).await;
	let Err(Error::QuotaExceeded { message }) = &refused else {
		panic!("Expected quota_exceeded, got {refused:?}.");
	};

	assert!(message.contains("credits"), "Unexpected message {message:?}.");
	assert!(service.jobs.list(WORKSPACE, 10).await.expect("Failed to list jobs.").is_empty());
	// The lease taken for admission is handed back.
	assert!(
		leases::get(&service.db.pool, WORKSPACE, ACCOUNT)
			.await
			.expect("Failed to read lease.")
			.is_none()
	);
	assert_eq!(credits::balance(&service.db.pool, WORKSPACE).await.expect("Balance failed."), 4);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PROSPECT_PG_DSN to run."]
async fn daily_pull_limit_rejects_without_persisting_a_job() {
	let Some(test_db) = super::test_db().await else {
		eprintln!("Skipping daily limit test; set PROSPECT_PG_DSN to run this test.");

		return;
	};
	let mut cfg = super::test_config(test_db.dsn());

	cfg.jobs.daily_pull_limit = 2;

	let service = bootstrap(cfg, Arc::new(BrowserScript::default()), unchanged).await;
	let now = OffsetDateTime::now_utc();
	let criteria = json!({ "keywords": "founder" });
	let earlier = Uuid::new_v4();

	jobs::insert_job(
		&service.db.pool,
		&NewJob {
			job_id: earlier,
			workspace_id: WORKSPACE,
			account_id: ACCOUNT,
			campaign_id: None,
			criteria: &criteria,
			max_results: 2,
			owner_instance: "prospect-test:earlier",
		},
		now,
	)
	.await
	.expect("Failed to insert job.");

	let pulled_today = ["ada", "grace"].map(|slug| {
		Lead::from_parts(
			format!("{}in/{slug}", super::SITE),
			None,
			None,
			None,
			None,
			DataSource::Api,
		)
	});

	service
		.providers
		.leads
		.persist_and_dedupe(WORKSPACE, earlier, &pulled_today)
		.await
		.expect("Failed to persist leads.");
	credits::credit(&service.db, WORKSPACE, "grant", 100, &json!({}), now)
		.await
		.expect("Failed to grant credits.");

	let refused = service.jobs.create_job(request(5)).await;
	let Err(Error::QuotaExceeded { message }) = &refused else {
		panic!("Expected quota_exceeded, got {refused:?}.");
	};

	assert!(message.contains("Daily pull limit"), "Unexpected message {message:?}.");

	let listed = service.jobs.list(WORKSPACE, 10).await.expect("Failed to list jobs.");

	assert_eq!(listed.iter().map(|job| job.job_id).collect::<Vec<_>>(), vec![earlier]);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PROSPECT_PG_DSN to run."]
async fn pause_between_batches_keeps_charged_credits_and_stops_pulling() {
	let Some(test_db) = super::test_db().await else {
		eprintln!("Skipping pause accounting test; set PROSPECT_PG_DSN to run this test.");

		return;
	};
	let cfg = super::test_config(test_db.dsn());
	let script = Arc::new(BrowserScript::with_pages(vec![
		(
			format!("{}search/results/people/?keywords=founder", super::SITE),
			super::results_html(&["ada", "grace"], true),
		),
		(
			format!("{}search/results/people/?keywords=founder&page=2", super::SITE),
			super::results_html(&["linus", "ken"], false),
		),
	]));
	let service = bootstrap(cfg, script, |inner, db| -> Arc<dyn LeadSink> {
		Arc::new(PauseAfterFirstBatch { inner, db, paused: AtomicBool::new(false) })
	})
	.await;

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

	let created = service.jobs.create_job(request(10)).await.expect("Failed to create job.");

	for _ in 0..200 {
		if service.jobs.running_jobs() == 0
			&& service.jobs.get(created.job_id).await.expect("Read job.").status
				!= JobStatus::Pending
		{
			break;
		}

		tokio::time::sleep(Duration::from_millis(50)).await;
	}

	let paused = service.jobs.get(created.job_id).await.expect("Failed to read job.");

	assert_eq!(paused.status, JobStatus::Paused);
	assert_eq!(paused.total_pulled, 2);
	assert_eq!(paused.credits_used, 2);
	assert_eq!(
		leads::count_for_job(&service.db.pool, created.job_id).await.expect("Count leads."),
		2
	);
	assert_eq!(credits::balance(&service.db.pool, WORKSPACE).await.expect("Balance failed."), 8);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
