use std::sync::{
	Arc,
	atomic::{AtomicBool, Ordering},
};

use time::OffsetDateTime;
use uuid::Uuid;

use prospect_domain::proxy::{ProbeOutcome, ProxyEndpoint, ProxyKind};
use prospect_service::{
	AddProxyRequest, BoxFuture, Error, ProspectService, ProxyPool, ProxyProbe, ProxyView, Result,
};
use prospect_storage::{allocations, db::Db, proxies};

const WORKSPACE: &str = "ws-pool";

async fn bootstrap(dsn: &str) -> ProspectService {
	let cfg = super::test_config(dsn);
	let db = Db::connect(&cfg.storage.postgres).await.expect("Failed to connect to Postgres.");

	db.ensure_schema().await.expect("Failed to ensure schema.");

	ProspectService::new(cfg, db).expect("Failed to build service.")
}

async fn add(pool: &ProxyPool, kind: ProxyKind, host: &str, auto_rotate: bool) -> Uuid {
	pool.add_proxy(AddProxyRequest {
		provider: "test".to_string(),
		kind,
		host: host.to_string(),
		port: 8080,
		username: Some("user".to_string()),
		password: Some("secret".to_string()),
		auto_rotate,
		rotation_interval_hours: None,
	})
	.await
	.expect("Failed to add proxy.")
	.proxy_id
}

async fn find(pool: &ProxyPool, proxy_id: Uuid) -> ProxyView {
	pool.list_proxies()
		.await
		.expect("Failed to list proxies.")
		.into_iter()
		.find(|view| view.proxy_id == proxy_id)
		.expect("Proxy is missing.")
}

/// Reports whatever `healthy` currently holds.
struct SwitchProbe {
	healthy: AtomicBool,
}
impl ProxyProbe for SwitchProbe {
	fn probe<'a>(&'a self, _endpoint: &'a ProxyEndpoint) -> BoxFuture<'a, Result<ProbeOutcome>> {
		Box::pin(async move {
			let success = self.healthy.load(Ordering::SeqCst);

			Ok(ProbeOutcome { success, latency_ms: success.then_some(90) })
		})
	}
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PROSPECT_PG_DSN to run."]
async fn master_proxy_is_preferred_and_shared() {
	let Some(test_db) = super::test_db().await else {
		eprintln!("Skipping master preference test; set PROSPECT_PG_DSN to run this test.");

		return;
	};
	let service = bootstrap(test_db.dsn()).await;
	let pool = &service.proxy_pool;
	let dedicated = add(pool, ProxyKind::Dedicated, "10.1.0.1", false).await;
	let master = add(pool, ProxyKind::Master, "10.1.0.2", false).await;
	let first = pool.allocate(WORKSPACE, "acct-1").await.expect("First allocation.");
	let second = pool.allocate(WORKSPACE, "acct-2").await.expect("Second allocation.");

	assert_eq!(first.proxy_id, master);
	assert_eq!(second.proxy_id, master);
	assert!(!first.exclusive);
	assert_ne!(first.sticky_session_id, second.sticky_session_id);
	assert_eq!(
		first.endpoint.username,
		Some(format!("user-session-{}", first.sticky_session_id))
	);
	assert_eq!(first.endpoint.password.as_deref(), Some("secret"));

	// Asking again returns the same sticky session.
	let again = pool.allocate(WORKSPACE, "acct-1").await.expect("Repeat allocation.");

	assert_eq!(again.allocation_id, first.allocation_id);
	assert_eq!(again.sticky_session_id, first.sticky_session_id);
	assert_eq!(find(pool, dedicated).await.status, "available");

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PROSPECT_PG_DSN to run."]
async fn dedicated_proxy_is_exclusive_until_released() {
	let Some(test_db) = super::test_db().await else {
		eprintln!("Skipping dedicated allocation test; set PROSPECT_PG_DSN to run this test.");

		return;
	};
	let service = bootstrap(test_db.dsn()).await;
	let pool = &service.proxy_pool;
	let dedicated = add(pool, ProxyKind::Dedicated, "10.1.0.3", false).await;
	let held = pool.allocate(WORKSPACE, "acct-1").await.expect("Dedicated allocation.");

	assert_eq!(held.proxy_id, dedicated);
	assert!(held.exclusive);
	assert_eq!(find(pool, dedicated).await.status, "allocated");

	let starved = pool.allocate(WORKSPACE, "acct-2").await;

	assert!(matches!(starved, Err(Error::ProxyUnavailable { .. })), "Unexpected {starved:?}.");

	let refused = pool.remove_proxy(dedicated).await;

	assert!(matches!(refused, Err(Error::Conflict { .. })), "Unexpected {refused:?}.");

	assert!(pool.release(WORKSPACE, "acct-1").await.expect("Release."));
	assert_eq!(find(pool, dedicated).await.status, "available");

	pool.remove_proxy(dedicated).await.expect("Removal after release.");

	assert!(pool.list_proxies().await.expect("Failed to list proxies.").is_empty());

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PROSPECT_PG_DSN to run."]
async fn allocation_past_its_rotation_time_gets_a_new_sticky_session() {
	let Some(test_db) = super::test_db().await else {
		eprintln!("Skipping rotation test; set PROSPECT_PG_DSN to run this test.");

		return;
	};
	let service = bootstrap(test_db.dsn()).await;
	let pool = &service.proxy_pool;
	let master = add(pool, ProxyKind::Master, "10.1.0.4", true).await;
	let first = pool.allocate(WORKSPACE, "acct-1").await.expect("First allocation.");

	sqlx::query("UPDATE proxy_allocations SET next_rotation_at = $1 WHERE allocation_id = $2")
		.bind(OffsetDateTime::now_utc() - time::Duration::MINUTE)
		.bind(first.allocation_id)
		.execute(&service.db.pool)
		.await
		.expect("Failed to backdate rotation.");

	let rotated = pool.allocate(WORKSPACE, "acct-1").await.expect("Allocation after due time.");

	assert_eq!(rotated.proxy_id, master);
	assert_eq!(rotated.allocation_id, first.allocation_id);
	assert_ne!(rotated.sticky_session_id, first.sticky_session_id);

	let stored = allocations::active_for_account(&service.db.pool, WORKSPACE, "acct-1")
		.await
		.expect("Failed to read allocation.")
		.expect("Allocation is missing.");

	assert!(stored.next_rotation_at.is_some_and(|at| at > OffsetDateTime::now_utc()));

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PROSPECT_PG_DSN to run."]
async fn unhealthy_proxy_is_swapped_for_a_usable_one() {
	let Some(test_db) = super::test_db().await else {
		eprintln!("Skipping reallocation test; set PROSPECT_PG_DSN to run this test.");

		return;
	};
	let service = bootstrap(test_db.dsn()).await;
	let pool = &service.proxy_pool;
	let one = add(pool, ProxyKind::Master, "10.1.0.5", false).await;
	let two = add(pool, ProxyKind::Master, "10.1.0.6", false).await;
	let first = pool.allocate(WORKSPACE, "acct-1").await.expect("First allocation.");

	proxies::set_status(&service.db.pool, first.proxy_id, "unhealthy", OffsetDateTime::now_utc())
		.await
		.expect("Failed to mark proxy unhealthy.");

	let moved = pool.allocate(WORKSPACE, "acct-1").await.expect("Reallocation.");
	let other = if first.proxy_id == one { two } else { one };

	assert_eq!(moved.proxy_id, other);
	assert_ne!(moved.allocation_id, first.allocation_id);
	assert_eq!(
		allocations::count_active_for_proxy(&service.db.pool, first.proxy_id)
			.await
			.expect("Count allocations."),
		0
	);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}

#[tokio::test]
#[ignore = "Requires external Postgres. Set PROSPECT_PG_DSN to run."]
async fn health_check_demotes_failing_proxies_and_restores_them() {
	let Some(test_db) = super::test_db().await else {
		eprintln!("Skipping health check test; set PROSPECT_PG_DSN to run this test.");

		return;
	};
	let service = bootstrap(test_db.dsn()).await;
	let pool = &service.proxy_pool;
	let dedicated = add(pool, ProxyKind::Dedicated, "10.1.0.7", false).await;

	pool.allocate(WORKSPACE, "acct-1").await.expect("Dedicated allocation.");

	let master = add(pool, ProxyKind::Master, "10.1.0.8", false).await;
	let probe = SwitchProbe { healthy: AtomicBool::new(false) };
	let failing = pool.health_check(&probe).await.expect("Failing health check.");

	assert_eq!(failing.checked, 2);
	assert_eq!(failing.unhealthy, 2);
	assert_eq!(find(pool, dedicated).await.status, "unhealthy");
	assert_eq!(find(pool, master).await.status, "unhealthy");
	assert_eq!(find(pool, master).await.consecutive_failures, 1);

	probe.healthy.store(true, Ordering::SeqCst);

	let passing = pool.health_check(&probe).await.expect("Passing health check.");

	assert_eq!(passing.healthy, 2);
	// The dedicated proxy still backs its allocation.
	assert_eq!(find(pool, dedicated).await.status, "allocated");
	assert_eq!(find(pool, master).await.status, "available");
	assert_eq!(find(pool, master).await.consecutive_failures, 0);

	// Disabled proxies are skipped entirely.
	pool.set_proxy_disabled(master, true).await.expect("Disable proxy.");

	let skipped = pool.health_check(&probe).await.expect("Health check with a disabled proxy.");

	assert_eq!(skipped.checked, 1);

	test_db.cleanup().await.expect("Failed to cleanup test database.");
}
