use sqlx::{PgConnection, PgExecutor};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Result, models::Proxy};

const MASTER_ALLOCATION_LOCK_ID: i64 = 7_734_202;
const PROXY_COLUMNS: &str = "\
proxy_id, provider, kind, host, port, username, password_sealed, status, health_score, \
auto_rotate, rotation_interval_hours, last_used_at, last_latency_ms, avg_latency_ms, \
consecutive_failures, last_checked_at, created_at, updated_at";

pub struct NewProxy<'a> {
	pub provider: &'a str,
	pub kind: &'a str,
	pub host: &'a str,
	pub port: i32,
	pub username: Option<&'a str>,
	pub password_sealed: Option<&'a str>,
	pub auto_rotate: bool,
	pub rotation_interval_hours: i32,
}

pub struct ProbeUpdate<'a> {
	pub status: &'a str,
	pub health_score: i32,
	pub last_latency_ms: Option<i32>,
	pub avg_latency_ms: Option<f64>,
	pub consecutive_failures: i32,
}

pub async fn insert_proxy<'e, E>(executor: E, proxy: &NewProxy<'_>, now: OffsetDateTime) -> Result<Proxy>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"\
INSERT INTO proxies (
\tproxy_id,
\tprovider,
\tkind,
\thost,
\tport,
\tusername,
\tpassword_sealed,
\tstatus,
\tauto_rotate,
\trotation_interval_hours,
\tcreated_at,
\tupdated_at
)
VALUES ($1,$2,$3,$4,$5,$6,$7,'available',$8,$9,$10,$10)
RETURNING {PROXY_COLUMNS}"
	);
	let row = sqlx::query_as::<_, Proxy>(&sql)
		.bind(Uuid::new_v4())
		.bind(proxy.provider)
		.bind(proxy.kind)
		.bind(proxy.host)
		.bind(proxy.port)
		.bind(proxy.username)
		.bind(proxy.password_sealed)
		.bind(proxy.auto_rotate)
		.bind(proxy.rotation_interval_hours)
		.bind(now)
		.fetch_one(executor)
		.await?;

	Ok(row)
}

pub async fn get_proxy<'e, E>(executor: E, proxy_id: Uuid) -> Result<Option<Proxy>>
where
	E: PgExecutor<'e>,
{
	let sql = format!("SELECT {PROXY_COLUMNS} FROM proxies WHERE proxy_id = $1");
	let row = sqlx::query_as::<_, Proxy>(&sql).bind(proxy_id).fetch_optional(executor).await?;

	Ok(row)
}

pub async fn lock_proxy(conn: &mut PgConnection, proxy_id: Uuid) -> Result<Option<Proxy>> {
	let sql = format!("SELECT {PROXY_COLUMNS} FROM proxies WHERE proxy_id = $1 FOR UPDATE");
	let row = sqlx::query_as::<_, Proxy>(&sql).bind(proxy_id).fetch_optional(conn).await?;

	Ok(row)
}

pub async fn list_proxies<'e, E>(executor: E) -> Result<Vec<Proxy>>
where
	E: PgExecutor<'e>,
{
	let sql = format!("SELECT {PROXY_COLUMNS} FROM proxies ORDER BY kind, health_score DESC, host");
	let rows = sqlx::query_as::<_, Proxy>(&sql).fetch_all(executor).await?;

	Ok(rows)
}

/// Every proxy that should be probed: all but the disabled ones.
pub async fn list_probe_targets<'e, E>(executor: E) -> Result<Vec<Proxy>>
where
	E: PgExecutor<'e>,
{
	let sql = format!("SELECT {PROXY_COLUMNS} FROM proxies WHERE status <> 'disabled'");
	let rows = sqlx::query_as::<_, Proxy>(&sql).fetch_all(executor).await?;

	Ok(rows)
}

/// Best available master proxy. `max_sessions = 0` disables the concurrency ceiling.
///
/// With a ceiling, allocators serialize on a transaction-scoped advisory lock so the count below
/// sees every allocation committed before this one. Callers must run inside a transaction.
pub async fn pick_master(conn: &mut PgConnection, max_sessions: i64) -> Result<Option<Proxy>> {
	if max_sessions > 0 {
		sqlx::query("SELECT pg_advisory_xact_lock($1)")
			.bind(MASTER_ALLOCATION_LOCK_ID)
			.execute(&mut *conn)
			.await?;
	}

	let sql = format!(
		"\
SELECT {PROXY_COLUMNS}
FROM proxies p
WHERE p.kind = 'master'
\tAND p.status = 'available'
\tAND (
\t\t$1 = 0
\t\tOR (
\t\t\tSELECT count(*)
\t\t\tFROM proxy_allocations a
\t\t\tWHERE a.proxy_id = p.proxy_id AND a.status = 'active'
\t\t) < $1
\t)
ORDER BY p.health_score DESC, p.last_used_at ASC NULLS FIRST
LIMIT 1"
	);
	let row = sqlx::query_as::<_, Proxy>(&sql).bind(max_sessions).fetch_optional(conn).await?;

	Ok(row)
}

/// Locks the best free dedicated proxy, skipping rows other transactions are claiming.
pub async fn pick_dedicated(conn: &mut PgConnection) -> Result<Option<Proxy>> {
	let sql = format!(
		"\
SELECT {PROXY_COLUMNS}
FROM proxies
WHERE kind = 'dedicated' AND status = 'available'
ORDER BY health_score DESC, last_used_at ASC NULLS FIRST
LIMIT 1
FOR UPDATE SKIP LOCKED"
	);
	let row = sqlx::query_as::<_, Proxy>(&sql).fetch_optional(conn).await?;

	Ok(row)
}

pub async fn set_status<'e, E>(
	executor: E,
	proxy_id: Uuid,
	status: &str,
	now: OffsetDateTime,
) -> Result<bool>
where
	E: PgExecutor<'e>,
{
	let result =
		sqlx::query("UPDATE proxies SET status = $1, updated_at = $2 WHERE proxy_id = $3")
			.bind(status)
			.bind(now)
			.bind(proxy_id)
			.execute(executor)
			.await?;

	Ok(result.rows_affected() == 1)
}

pub async fn touch_last_used<'e, E>(executor: E, proxy_id: Uuid, now: OffsetDateTime) -> Result<()>
where
	E: PgExecutor<'e>,
{
	sqlx::query("UPDATE proxies SET last_used_at = $1, updated_at = $1 WHERE proxy_id = $2")
		.bind(now)
		.bind(proxy_id)
		.execute(executor)
		.await?;

	Ok(())
}

pub async fn record_probe<'e, E>(
	executor: E,
	proxy_id: Uuid,
	update: &ProbeUpdate<'_>,
	now: OffsetDateTime,
) -> Result<()>
where
	E: PgExecutor<'e>,
{
	sqlx::query(
		"\
UPDATE proxies
SET status = $1,
\thealth_score = $2,
\tlast_latency_ms = COALESCE($3, last_latency_ms),
\tavg_latency_ms = COALESCE($4, avg_latency_ms),
\tconsecutive_failures = $5,
\tlast_checked_at = $6,
\tupdated_at = $6
WHERE proxy_id = $7",
	)
	.bind(update.status)
	.bind(update.health_score)
	.bind(update.last_latency_ms)
	.bind(update.avg_latency_ms)
	.bind(update.consecutive_failures)
	.bind(now)
	.bind(proxy_id)
	.execute(executor)
	.await?;

	Ok(())
}

pub async fn delete_proxy(conn: &mut PgConnection, proxy_id: Uuid) -> Result<bool> {
	sqlx::query("DELETE FROM proxy_allocations WHERE proxy_id = $1 AND status = 'revoked'")
		.bind(proxy_id)
		.execute(&mut *conn)
		.await?;

	let result =
		sqlx::query("DELETE FROM proxies WHERE proxy_id = $1").bind(proxy_id).execute(conn).await?;

	Ok(result.rows_affected() == 1)
}
