use sqlx::{Connection, PgConnection, PgExecutor};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Result, error, models::ProxyAllocation};

const ALLOCATION_COLUMNS: &str = "\
allocation_id, proxy_id, workspace_id, account_id, status, exclusive, sticky_session_id, \
allocated_at, next_rotation_at, revoked_at";

pub struct NewAllocation<'a> {
	pub proxy_id: Uuid,
	pub workspace_id: &'a str,
	pub account_id: &'a str,
	pub exclusive: bool,
	pub sticky_session_id: &'a str,
	pub next_rotation_at: Option<OffsetDateTime>,
}

/// Active allocation joined with the proxy's rotation settings.
#[derive(Clone, Debug, sqlx::FromRow)]
pub struct DueRotation {
	pub allocation_id: Uuid,
	pub proxy_id: Uuid,
	pub workspace_id: String,
	pub account_id: String,
	pub rotation_interval_hours: i32,
}

pub async fn active_for_account<'e, E>(
	executor: E,
	workspace_id: &str,
	account_id: &str,
) -> Result<Option<ProxyAllocation>>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"SELECT {ALLOCATION_COLUMNS} FROM proxy_allocations \
		WHERE workspace_id = $1 AND account_id = $2 AND status = 'active'"
	);
	let row = sqlx::query_as::<_, ProxyAllocation>(&sql)
		.bind(workspace_id)
		.bind(account_id)
		.fetch_optional(executor)
		.await?;

	Ok(row)
}

pub async fn lock_active_for_account(
	conn: &mut PgConnection,
	workspace_id: &str,
	account_id: &str,
) -> Result<Option<ProxyAllocation>> {
	let sql = format!(
		"SELECT {ALLOCATION_COLUMNS} FROM proxy_allocations \
		WHERE workspace_id = $1 AND account_id = $2 AND status = 'active' FOR UPDATE"
	);
	let row = sqlx::query_as::<_, ProxyAllocation>(&sql)
		.bind(workspace_id)
		.bind(account_id)
		.fetch_optional(conn)
		.await?;

	Ok(row)
}

/// Fails with [`crate::Error::Conflict`] when a partial unique index rejects the row.
///
/// The insert runs inside a savepoint so the caller's transaction stays usable after a conflict.
pub async fn insert_allocation(
	conn: &mut PgConnection,
	allocation: &NewAllocation<'_>,
	now: OffsetDateTime,
) -> Result<ProxyAllocation> {
	let sql = format!(
		"\
INSERT INTO proxy_allocations (
\tallocation_id,
\tproxy_id,
\tworkspace_id,
\taccount_id,
\tstatus,
\texclusive,
\tsticky_session_id,
\tallocated_at,
\tnext_rotation_at
)
VALUES ($1,$2,$3,$4,'active',$5,$6,$7,$8)
RETURNING {ALLOCATION_COLUMNS}"
	);

	let mut savepoint = conn.begin().await?;
	let inserted = sqlx::query_as::<_, ProxyAllocation>(&sql)
		.bind(Uuid::new_v4())
		.bind(allocation.proxy_id)
		.bind(allocation.workspace_id)
		.bind(allocation.account_id)
		.bind(allocation.exclusive)
		.bind(allocation.sticky_session_id)
		.bind(now)
		.bind(allocation.next_rotation_at)
		.fetch_one(&mut *savepoint)
		.await;

	match inserted {
		Ok(row) => {
			savepoint.commit().await?;

			Ok(row)
		},
		Err(err) => {
			savepoint.rollback().await?;

			Err(error::map_unique_violation(err))
		},
	}
}

/// Removes whatever active row holds the (workspace, account) slot. A dedicated proxy the row
/// held exclusively goes back to `available` in the same statement.
pub async fn delete_active_for_account<'e, E>(
	executor: E,
	workspace_id: &str,
	account_id: &str,
	now: OffsetDateTime,
) -> Result<u64>
where
	E: PgExecutor<'e>,
{
	let deleted: i64 = sqlx::query_scalar(
		"\
WITH deleted AS (
\tDELETE FROM proxy_allocations
\tWHERE workspace_id = $1 AND account_id = $2 AND status = 'active'
\tRETURNING proxy_id, exclusive
),
released AS (
\tUPDATE proxies
\tSET status = 'available', updated_at = $3
\tWHERE status = 'allocated'
\t\tAND proxy_id IN (SELECT proxy_id FROM deleted WHERE exclusive)
)
SELECT count(*) FROM deleted",
	)
	.bind(workspace_id)
	.bind(account_id)
	.bind(now)
	.fetch_one(executor)
	.await?;

	Ok(deleted as u64)
}

pub async fn revoke<'e, E>(executor: E, allocation_id: Uuid, now: OffsetDateTime) -> Result<bool>
where
	E: PgExecutor<'e>,
{
	let result = sqlx::query(
		"\
UPDATE proxy_allocations
SET status = 'revoked', revoked_at = $1
WHERE allocation_id = $2 AND status = 'active'",
	)
	.bind(now)
	.bind(allocation_id)
	.execute(executor)
	.await?;

	Ok(result.rows_affected() == 1)
}

pub async fn update_sticky_session(
	conn: &mut PgConnection,
	allocation_id: Uuid,
	sticky_session_id: &str,
	next_rotation_at: Option<OffsetDateTime>,
) -> Result<Option<ProxyAllocation>> {
	let sql = format!(
		"\
UPDATE proxy_allocations
SET sticky_session_id = $1, next_rotation_at = $2
WHERE allocation_id = $3 AND status = 'active'
RETURNING {ALLOCATION_COLUMNS}"
	);

	sqlx::query_as::<_, ProxyAllocation>(&sql)
		.bind(sticky_session_id)
		.bind(next_rotation_at)
		.bind(allocation_id)
		.fetch_optional(conn)
		.await
		.map_err(error::map_unique_violation)
}

pub async fn count_active_for_proxy<'e, E>(executor: E, proxy_id: Uuid) -> Result<i64>
where
	E: PgExecutor<'e>,
{
	let count: i64 = sqlx::query_scalar(
		"SELECT count(*) FROM proxy_allocations WHERE proxy_id = $1 AND status = 'active'",
	)
	.bind(proxy_id)
	.fetch_one(executor)
	.await?;

	Ok(count)
}

pub async fn list_active_for_proxy<'e, E>(executor: E, proxy_id: Uuid) -> Result<Vec<ProxyAllocation>>
where
	E: PgExecutor<'e>,
{
	let sql = format!(
		"SELECT {ALLOCATION_COLUMNS} FROM proxy_allocations \
		WHERE proxy_id = $1 AND status = 'active' ORDER BY allocated_at"
	);
	let rows =
		sqlx::query_as::<_, ProxyAllocation>(&sql).bind(proxy_id).fetch_all(executor).await?;

	Ok(rows)
}

/// Active allocations on auto-rotating proxies whose rotation time has passed.
pub async fn due_for_rotation<'e, E>(
	executor: E,
	now: OffsetDateTime,
	limit: i64,
) -> Result<Vec<DueRotation>>
where
	E: PgExecutor<'e>,
{
	let rows = sqlx::query_as::<_, DueRotation>(
		"\
SELECT a.allocation_id, a.proxy_id, a.workspace_id, a.account_id, p.rotation_interval_hours
FROM proxy_allocations a
JOIN proxies p ON p.proxy_id = a.proxy_id
WHERE a.status = 'active'
\tAND p.auto_rotate
\tAND a.next_rotation_at IS NOT NULL
\tAND a.next_rotation_at <= $1
ORDER BY a.next_rotation_at ASC
LIMIT $2",
	)
	.bind(now)
	.bind(limit)
	.fetch_all(executor)
	.await?;

	Ok(rows)
}
