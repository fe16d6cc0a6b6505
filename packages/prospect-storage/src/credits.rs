use serde_json::Value;
use sqlx::PgExecutor;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Result, db::Db};

pub async fn balance<'e, E>(executor: E, workspace_id: &str) -> Result<i64>
where
	E: PgExecutor<'e>,
{
	let balance: Option<i64> =
		sqlx::query_scalar("SELECT balance FROM credit_balances WHERE workspace_id = $1")
			.bind(workspace_id)
			.fetch_optional(executor)
			.await?;

	Ok(balance.unwrap_or(0))
}

/// Debits `amount` only when the balance covers it. Returns `false` and changes nothing otherwise.
pub async fn debit(
	db: &Db,
	workspace_id: &str,
	amount: i64,
	meta: &Value,
	now: OffsetDateTime,
) -> Result<bool> {
	let mut tx = db.pool.begin().await?;
	let result = sqlx::query(
		"\
UPDATE credit_balances
SET balance = balance - $1, updated_at = $2
WHERE workspace_id = $3 AND balance >= $1",
	)
	.bind(amount)
	.bind(now)
	.bind(workspace_id)
	.execute(&mut *tx)
	.await?;

	if result.rows_affected() != 1 {
		tx.rollback().await?;

		return Ok(false);
	}

	insert_transaction(&mut *tx, workspace_id, "use", amount, meta, now).await?;

	tx.commit().await?;

	Ok(true)
}

/// Adds `amount` to the balance, creating it when missing. `kind` is `grant` or `refund`.
pub async fn credit(
	db: &Db,
	workspace_id: &str,
	kind: &str,
	amount: i64,
	meta: &Value,
	now: OffsetDateTime,
) -> Result<i64> {
	let mut tx = db.pool.begin().await?;
	let balance: i64 = sqlx::query_scalar(
		"\
INSERT INTO credit_balances (workspace_id, balance, updated_at)
VALUES ($1,$2,$3)
ON CONFLICT (workspace_id) DO UPDATE
SET balance = credit_balances.balance + EXCLUDED.balance,
\tupdated_at = EXCLUDED.updated_at
RETURNING balance",
	)
	.bind(workspace_id)
	.bind(amount)
	.bind(now)
	.fetch_one(&mut *tx)
	.await?;

	insert_transaction(&mut *tx, workspace_id, kind, amount, meta, now).await?;

	tx.commit().await?;

	Ok(balance)
}

async fn insert_transaction<'e, E>(
	executor: E,
	workspace_id: &str,
	kind: &str,
	amount: i64,
	meta: &Value,
	now: OffsetDateTime,
) -> Result<()>
where
	E: PgExecutor<'e>,
{
	sqlx::query(
		"\
INSERT INTO credit_transactions (transaction_id, workspace_id, kind, amount, meta, created_at)
VALUES ($1,$2,$3,$4,$5,$6)",
	)
	.bind(Uuid::new_v4())
	.bind(workspace_id)
	.bind(kind)
	.bind(amount)
	.bind(meta)
	.bind(now)
	.execute(executor)
	.await?;

	Ok(())
}
