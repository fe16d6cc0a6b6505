//! Scratch Postgres databases for the ignored integration tests.
//!
//! Each [`TestDatabase`] is created from `PROSPECT_PG_DSN` under a random name and dropped on
//! [`TestDatabase::cleanup`], or from `Drop` when a test panics first.

mod error;

pub use error::{Error, Result};

use std::{str::FromStr, thread};

use sqlx::{
	ConnectOptions, Connection,
	postgres::{PgConnectOptions, PgConnection},
};
use uuid::Uuid;

pub const DSN_ENV: &str = "PROSPECT_PG_DSN";

const NAME_PREFIX: &str = "prospect_it";
const MAINTENANCE_DATABASE: &str = "postgres";
const FALLBACK_MAINTENANCE_DATABASE: &str = "template1";

/// Reads the base DSN. Tests skip themselves when it is unset.
pub fn env_dsn() -> Option<String> {
	std::env::var(DSN_ENV).ok().filter(|dsn| !dsn.trim().is_empty())
}

pub struct TestDatabase {
	dsn: String,
	scratch: Scratch,
	dropped: bool,
}
impl TestDatabase {
	pub async fn new(base_dsn: &str) -> Result<Self> {
		let base = PgConnectOptions::from_str(base_dsn).map_err(Error::InvalidDsn)?;
		let (maintenance, mut conn) = Scratch::maintenance_connection(&base).await?;
		let scratch = Scratch {
			name: format!("{NAME_PREFIX}_{}", Uuid::new_v4().simple()),
			maintenance,
		};

		sqlx::raw_sql(&format!("CREATE DATABASE \"{}\"", scratch.name))
			.execute(&mut conn)
			.await
			.map_err(|source| Error::Create { name: scratch.name.clone(), source })?;

		let dsn = base.database(&scratch.name).to_url_lossy().to_string();

		Ok(Self { dsn, scratch, dropped: false })
	}

	pub fn dsn(&self) -> &str {
		&self.dsn
	}

	pub async fn cleanup(mut self) -> Result<()> {
		self.dropped = true;

		self.scratch.drop_database().await
	}
}
impl Drop for TestDatabase {
	fn drop(&mut self) {
		if self.dropped {
			return;
		}

		// Drop may run inside a current-thread runtime, so the async teardown gets its own.
		let scratch = self.scratch.clone();
		let teardown = thread::spawn(move || {
			let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
				Ok(runtime) => runtime,
				Err(err) => {
					eprintln!("Could not start a runtime to drop {}: {err}.", scratch.name);

					return;
				},
			};

			if let Err(err) = runtime.block_on(scratch.drop_database()) {
				eprintln!("{err}.");
			}
		});

		if teardown.join().is_err() {
			eprintln!("Scratch database teardown panicked.");
		}
	}
}

#[derive(Clone)]
struct Scratch {
	name: String,
	maintenance: PgConnectOptions,
}
impl Scratch {
	/// `postgres` first, then `template1` for hosts that hide the former.
	async fn maintenance_connection(
		base: &PgConnectOptions,
	) -> Result<(PgConnectOptions, PgConnection)> {
		let primary = base.clone().database(MAINTENANCE_DATABASE);

		if let Ok(conn) = PgConnection::connect_with(&primary).await {
			return Ok((primary, conn));
		}

		let fallback = base.clone().database(FALLBACK_MAINTENANCE_DATABASE);
		let conn =
			PgConnection::connect_with(&fallback).await.map_err(Error::NoMaintenanceDatabase)?;

		Ok((fallback, conn))
	}

	/// `WITH (FORCE)` closes pool connections a test leaked; needs Postgres 13 or newer.
	async fn drop_database(&self) -> Result<()> {
		let fail = |source| Error::Drop { name: self.name.clone(), source };
		let mut conn = PgConnection::connect_with(&self.maintenance).await.map_err(fail)?;

		sqlx::raw_sql(&format!("DROP DATABASE IF EXISTS \"{}\" WITH (FORCE)", self.name))
			.execute(&mut conn)
			.await
			.map_err(fail)?;

		conn.close().await.map_err(fail)
	}
}
