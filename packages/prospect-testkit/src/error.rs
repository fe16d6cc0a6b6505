pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("PROSPECT_PG_DSN is not a valid Postgres DSN: {0}")]
	InvalidDsn(#[source] sqlx::Error),
	#[error("Neither maintenance database accepted a connection: {0}")]
	NoMaintenanceDatabase(#[source] sqlx::Error),
	#[error("Could not create scratch database {name}: {source}")]
	Create { name: String, source: sqlx::Error },
	#[error("Could not drop scratch database {name}: {source}")]
	Drop { name: String, source: sqlx::Error },
}
