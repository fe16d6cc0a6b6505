const UNIQUE_VIOLATION: &str = "23505";

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Sqlx(#[from] sqlx::Error),
	#[error("Invalid argument: {0}")]
	InvalidArgument(String),
	#[error("Not found: {0}")]
	NotFound(String),
	#[error("Conflict: {0}")]
	Conflict(String),
}

/// Maps unique-constraint violations to [`Error::Conflict`] carrying the constraint name.
pub(crate) fn map_unique_violation(err: sqlx::Error) -> Error {
	if let sqlx::Error::Database(db_err) = &err
		&& db_err.code().as_deref() == Some(UNIQUE_VIOLATION)
	{
		return Error::Conflict(db_err.constraint().unwrap_or("unique constraint").to_string());
	}

	Error::Sqlx(err)
}
