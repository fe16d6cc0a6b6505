use time::OffsetDateTime;

use prospect_domain::{
	failure::{self, FailureKind},
	job::InvalidTransition,
};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error("Quota exceeded: {message}")]
	QuotaExceeded { message: String },
	#[error("Session invalid: {message}")]
	SessionInvalid { message: String },
	#[error("Proxy unavailable: {message}")]
	ProxyUnavailable { message: String },
	#[error("Proxy transient failure: {message}")]
	ProxyTransient { message: String },
	#[error("Challenge detected: {message}")]
	ChallengeDetected { message: String },
	#[error("No results extracted: {message}")]
	ExtractionEmpty { message: String },
	#[error("Rate limited: {message}")]
	RateLimited { message: String, retry_at: Option<OffsetDateTime> },
	#[error("Account busy: {message}")]
	AccountBusy { message: String },
	#[error("Invalid request: {message}")]
	InvalidRequest { message: String },
	#[error("Not found: {message}")]
	NotFound { message: String },
	#[error("Conflict: {message}")]
	Conflict { message: String },
	#[error("Invalid transition: {message}")]
	InvalidTransition { message: String },
	#[error("Storage error: {message}")]
	Storage { message: String },
	#[error("Provider error: {message}")]
	Provider { message: String },
	#[error("{message}")]
	Fatal { message: String },
}
impl Error {
	/// Stable machine-readable code used by the HTTP surfaces.
	pub fn code(&self) -> &'static str {
		match self {
			Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
			Self::SessionInvalid { .. } => "SESSION_INVALID",
			Self::ProxyUnavailable { .. } => "PROXY_UNAVAILABLE",
			Self::ProxyTransient { .. } => "PROXY_TRANSIENT",
			Self::ChallengeDetected { .. } => "CHALLENGE_DETECTED",
			Self::ExtractionEmpty { .. } => "EXTRACTION_EMPTY",
			Self::RateLimited { .. } => "RATE_LIMITED",
			Self::AccountBusy { .. } => "ACCOUNT_BUSY",
			Self::InvalidRequest { .. } => "INVALID_REQUEST",
			Self::NotFound { .. } => "NOT_FOUND",
			Self::Conflict { .. } => "CONFLICT",
			Self::InvalidTransition { .. } => "INVALID_TRANSITION",
			Self::Storage { .. } => "STORAGE_ERROR",
			Self::Provider { .. } => "PROVIDER_ERROR",
			Self::Fatal { .. } => "FATAL",
		}
	}

	pub fn invalid(message: impl Into<String>) -> Self {
		Self::InvalidRequest { message: message.into() }
	}

	pub fn not_found(message: impl Into<String>) -> Self {
		Self::NotFound { message: message.into() }
	}

	pub fn fatal(message: impl Into<String>) -> Self {
		Self::Fatal { message: message.into() }
	}

	/// Maps a raw failure message onto the taxonomy through the signature classifier.
	pub fn classified(message: impl Into<String>) -> Self {
		let message = message.into();

		match failure::classify(&message) {
			FailureKind::ProxyTransient => Self::ProxyTransient { message },
			FailureKind::Challenge => Self::ChallengeDetected { message },
			FailureKind::SessionInvalid => Self::SessionInvalid { message },
			FailureKind::RateLimited => Self::RateLimited { message, retry_at: None },
			FailureKind::Fatal => Self::Provider { message },
		}
	}

	pub fn is_transient(&self) -> bool {
		matches!(self, Self::ProxyTransient { .. })
	}
}
impl From<prospect_storage::Error> for Error {
	fn from(err: prospect_storage::Error) -> Self {
		match err {
			prospect_storage::Error::Sqlx(inner) => Self::Storage { message: inner.to_string() },
			prospect_storage::Error::InvalidArgument(message) => Self::InvalidRequest { message },
			prospect_storage::Error::NotFound(message) => Self::NotFound { message },
			prospect_storage::Error::Conflict(message) => Self::Conflict { message },
		}
	}
}
impl From<sqlx::Error> for Error {
	fn from(err: sqlx::Error) -> Self {
		Self::Storage { message: err.to_string() }
	}
}
impl From<prospect_providers::Error> for Error {
	fn from(err: prospect_providers::Error) -> Self {
		match err {
			prospect_providers::Error::InvalidConfig { message } => Self::Fatal { message },
			other => Self::classified(other.to_string()),
		}
	}
}
impl From<InvalidTransition> for Error {
	fn from(err: InvalidTransition) -> Self {
		Self::InvalidTransition { message: err.to_string() }
	}
}
impl From<serde_json::Error> for Error {
	fn from(err: serde_json::Error) -> Self {
		Self::Fatal { message: format!("Malformed JSON payload: {err}") }
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn classified_messages_land_in_the_taxonomy() {
		assert!(Error::classified("net::ERR_TUNNEL_CONNECTION_FAILED at page.goto").is_transient());
		assert!(matches!(
			Error::classified("Redirected to /checkpoint/challenge"),
			Error::ChallengeDetected { .. }
		));
		assert!(matches!(Error::classified("Hit the authwall"), Error::SessionInvalid { .. }));
		assert!(matches!(Error::classified("selector missing"), Error::Provider { .. }));
	}
}
