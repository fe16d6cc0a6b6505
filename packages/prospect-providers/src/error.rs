pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	SerdeJson(#[from] serde_json::Error),
	#[error(transparent)]
	InvalidHeaderValue(#[from] reqwest::header::InvalidHeaderValue),
	#[error(transparent)]
	Url(#[from] url::ParseError),
	#[error("Browser error: {0}")]
	Browser(Box<chromiumoxide::error::CdpError>),
	#[error("{message}")]
	InvalidConfig { message: String },
	#[error("{message}")]
	InvalidResponse { message: String },
	#[error("Timed out after {millis} ms while {action}.")]
	Timeout { action: &'static str, millis: u64 },
}
impl From<chromiumoxide::error::CdpError> for Error {
	fn from(err: chromiumoxide::error::CdpError) -> Self {
		Self::Browser(Box::new(err))
	}
}
