use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
	Pending,
	Running,
	Paused,
	Completed,
	Failed,
	RateLimited,
	Interrupted,
}
impl JobStatus {
	pub const ALL: [Self; 7] = [
		Self::Pending,
		Self::Running,
		Self::Paused,
		Self::Completed,
		Self::Failed,
		Self::RateLimited,
		Self::Interrupted,
	];

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Pending => "pending",
			Self::Running => "running",
			Self::Paused => "paused",
			Self::Completed => "completed",
			Self::Failed => "failed",
			Self::RateLimited => "rate_limited",
			Self::Interrupted => "interrupted",
		}
	}

	/// Statuses that imply a runner task should exist somewhere.
	pub fn is_active(self) -> bool {
		matches!(self, Self::Pending | Self::Running)
	}

	pub fn is_restartable(self) -> bool {
		matches!(self, Self::Interrupted | Self::Failed | Self::RateLimited)
	}
}
impl fmt::Display for JobStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for JobStatus {
	type Err = UnknownStatus;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		Self::ALL
			.into_iter()
			.find(|status| status.as_str() == raw)
			.ok_or_else(|| UnknownStatus(raw.to_string()))
	}
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEvent {
	Start,
	Pause,
	Resume,
	Cancel,
	Complete,
	Fail,
	RateLimit,
	Interrupt,
	Restart,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, thiserror::Error)]
#[error("Cannot apply {event:?} to a job in status {from}.")]
pub struct InvalidTransition {
	pub from: JobStatus,
	pub event: JobEvent,
}

#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
#[error("Unknown status {0:?}.")]
pub struct UnknownStatus(pub String);

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
	Api,
	Browser,
}
impl DataSource {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Api => "api",
			Self::Browser => "browser",
		}
	}
}
impl FromStr for DataSource {
	type Err = UnknownStatus;

	fn from_str(raw: &str) -> Result<Self, Self::Err> {
		match raw {
			"api" => Ok(Self::Api),
			"browser" => Ok(Self::Browser),
			other => Err(UnknownStatus(other.to_string())),
		}
	}
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SearchCriteria {
	#[serde(default)]
	pub keywords: String,
	#[serde(default)]
	pub title: Option<String>,
	#[serde(default)]
	pub company: Option<String>,
	#[serde(default)]
	pub location: Option<String>,
	/// Connection degrees to include, e.g. `["F", "S"]`. Empty means any.
	#[serde(default)]
	pub network: Vec<NetworkDegree>,
}
impl SearchCriteria {
	pub fn is_empty(&self) -> bool {
		self.keywords.trim().is_empty()
			&& [&self.title, &self.company, &self.location]
				.into_iter()
				.all(|field| field.as_deref().map(str::trim).unwrap_or_default().is_empty())
	}

	/// Single free-text query used when the UI only offers one search box.
	pub fn query_text(&self) -> String {
		[Some(self.keywords.as_str()), self.title.as_deref(), self.company.as_deref()]
			.into_iter()
			.flatten()
			.map(str::trim)
			.filter(|part| !part.is_empty())
			.collect::<Vec<_>>()
			.join(" ")
	}
}

#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum NetworkDegree {
	#[serde(rename = "F")]
	First,
	#[serde(rename = "S")]
	Second,
	#[serde(rename = "O")]
	Third,
}
impl NetworkDegree {
	pub fn code(self) -> &'static str {
		match self {
			Self::First => "F",
			Self::Second => "S",
			Self::Third => "O",
		}
	}
}

pub fn transition(from: JobStatus, event: JobEvent) -> Result<JobStatus, InvalidTransition> {
	use JobEvent::*;
	use JobStatus::*;

	let next = match (from, event) {
		(Pending, Start) => Running,
		(Pending, Fail | Cancel) => Failed,
		(Pending, Interrupt) => Interrupted,
		(Running, Complete) => Completed,
		(Running, Fail | Cancel) => Failed,
		(Running, RateLimit) => RateLimited,
		(Running, Pause) => Paused,
		(Running, Interrupt) => Interrupted,
		(Paused, Resume) => Running,
		(Paused, Cancel) => Failed,
		(Interrupted | Failed | RateLimited, Restart) => Running,
		_ => return Err(InvalidTransition { from, event }),
	};

	Ok(next)
}

pub fn progress_percent(pulled: u32, target: u32) -> u8 {
	if target == 0 {
		return 100;
	}

	((u64::from(pulled) * 100 / u64::from(target)).min(100)) as u8
}
