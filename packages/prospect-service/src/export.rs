use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use prospect_storage::models::Lead;

use crate::{Error, Result};

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
	#[default]
	Ndjson,
	Json,
}
impl ExportFormat {
	pub fn content_type(self) -> &'static str {
		match self {
			Self::Ndjson => "application/x-ndjson",
			Self::Json => "application/json",
		}
	}
}
impl FromStr for ExportFormat {
	type Err = Error;

	fn from_str(raw: &str) -> Result<Self> {
		match raw.trim().to_ascii_lowercase().as_str() {
			"ndjson" | "jsonl" => Ok(Self::Ndjson),
			"json" => Ok(Self::Json),
			other => Err(Error::invalid(format!("Unsupported export format {other:?}."))),
		}
	}
}

/// A job's leads rendered in fetch order.
#[derive(Clone, Debug)]
pub struct Export {
	pub format: ExportFormat,
	pub count: usize,
	pub body: String,
}
impl Export {
	pub fn render(format: ExportFormat, leads: &[Lead]) -> Result<Self> {
		let records = leads.iter().map(ExportedLead::from).collect::<Vec<_>>();
		let body = match format {
			ExportFormat::Json => serde_json::to_string(&records)?,
			ExportFormat::Ndjson => {
				let mut body = String::new();

				for record in &records {
					body.push_str(&serde_json::to_string(record)?);
					body.push('\n');
				}

				body
			},
		};

		Ok(Self { format, count: records.len(), body })
	}

	pub fn content_type(&self) -> &'static str {
		self.format.content_type()
	}
}

#[derive(Debug, Serialize)]
struct ExportedLead<'a> {
	lead_id: Uuid,
	profile_url: &'a str,
	first_name: Option<&'a str>,
	last_name: Option<&'a str>,
	full_name: Option<&'a str>,
	headline: Option<&'a str>,
	company: Option<&'a str>,
	location: Option<&'a str>,
	connection_degree: Option<&'a str>,
	data_source: &'a str,
	#[serde(with = "time::serde::rfc3339")]
	created_at: OffsetDateTime,
}
impl<'a> From<&'a Lead> for ExportedLead<'a> {
	fn from(lead: &'a Lead) -> Self {
		Self {
			lead_id: lead.lead_id,
			profile_url: &lead.profile_url,
			first_name: lead.first_name.as_deref(),
			last_name: lead.last_name.as_deref(),
			full_name: lead.full_name.as_deref(),
			headline: lead.headline.as_deref(),
			company: lead.company.as_deref(),
			location: lead.location.as_deref(),
			connection_degree: lead.connection_degree.as_deref(),
			data_source: &lead.data_source,
			created_at: lead.created_at,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn lead(url: &str) -> Lead {
		Lead {
			lead_id: Uuid::new_v4(),
			workspace_id: "ws".to_string(),
			profile_url: url.to_string(),
			first_name: Some("Ada".to_string()),
			last_name: None,
			full_name: Some("Ada".to_string()),
			headline: None,
			company: None,
			location: None,
			connection_degree: Some("2nd".to_string()),
			data_source: "api".to_string(),
			created_at: OffsetDateTime::UNIX_EPOCH,
		}
	}

	#[test]
	fn ndjson_has_one_line_per_lead_in_order() {
		let leads = [lead("https://example.com/in/a"), lead("https://example.com/in/b")];
		let export = Export::render(ExportFormat::Ndjson, &leads).expect("Render failed.");
		let lines = export.body.lines().collect::<Vec<_>>();

		assert_eq!(export.count, 2);
		assert_eq!(lines.len(), 2);
		assert!(lines[0].contains("/in/a"));
		assert!(lines[1].contains("/in/b"));
		assert!(!lines[0].contains("workspace_id"));
	}

	#[test]
	fn json_renders_an_array() {
		let export = Export::render(ExportFormat::Json, &[]).expect("Render failed.");

		assert_eq!(export.body, "[]");
		assert_eq!(export.content_type(), "application/json");
	}

	#[test]
	fn format_parses_case_insensitively() {
		assert_eq!("NDJSON".parse::<ExportFormat>().expect("Parse failed."), ExportFormat::Ndjson);
		assert!("csv".parse::<ExportFormat>().is_err());
	}
}
