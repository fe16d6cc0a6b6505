use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::job::DataSource;

const PROFILE_SEGMENT: &str = "in";

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Lead {
	pub profile_url: String,
	pub first_name: Option<String>,
	pub last_name: Option<String>,
	pub full_name: Option<String>,
	pub headline: Option<String>,
	pub company: Option<String>,
	pub location: Option<String>,
	pub connection_degree: Option<String>,
	pub data_source: DataSource,
}
impl Lead {
	/// Builds a lead from a display name, deriving name parts and the headline company.
	pub fn from_parts(
		profile_url: String,
		full_name: Option<String>,
		headline: Option<String>,
		location: Option<String>,
		connection_degree: Option<String>,
		data_source: DataSource,
	) -> Self {
		let full_name = full_name.and_then(clean_text);
		let headline = headline.and_then(clean_text);
		let (first_name, last_name) = full_name.as_deref().map(split_name).unwrap_or((None, None));
		let company = headline.as_deref().and_then(company_from_headline);

		Self {
			profile_url,
			first_name,
			last_name,
			full_name,
			headline,
			company,
			location: location.and_then(clean_text),
			connection_degree: connection_degree.and_then(|degree| normalize_degree(&degree)),
			data_source,
		}
	}
}

/// Canonical `https://host/in/<slug>` form, or `None` when the link is not a profile page.
///
/// Relative links are resolved against `base`.
pub fn normalize_profile_url(raw: &str, base: &Url) -> Option<String> {
	let trimmed = raw.trim();

	if trimmed.is_empty() {
		return None;
	}

	let parsed = base.join(trimmed).ok()?;

	if !matches!(parsed.scheme(), "http" | "https") {
		return None;
	}

	let host = parsed.host_str()?.to_ascii_lowercase();
	let mut segments = parsed.path_segments()?.filter(|segment| !segment.is_empty());

	segments.find(|segment| *segment == PROFILE_SEGMENT)?;

	let slug = segments.next()?;

	Some(format!("https://{host}/{PROFILE_SEGMENT}/{}", slug.to_ascii_lowercase()))
}

pub fn lead_id(workspace_id: &str, normalized_profile_url: &str) -> Uuid {
	let key = format!("{workspace_id}:{normalized_profile_url}");

	Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

pub fn split_name(full_name: &str) -> (Option<String>, Option<String>) {
	let mut parts = full_name.split_whitespace();
	let first = parts.next().map(str::to_string);
	let rest = parts.collect::<Vec<_>>().join(" ");
	let last = if rest.is_empty() { None } else { Some(rest) };

	(first, last)
}

/// Pulls the employer out of headlines shaped like `Title at Company` or `Title @ Company`.
pub fn company_from_headline(headline: &str) -> Option<String> {
	let lower = headline.to_ascii_lowercase();
	let (index, separator_len) = [" at ", " @ "]
		.into_iter()
		.filter_map(|separator| lower.rfind(separator).map(|index| (index, separator.len())))
		.max_by_key(|(index, _)| *index)?;
	let company = headline.get(index + separator_len..)?;
	let company = company.split(['|', '·', ',']).next().unwrap_or_default().trim();

	if company.is_empty() { None } else { Some(company.to_string()) }
}

/// Maps `1st`, `2nd`, `3rd+` and `• 2nd` style badges to a compact form.
pub fn normalize_degree(raw: &str) -> Option<String> {
	let digits = raw.chars().filter(char::is_ascii_digit).collect::<String>();

	match digits.as_str() {
		"1" => Some("1st".to_string()),
		"2" => Some("2nd".to_string()),
		"3" => Some("3rd".to_string()),
		_ => None,
	}
}

fn clean_text(raw: String) -> Option<String> {
	let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");

	if collapsed.is_empty() { None } else { Some(collapsed) }
}
