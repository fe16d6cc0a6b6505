use std::time::Duration;

use reqwest::{
	Client, StatusCode,
	header::{ACCEPT, COOKIE, HeaderMap, HeaderValue, LOCATION},
	redirect::Policy,
};
use serde_json::Value;

use prospect_config::{RetrievalApi, Session};
use prospect_domain::{job::SearchCriteria, session::SessionCookies};

use crate::{Error, Result};

const UPSTREAM_THROTTLE_STATUS: u16 = 999;
const LOGIN_MARKERS: &[&str] = &["/login", "/authwall", "/uas/"];

#[derive(Debug)]
pub enum SearchApiPage {
	Page(Value),
	AuthFailed { status: u16 },
	RateLimited { status: u16 },
}

pub struct SearchApiClient {
	client: Client,
	api: RetrievalApi,
	csrf_cookie: Option<String>,
}
impl SearchApiClient {
	pub fn new(api: &RetrievalApi, session: &Session) -> Result<Self> {
		let client = Client::builder()
			.timeout(Duration::from_millis(api.timeout_ms))
			.user_agent(api.user_agent.as_str())
			.redirect(Policy::none())
			.build()?;

		Ok(Self { client, api: api.clone(), csrf_cookie: session.csrf_cookie.clone() })
	}

	pub fn page_size(&self) -> u32 {
		self.api.page_size
	}

	pub async fn fetch_page(
		&self,
		cookies: &SessionCookies,
		criteria: &SearchCriteria,
		start: u32,
		count: u32,
	) -> Result<SearchApiPage> {
		let url = format!("{}{}", self.api.api_base, self.api.search_path);
		let res = self
			.client
			.get(url)
			.headers(self.headers(cookies)?)
			.query(&query_params(criteria, start, count))
			.send()
			.await?;
		let status = res.status();

		if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
			return Ok(SearchApiPage::AuthFailed { status: status.as_u16() });
		}
		if status.is_redirection() {
			let location = res
				.headers()
				.get(LOCATION)
				.and_then(|value| value.to_str().ok())
				.unwrap_or_default();

			if LOGIN_MARKERS.iter().any(|marker| location.contains(marker)) {
				return Ok(SearchApiPage::AuthFailed { status: status.as_u16() });
			}

			return Err(Error::InvalidResponse {
				message: format!("Search API redirected unexpectedly with status {status}."),
			});
		}
		if status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == UPSTREAM_THROTTLE_STATUS {
			return Ok(SearchApiPage::RateLimited { status: status.as_u16() });
		}
		if !status.is_success() {
			return Err(Error::InvalidResponse {
				message: format!("Search API returned status {}.", status.as_u16()),
			});
		}

		Ok(SearchApiPage::Page(res.json().await?))
	}

	fn headers(&self, cookies: &SessionCookies) -> Result<HeaderMap> {
		let mut headers = HeaderMap::new();

		headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
		headers.insert("x-restli-protocol-version", HeaderValue::from_static("2.0.0"));
		headers.insert(COOKIE, cookies.header_value().parse()?);

		if let Some(token) =
			self.csrf_cookie.as_deref().and_then(|name| cookies.get(name)).map(|c| c.value.as_str())
		{
			headers.insert("csrf-token", token.parse()?);
		}

		Ok(headers)
	}
}

fn query_params(criteria: &SearchCriteria, start: u32, count: u32) -> Vec<(&'static str, String)> {
	let mut filters = vec!["resultType->PEOPLE".to_string()];

	if !criteria.network.is_empty() {
		let codes = criteria.network.iter().map(|degree| degree.code()).collect::<Vec<_>>();

		filters.push(format!("network->{}", codes.join("|")));
	}
	if let Some(title) = criteria.title.as_deref().filter(|title| !title.trim().is_empty()) {
		filters.push(format!("title->{}", title.trim()));
	}
	if let Some(company) = criteria.company.as_deref().filter(|company| !company.trim().is_empty()) {
		filters.push(format!("company->{}", company.trim()));
	}
	if let Some(location) =
		criteria.location.as_deref().filter(|location| !location.trim().is_empty())
	{
		filters.push(format!("geo->{}", location.trim()));
	}

	vec![
		("q", "all".to_string()),
		("keywords", criteria.keywords.trim().to_string()),
		("filters", format!("List({})", filters.join(","))),
		("start", start.to_string()),
		("count", count.to_string()),
	]
}

#[cfg(test)]
mod tests {
	use prospect_domain::job::NetworkDegree;

	use super::*;

	#[test]
	fn query_params_encode_filters() {
		let criteria = SearchCriteria {
			keywords: " founder ".to_string(),
			title: Some("CEO".to_string()),
			location: Some("  ".to_string()),
			network: vec![NetworkDegree::First, NetworkDegree::Second],
			..Default::default()
		};
		let params = query_params(&criteria, 20, 10);

		assert_eq!(params[1], ("keywords", "founder".to_string()));
		assert_eq!(params[2].1, "List(resultType->PEOPLE,network->F|S,title->CEO)");
		assert_eq!(params[3], ("start", "20".to_string()));
	}
}
