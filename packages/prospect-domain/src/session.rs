use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct SessionCookie {
	pub name: String,
	pub value: String,
	#[serde(default)]
	pub domain: Option<String>,
	#[serde(default)]
	pub path: Option<String>,
	#[serde(default, with = "time::serde::rfc3339::option")]
	pub expires_at: Option<OffsetDateTime>,
	#[serde(default)]
	pub secure: bool,
	#[serde(default)]
	pub http_only: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct SessionCookies {
	pub cookies: Vec<SessionCookie>,
	/// The site pinned this session to the IP it was created from; skip proxies for it.
	#[serde(default)]
	pub ip_bound: bool,
}
impl SessionCookies {
	pub fn get(&self, name: &str) -> Option<&SessionCookie> {
		self.cookies.iter().find(|cookie| cookie.name == name)
	}

	pub fn has_auth(&self, auth_cookie: &str) -> bool {
		self.get(auth_cookie).is_some_and(|cookie| !cookie.value.is_empty())
	}

	pub fn header_value(&self) -> String {
		self.cookies
			.iter()
			.map(|cookie| format!("{}={}", cookie.name, cookie.value))
			.collect::<Vec<_>>()
			.join("; ")
	}
}

/// Trims names and values, strips wrapping quotes, drops blank or expired cookies and keeps the
/// last occurrence of each name in first-seen order.
pub fn sanitize(raw: Vec<SessionCookie>, now: OffsetDateTime) -> Vec<SessionCookie> {
	let mut order = Vec::new();
	let mut latest: HashMap<String, SessionCookie> = HashMap::new();

	for mut cookie in raw {
		cookie.name = cookie.name.trim().to_string();
		cookie.value = strip_quotes(cookie.value.trim()).to_string();

		if cookie.name.is_empty() || cookie.value.is_empty() {
			continue;
		}
		if cookie.expires_at.is_some_and(|expires| expires <= now) {
			continue;
		}
		if !latest.contains_key(&cookie.name) {
			order.push(cookie.name.clone());
		}

		latest.insert(cookie.name.clone(), cookie);
	}

	order.into_iter().filter_map(|name| latest.remove(&name)).collect()
}

fn strip_quotes(value: &str) -> &str {
	value
		.strip_prefix('"')
		.and_then(|inner| inner.strip_suffix('"'))
		.unwrap_or(value)
}
