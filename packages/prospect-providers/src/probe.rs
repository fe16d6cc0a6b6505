use std::time::{Duration, Instant};

use reqwest::{Client, Proxy};

use prospect_domain::proxy::{ProbeOutcome, ProxyEndpoint};

use crate::Result;

const PROBE_USER_AGENT: &str =
	"Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

/// Issues one GET to `probe_url` through `endpoint` and times it.
///
/// Transport failures and non-success statuses both count as a failed probe; only client
/// construction errors are returned as `Err`.
pub async fn probe(endpoint: &ProxyEndpoint, probe_url: &str, timeout_ms: u64) -> Result<ProbeOutcome> {
	let mut proxy = Proxy::all(endpoint.server())?;

	if let Some(username) = endpoint.username.as_deref() {
		proxy = proxy.basic_auth(username, endpoint.password.as_deref().unwrap_or_default());
	}

	let client = Client::builder()
		.proxy(proxy)
		.timeout(Duration::from_millis(timeout_ms))
		.user_agent(PROBE_USER_AGENT)
		.build()?;
	let started = Instant::now();
	let outcome = match client.get(probe_url).send().await {
		Ok(res) if res.status().is_success() => ProbeOutcome {
			success: true,
			latency_ms: Some(started.elapsed().as_millis().min(u128::from(u32::MAX)) as u32),
		},
		Ok(res) => {
			tracing::debug!(host = %endpoint.host, status = %res.status(), "Proxy probe rejected.");

			ProbeOutcome { success: false, latency_ms: None }
		},
		Err(err) => {
			tracing::debug!(host = %endpoint.host, error = %err, "Proxy probe failed.");

			ProbeOutcome { success: false, latency_ms: None }
		},
	};

	Ok(outcome)
}
