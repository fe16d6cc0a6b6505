//! Tiered retrieval for one job run.
//!
//! Tier 1 pages through the structured search API. Tier 2 drives a real browser and only runs
//! when Tier 1 extracted nothing. Every page goes through the account health gate first, and
//! every batch is persisted, charged and checkpointed before the next page is requested.

use std::{sync::Arc, time::Duration};

use rand::{SeedableRng, rngs::StdRng};
use tokio::sync::watch;
use url::Url;
use uuid::Uuid;

use prospect_config::Config;
use prospect_domain::{
	cadence::Cadence,
	health::HealthDecision,
	job::{self, DataSource, SearchCriteria},
	lead::Lead,
	proxy::ProxyEndpoint,
	session::SessionCookies,
};
use prospect_extract::{
	api::{self, ApiPage},
	challenge, dom,
	dom::ResultsPage,
};

use crate::{
	BoxFuture, BrowserLauncher, BrowserSession, Error, Providers, Result, SearchApi,
	SearchApiPage, SessionCredentialProvider,
	control::{self, Control, Stop},
};

/// Consecutive empty API pages that end Tier 1.
const MAX_EMPTY_API_PAGES: u32 = 2;

/// Everything a run needs from its surroundings: health gate, proxies, persistence.
pub trait PipelineHost
where
	Self: Send + Sync,
{
	fn check_health(&self) -> BoxFuture<'_, Result<HealthDecision>>;

	fn record_page_load(&self) -> BoxFuture<'_, Result<()>>;

	fn record_challenge(&self) -> BoxFuture<'_, Result<()>>;

	fn acquire_proxy(&self) -> BoxFuture<'_, Result<ProxyEndpoint>>;

	/// New sticky session on the current proxy.
	fn rotate_proxy(&self) -> BoxFuture<'_, Result<ProxyEndpoint>>;

	/// Persists and dedupes `leads`, then charges credits for the newly stored ones.
	fn persist_batch<'a>(&'a self, leads: &'a [Lead]) -> BoxFuture<'a, Result<BatchOutcome>>;

	fn save_progress<'a>(&'a self, counters: &'a JobCounters) -> BoxFuture<'a, Result<()>>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BatchOutcome {
	pub appended: u32,
	pub new_leads: u32,
	pub credits_charged: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct JobCounters {
	pub target: u32,
	pub total_found: u32,
	pub total_pulled: u32,
	pub credits_used: u32,
	pub data_source: Option<DataSource>,
}
impl JobCounters {
	pub fn progress(&self) -> u8 {
		job::progress_percent(self.total_pulled, self.target)
	}

	pub fn remaining(&self) -> u32 {
		self.target.saturating_sub(self.total_pulled)
	}
}

#[derive(Clone, Debug)]
pub struct RunRequest {
	pub job_id: Uuid,
	pub workspace_id: String,
	pub account_id: String,
	pub criteria: SearchCriteria,
	/// Starting point. `total_pulled` doubles as the resume offset.
	pub counters: JobCounters,
}

#[derive(Debug)]
pub enum RunOutcome {
	Completed(JobCounters),
	/// Challenge or health gate. The job becomes `rate_limited`.
	RateLimited { counters: JobCounters, message: String },
	Failed { counters: JobCounters, error: Error },
	Stopped { counters: JobCounters, stop: Stop },
}
impl RunOutcome {
	pub fn counters(&self) -> &JobCounters {
		match self {
			Self::Completed(counters)
			| Self::RateLimited { counters, .. }
			| Self::Failed { counters, .. }
			| Self::Stopped { counters, .. } => counters,
		}
	}
}

#[derive(Clone, Debug)]
pub struct PipelineSettings {
	pub api_enabled: bool,
	pub api_max_pages: u32,
	pub browser_page_size: u32,
	pub browser_max_pages: u32,
	pub max_rotations: u32,
	pub landing_url: String,
	pub search_url: Option<String>,
	pub auth_cookie: String,
	pub cookie_domain: String,
	/// Base for resolving relative profile links.
	pub site_base: Url,
	pub cadence: Cadence,
}
impl PipelineSettings {
	pub fn from_config(cfg: &Config) -> Result<Self> {
		let browser = &cfg.retrieval.browser;
		let site_base = Url::parse(&browser.landing_url).map_err(|err| {
			Error::fatal(format!("retrieval.browser.landing_url is not a valid URL: {err}."))
		})?;

		Ok(Self {
			api_enabled: cfg.retrieval.api.enabled,
			api_max_pages: cfg.retrieval.api.max_pages,
			browser_page_size: browser.page_size,
			browser_max_pages: browser.max_pages,
			max_rotations: browser.max_rotations,
			landing_url: browser.landing_url.clone(),
			search_url: browser.search_url.clone(),
			auth_cookie: cfg.session.auth_cookie.clone(),
			cookie_domain: cfg.session.cookie_domain.clone(),
			site_base,
			cadence: Cadence::from_config(browser),
		})
	}
}

/// Early exit from a run: either a stop request or an error.
enum Halt {
	Stop(Stop),
	Fail(Error),
}
impl From<Stop> for Halt {
	fn from(stop: Stop) -> Self {
		Self::Stop(stop)
	}
}
impl From<Error> for Halt {
	fn from(err: Error) -> Self {
		Self::Fail(err)
	}
}

/// What one rendered results page yielded. Parsed synchronously; the DOM never crosses an await.
struct Harvest {
	leads: Vec<Lead>,
	has_next: bool,
	no_results_banner: bool,
}

/// Per-run state threaded through both tiers.
struct Run<'a> {
	req: &'a RunRequest,
	host: &'a dyn PipelineHost,
	control: watch::Receiver<Control>,
	cookies: SessionCookies,
	counters: JobCounters,
	rng: StdRng,
}

pub struct RetrievalPipeline {
	settings: PipelineSettings,
	credentials: Arc<dyn SessionCredentialProvider>,
	search_api: Option<Arc<dyn SearchApi>>,
	browser: Arc<dyn BrowserLauncher>,
}
impl RetrievalPipeline {
	pub fn new(settings: PipelineSettings, providers: &Providers) -> Self {
		Self {
			settings,
			credentials: providers.credentials.clone(),
			search_api: providers.search_api.clone(),
			browser: providers.browser.clone(),
		}
	}

	pub async fn run(
		&self,
		req: &RunRequest,
		host: &dyn PipelineHost,
		control: watch::Receiver<Control>,
	) -> RunOutcome {
		let cookies = match self.load_session(req).await {
			Ok(cookies) => cookies,
			Err(error) => return RunOutcome::Failed { counters: req.counters.clone(), error },
		};
		let mut run = Run {
			req,
			host,
			control,
			cookies,
			counters: req.counters.clone(),
			rng: StdRng::from_os_rng(),
		};
		let result = self.run_tiers(&mut run).await;
		let counters = run.counters;

		// Challenges surface both from page markup and from classified provider errors.
		if let Err(Halt::Fail(Error::ChallengeDetected { .. })) = &result
			&& let Err(err) = host.record_challenge().await
		{
			tracing::warn!(job_id = %req.job_id, error = %err, "Failed to record challenge.");
		}

		match result {
			Ok(()) => RunOutcome::Completed(counters),
			Err(Halt::Stop(stop)) => RunOutcome::Stopped { counters, stop },
			Err(Halt::Fail(
				Error::ChallengeDetected { message } | Error::RateLimited { message, .. },
			)) => RunOutcome::RateLimited { counters, message },
			Err(Halt::Fail(error)) => RunOutcome::Failed { counters, error },
		}
	}

	async fn load_session(&self, req: &RunRequest) -> Result<SessionCookies> {
		let cookies = self
			.credentials
			.get(&req.workspace_id, &req.account_id)
			.await?
			.ok_or_else(|| Error::SessionInvalid {
				message: format!(
					"No session is stored for {}/{}.",
					req.workspace_id, req.account_id
				),
			})?;

		if !cookies.has_auth(&self.settings.auth_cookie) {
			return Err(Error::SessionInvalid {
				message: format!("Session is missing the {} cookie.", self.settings.auth_cookie),
			});
		}

		Ok(cookies)
	}

	async fn run_tiers(&self, run: &mut Run<'_>) -> Result<(), Halt> {
		if run.counters.remaining() == 0 {
			return Ok(());
		}
		if self.settings.api_enabled
			&& let Some(search_api) = self.search_api.as_deref()
		{
			let extracted = self.run_api_tier(search_api, run).await?;

			if extracted > 0 {
				return Ok(());
			}

			tracing::info!(
				job_id = %run.req.job_id,
				"Structured search returned nothing; falling back to the browser."
			);
		}

		self.run_browser_tier(run).await
	}

	/// Returns how many leads the API tier extracted, before dedupe.
	async fn run_api_tier(
		&self,
		search_api: &dyn SearchApi,
		run: &mut Run<'_>,
	) -> Result<u32, Halt> {
		let page_size = search_api.page_size().max(1);
		let mut start = run.counters.total_pulled;
		let mut empty_pages = 0;
		let mut extracted = 0;

		for _ in 0..self.settings.api_max_pages {
			if run.counters.remaining() == 0 {
				break;
			}

			self.ensure_allowed(run).await?;

			let fetch = search_api.fetch_page(&run.cookies, &run.req.criteria, start, page_size);
			let page = match control::interruptible(&mut run.control, fetch).await? {
				Ok(page) => page,
				Err(err @ (Error::SessionInvalid { .. } | Error::ChallengeDetected { .. })) =>
					return Err(err.into()),
				Err(err) => {
					tracing::warn!(
						job_id = %run.req.job_id,
						start,
						error = %err,
						"Structured search request failed; ending the API tier."
					);

					break;
				},
			};
			let json = match page {
				SearchApiPage::Page(json) => json,
				SearchApiPage::AuthFailed { status } =>
					return Err(Error::SessionInvalid {
						message: format!("Search API rejected the session with status {status}."),
					}
					.into()),
				SearchApiPage::RateLimited { status } => {
					tracing::info!(
						job_id = %run.req.job_id,
						status,
						pulled = run.counters.total_pulled,
						"Structured search throttled; keeping partial results."
					);

					break;
				},
			};

			run.host.record_page_load().await?;

			if let Some(total) = api::total_results(&json) {
				run.counters.total_found = run.counters.total_found.max(total);
			}

			let page = ApiPage { json, base: self.settings.site_base.clone() };
			let extraction = api::extract_page(&page);

			start += page_size;

			if extraction.is_empty() {
				empty_pages += 1;

				if empty_pages >= MAX_EMPTY_API_PAGES {
					break;
				}

				continue;
			}

			empty_pages = 0;
			extracted += extraction.leads.len() as u32;

			tracing::debug!(
				job_id = %run.req.job_id,
				strategy = extraction.strategy.unwrap_or_default(),
				count = extraction.leads.len(),
				"API page extracted."
			);

			self.absorb(run, extraction.leads, DataSource::Api).await?;
		}

		Ok(extracted)
	}

	/// Runs browser attempts, rotating the sticky session after each transient failure.
	async fn run_browser_tier(&self, run: &mut Run<'_>) -> Result<(), Halt> {
		let max_attempts = self.settings.max_rotations.max(1);
		let mut proxy =
			if run.cookies.ip_bound { None } else { Some(run.host.acquire_proxy().await?) };
		let mut attempt = 1;

		loop {
			let err = match self.browse(run, proxy.as_ref()).await {
				Err(Halt::Fail(err)) if err.is_transient() => err,
				other => return other,
			};

			if attempt >= max_attempts {
				return Err(Error::ProxyTransient {
					message: format!(
						"Proxy rotation exhausted after {attempt} attempt(s); last error: {err}"
					),
				}
				.into());
			}

			tracing::warn!(
				job_id = %run.req.job_id,
				attempt,
				error = %err,
				"Transient proxy failure; rotating sticky session."
			);

			if proxy.is_some() {
				proxy = Some(run.host.rotate_proxy().await?);
			}

			attempt += 1;

			control::sleep(&mut run.control, self.settings.cadence.rotation_delay()).await?;
		}
	}

	async fn browse(&self, run: &mut Run<'_>, proxy: Option<&ProxyEndpoint>) -> Result<(), Halt> {
		let session = self.browser.launch(proxy).await?;
		let result = self.drive(run, session.as_ref()).await;

		session.close().await;

		result
	}

	async fn drive(&self, run: &mut Run<'_>, session: &dyn BrowserSession) -> Result<(), Halt> {
		let cadence = &self.settings.cadence;

		session.set_cookies(&run.cookies.cookies, &self.settings.cookie_domain).await?;

		self.ensure_allowed(run).await?;

		session.goto(&self.settings.landing_url).await?;
		run.host.record_page_load().await?;

		self.check_landing(run, session).await?;

		let dwell = cadence.dwell(&mut run.rng);

		control::sleep(&mut run.control, dwell).await?;

		for pixels in cadence.scroll_steps(&mut run.rng) {
			session.scroll_by(pixels).await?;

			let pause = cadence.dwell(&mut run.rng) / 4;

			control::sleep(&mut run.control, pause).await?;
		}

		self.submit_query(run, session).await?;

		let page_size = self.settings.browser_page_size.max(1);
		let resume_page = run.counters.total_pulled / page_size + 1;

		// Pages already counted are walked, not harvested. Each one is still a real load.
		for _ in 1..resume_page {
			self.load_page(run, session).await?;

			if !self.next_page(run, session).await? {
				return Ok(());
			}
		}

		let mut first_page = true;

		for _ in 0..self.settings.browser_max_pages {
			let (url, html) = self.load_page(run, session).await?;
			let harvest = match self.harvest(&html) {
				Ok(harvest) => harvest,
				Err(Error::ExtractionEmpty { message }) => {
					if first_page && challenge::is_auth_wall(&url, &html) {
						return Err(Error::SessionInvalid {
							message: "First results page was an authentication wall.".to_string(),
						}
						.into());
					}

					tracing::info!(
						job_id = %run.req.job_id,
						reason = %message,
						"Results exhausted."
					);

					return Ok(());
				},
				Err(err) => return Err(err.into()),
			};

			first_page = false;

			self.absorb(run, harvest.leads, DataSource::Browser).await?;

			if run.counters.remaining() == 0 || !harvest.has_next {
				return Ok(());
			}
			if !self.next_page(run, session).await? {
				return Ok(());
			}
		}

		Ok(())
	}

	/// Charges the current page against the hourly budget and halts on a challenge.
	async fn load_page(
		&self,
		run: &mut Run<'_>,
		session: &dyn BrowserSession,
	) -> Result<(String, String), Halt> {
		let html = session.content().await?;
		let url = session.current_url().await?;

		run.host.record_page_load().await?;

		if challenge::detect_challenge(&url, &html).is_some() {
			return Err(challenged(&url).into());
		}

		Ok((url, html))
	}

	/// Humanized delay, health gate, then a click on "next". `false` when there is no next page.
	async fn next_page(
		&self,
		run: &mut Run<'_>,
		session: &dyn BrowserSession,
	) -> Result<bool, Halt> {
		let delay = self.settings.cadence.page_delay(&mut run.rng);

		control::sleep(&mut run.control, delay).await?;

		self.ensure_allowed(run).await?;

		if !session.click(dom::NEXT_BUTTON).await? {
			return Ok(false);
		}

		session.wait_for_navigation().await?;

		Ok(true)
	}

	async fn check_landing(
		&self,
		run: &mut Run<'_>,
		session: &dyn BrowserSession,
	) -> Result<(), Halt> {
		let html = session.content().await?;
		let url = session.current_url().await?;

		if challenge::detect_challenge(&url, &html).is_some() {
			return Err(challenged(&url).into());
		}
		if challenge::is_auth_wall(&url, &html) {
			return Err(Error::SessionInvalid {
				message: format!("Landing page redirected to an authentication wall ({url})."),
			}
			.into());
		}

		Ok(())
	}

	/// Types the query into the search box like a person would. Falls back to the configured
	/// search URL when the landing page has no search box.
	async fn submit_query(
		&self,
		run: &mut Run<'_>,
		session: &dyn BrowserSession,
	) -> Result<(), Halt> {
		let cadence = &self.settings.cadence;
		let query = run.req.criteria.query_text();
		let delays = query.chars().map(|_| cadence.keystroke(&mut run.rng)).collect::<Vec<_>>();

		self.ensure_allowed(run).await?;

		if session.type_text(dom::SEARCH_BOX, &query, &delays).await? {
			session.wait_for_navigation().await?;

			let dwell = cadence.dwell(&mut run.rng);

			control::sleep(&mut run.control, dwell).await?;

			if session.click(dom::PEOPLE_FILTER).await? {
				session.wait_for_navigation().await?;
			}

			return Ok(());
		}

		let Some(search_url) = self.settings.search_url.as_deref() else {
			return Err(Error::fatal(
				"Search box not found on the landing page and no search_url is configured.",
			)
			.into());
		};
		let url = people_search_url(search_url, &run.req.criteria)?;

		tracing::debug!(job_id = %run.req.job_id, "Search box missing; navigating to search URL.");

		session.goto(url.as_str()).await?;

		Ok(())
	}

	fn harvest(&self, html: &str) -> Result<Harvest> {
		let page = ResultsPage::parse(html, self.settings.site_base.clone());
		let extraction = dom::extract_page(&page);
		let harvest = Harvest {
			has_next: dom::has_next_page(&page),
			no_results_banner: dom::shows_no_results(&page),
			leads: extraction.leads,
		};

		if harvest.leads.is_empty() {
			let message = if harvest.no_results_banner {
				"Results page reports no matches."
			} else {
				"No extraction strategy matched the results page."
			};

			return Err(Error::ExtractionEmpty { message: message.to_string() });
		}

		Ok(harvest)
	}

	async fn ensure_allowed(&self, run: &mut Run<'_>) -> Result<(), Halt> {
		control::check(&run.control)?;

		let decision = run.host.check_health().await?;

		match decision.reason {
			Some(reason) if !decision.allowed => Err(Error::RateLimited {
				message: reason.message(),
				retry_at: Some(reason.retry_at()),
			}
			.into()),
			_ => Ok(()),
		}
	}

	/// Persist, charge, checkpoint. Chunks are sized to what is still missing so leads already
	/// linked to the job do not eat into the target.
	async fn absorb(
		&self,
		run: &mut Run<'_>,
		leads: Vec<Lead>,
		source: DataSource,
	) -> Result<(), Halt> {
		let mut pending = leads.as_slice();

		while run.counters.remaining() > 0 && !pending.is_empty() {
			let take = (run.counters.remaining() as usize).min(pending.len());
			let (chunk, rest) = pending.split_at(take);
			let batch = run.host.persist_batch(chunk).await?;

			pending = rest;
			run.counters.total_pulled += batch.appended;
			run.counters.credits_used += batch.credits_charged;
			run.counters.total_found = run.counters.total_found.max(run.counters.total_pulled);
			run.counters.data_source = Some(source);

			run.host.save_progress(&run.counters).await?;
		}

		Ok(())
	}
}

fn challenged(url: &str) -> Error {
	Error::ChallengeDetected { message: format!("Bot challenge encountered at {url}.") }
}

/// `search_url?keywords=…&network=["F","S"]` for the people vertical.
fn people_search_url(search_url: &str, criteria: &SearchCriteria) -> Result<Url> {
	let mut url = Url::parse(search_url)
		.map_err(|err| Error::fatal(format!("retrieval.browser.search_url is invalid: {err}.")))?;

	{
		let mut pairs = url.query_pairs_mut();

		pairs.append_pair("keywords", &criteria.query_text());
		pairs.append_pair("origin", "GLOBAL_SEARCH_HEADER");

		if !criteria.network.is_empty() {
			let codes = criteria
				.network
				.iter()
				.map(|degree| format!("\"{}\"", degree.code()))
				.collect::<Vec<_>>();

			pairs.append_pair("network", &format!("[{}]", codes.join(",")));
		}
	}

	Ok(url)
}

#[cfg(test)]
mod tests {
	use prospect_domain::job::NetworkDegree;

	use super::*;

	#[test]
	fn search_url_carries_query_and_network() {
		let criteria = SearchCriteria {
			keywords: "founder".to_string(),
			company: Some("Acme".to_string()),
			network: vec![NetworkDegree::First, NetworkDegree::Second],
			..Default::default()
		};
		let url =
			people_search_url("https://www.example-network.com/search/results/people/", &criteria)
				.expect("Valid search URL.");
		let pairs = url.query_pairs().into_owned().collect::<Vec<_>>();

		assert!(pairs.contains(&("keywords".to_string(), "founder Acme".to_string())));
		assert!(pairs.contains(&("network".to_string(), "[\"F\",\"S\"]".to_string())));
	}

	#[test]
	fn counters_report_remaining_and_progress() {
		let counters = JobCounters {
			target: 40,
			total_found: 0,
			total_pulled: 10,
			credits_used: 10,
			data_source: None,
		};

		assert_eq!(counters.remaining(), 30);
		assert_eq!(counters.progress(), 25);
	}
}
