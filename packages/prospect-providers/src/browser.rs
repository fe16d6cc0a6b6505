//! Headless Chrome driver over the DevTools protocol.

use std::time::Duration;

use chromiumoxide::{
	Browser, BrowserConfig, Page,
	cdp::browser_protocol::{
		fetch::{
			AuthChallengeResponse, AuthChallengeResponseResponse, ContinueRequestParams,
			ContinueWithAuthParams, EnableParams, EventAuthRequired, EventRequestPaused,
		},
		network::CookieParam,
	},
	error::CdpError,
};
use futures::StreamExt;
use tokio::{task::JoinHandle, time};

use prospect_config::RetrievalBrowser;
use prospect_domain::{proxy::ProxyEndpoint, session::SessionCookie};

use crate::{Error, Result};

const WINDOW: (u32, u32) = (1366, 768);
const LAUNCH_ARGS: [&str; 5] = [
	"--no-sandbox",
	"--disable-dev-shm-usage",
	"--no-first-run",
	"--disable-default-apps",
	"--lang=en-US",
];

pub struct ChromeSession {
	browser: Browser,
	page: Page,
	handler: JoinHandle<()>,
	proxy_auth: Option<JoinHandle<()>>,
	navigation_timeout: Duration,
}
impl ChromeSession {
	pub async fn launch(
		cfg: &RetrievalBrowser,
		user_agent: &str,
		proxy: Option<&ProxyEndpoint>,
	) -> Result<Self> {
		let mut builder = BrowserConfig::builder()
			.window_size(WINDOW.0, WINDOW.1)
			.args(LAUNCH_ARGS)
			.arg(format!("--user-agent={user_agent}"));

		if !cfg.headless {
			builder = builder.with_head();
		}
		if let Some(path) = cfg.executable.as_deref() {
			builder = builder.chrome_executable(path);
		}
		if let Some(proxy) = proxy {
			builder = builder.arg(format!("--proxy-server={}", proxy.server()));
		}

		let config = builder.build().map_err(|message| Error::InvalidConfig { message })?;
		let (mut browser, mut events) = Browser::launch(config).await?;
		let handler = tokio::spawn(async move {
			while let Some(event) = events.next().await {
				if let Err(err) = event {
					tracing::debug!(error = %err, "Browser event handling failed.");
				}
			}
		});
		let navigation_timeout = Duration::from_millis(cfg.navigation_timeout_ms);
		let setup = async {
			let page = browser.new_page("about:blank").await?;
			let proxy_auth = match proxy {
				Some(ProxyEndpoint { username: Some(username), password, .. }) => {
					let password = password.clone().unwrap_or_default();

					Some(install_proxy_auth(&page, username.clone(), password).await?)
				},
				_ => None,
			};

			Ok::<_, Error>((page, proxy_auth))
		}
		.await;

		match setup {
			Ok((page, proxy_auth)) =>
				Ok(Self { browser, page, handler, proxy_auth, navigation_timeout }),
			Err(err) => {
				if let Err(close_err) = browser.close().await {
					tracing::debug!(error = %close_err, "Browser close after failed setup errored.");
				}

				handler.abort();

				Err(err)
			},
		}
	}

	pub async fn goto(&self, url: &str) -> Result<()> {
		time::timeout(self.navigation_timeout, self.page.goto(url))
			.await
			.map_err(|_| self.timeout("navigating"))??;

		Ok(())
	}

	pub async fn wait_for_navigation(&self) -> Result<()> {
		time::timeout(self.navigation_timeout, self.page.wait_for_navigation())
			.await
			.map_err(|_| self.timeout("waiting for navigation"))??;

		Ok(())
	}

	pub async fn current_url(&self) -> Result<String> {
		Ok(self.page.url().await?.unwrap_or_default())
	}

	pub async fn content(&self) -> Result<String> {
		Ok(self.page.content().await?)
	}

	pub async fn set_cookies(&self, cookies: &[SessionCookie], default_domain: &str) -> Result<()> {
		let mut params = Vec::with_capacity(cookies.len());

		for cookie in cookies {
			let param = CookieParam::builder()
				.name(cookie.name.clone())
				.value(cookie.value.clone())
				.domain(cookie.domain.clone().unwrap_or_else(|| default_domain.to_string()))
				.path(cookie.path.clone().unwrap_or_else(|| "/".to_string()))
				.secure(cookie.secure)
				.http_only(cookie.http_only)
				.build()
				.map_err(|message| Error::InvalidConfig { message })?;

			params.push(param);
		}

		self.page.set_cookies(params).await?;

		Ok(())
	}

	/// Returns `false` when nothing matches `selector`.
	pub async fn click(&self, selector: &str) -> Result<bool> {
		match self.page.find_element(selector).await {
			Ok(element) => {
				element.scroll_into_view().await?;
				element.click().await?;

				Ok(true)
			},
			Err(CdpError::NotFound) => Ok(false),
			Err(err) => Err(err.into()),
		}
	}

	/// Types `text` one character at a time, sleeping `delays[i]` after character `i`.
	pub async fn type_text(&self, selector: &str, text: &str, delays: &[Duration]) -> Result<bool> {
		let element = match self.page.find_element(selector).await {
			Ok(element) => element,
			Err(CdpError::NotFound) => return Ok(false),
			Err(err) => return Err(err.into()),
		};

		element.click().await?;

		for (index, ch) in text.chars().enumerate() {
			element.type_str(ch.to_string()).await?;

			if let Some(delay) = delays.get(index) {
				time::sleep(*delay).await;
			}
		}

		element.press_key("Enter").await?;

		Ok(true)
	}

	pub async fn scroll_by(&self, pixels: u32) -> Result<()> {
		self.page.evaluate(format!("window.scrollBy(0, {pixels})")).await?;

		Ok(())
	}

	/// Closes the browser and stops background tasks. Errors are logged, never returned.
	pub async fn close(mut self) {
		if let Some(task) = self.proxy_auth.take() {
			task.abort();
		}
		if let Err(err) = self.browser.close().await {
			tracing::debug!(error = %err, "Browser close failed.");
		}
		if let Err(err) = self.browser.wait().await {
			tracing::debug!(error = %err, "Browser wait failed.");
		}

		self.handler.abort();
	}

	fn timeout(&self, action: &'static str) -> Error {
		Error::Timeout { action, millis: self.navigation_timeout.as_millis() as u64 }
	}
}

/// Answers proxy authentication challenges through the Fetch domain.
async fn install_proxy_auth(page: &Page, username: String, password: String) -> Result<JoinHandle<()>> {
	let mut auth_events = page.event_listener::<EventAuthRequired>().await?;
	let mut paused_events = page.event_listener::<EventRequestPaused>().await?;

	page.execute(EnableParams::builder().handle_auth_requests(true).build()).await?;

	let page = page.clone();

	Ok(tokio::spawn(async move {
		loop {
			tokio::select! {
				Some(event) = auth_events.next() => {
					let response = AuthChallengeResponse {
						response: AuthChallengeResponseResponse::ProvideCredentials,
						username: Some(username.clone()),
						password: Some(password.clone()),
					};

					if let Err(err) = page
						.execute(ContinueWithAuthParams::new(event.request_id.clone(), response))
						.await
					{
						tracing::debug!(error = %err, "Proxy auth response failed.");
					}
				},
				Some(event) = paused_events.next() => {
					if let Err(err) =
						page.execute(ContinueRequestParams::new(event.request_id.clone())).await
					{
						tracing::debug!(error = %err, "Continuing paused request failed.");
					}
				},
				else => break,
			}
		}
	}))
}
