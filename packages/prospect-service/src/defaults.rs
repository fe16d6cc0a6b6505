//! Production implementations of the collaborator traits.

use std::{sync::Arc, time::Duration};

use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use prospect_config::{Config, RetrievalBrowser};
use prospect_domain::{
	job::SearchCriteria,
	lead::{self, Lead},
	proxy::{ProbeOutcome, ProxyEndpoint},
	session::{self, SessionCookie, SessionCookies},
};
use prospect_providers::{browser::ChromeSession, probe, search_api::SearchApiClient};
use prospect_storage::{credits, db::Db, leads, leads::NewLead, sessions};

use crate::{
	ActivityEmitter, BoxFuture, BrowserLauncher, BrowserSession, CredentialCipher, CreditLedger,
	Error, JobActivity, LeadSink, Providers, ProxyProbe, Result, SearchApi, SearchApiPage,
	SessionCredentialProvider, SinkOutcome,
};

pub(crate) fn providers(cfg: &Config, db: &Db) -> Result<Providers> {
	let cipher: Arc<dyn CredentialCipher> = Arc::new(PassthroughCipher);
	let search_api: Option<Arc<dyn SearchApi>> = if cfg.retrieval.api.enabled {
		Some(Arc::new(ReqwestSearchApi::new(cfg)?))
	} else {
		None
	};

	Ok(Providers {
		credentials: Arc::new(PostgresSessions { db: db.clone(), cipher: cipher.clone() }),
		cipher,
		ledger: Arc::new(PostgresLedger { db: db.clone() }),
		leads: Arc::new(PostgresLeadSink { db: db.clone() }),
		activity: Arc::new(TracingActivity),
		search_api,
		browser: Arc::new(ChromeLauncher {
			cfg: cfg.retrieval.browser.clone(),
			user_agent: cfg.retrieval.api.user_agent.clone(),
		}),
		probe: Arc::new(ReqwestProbe {
			probe_url: cfg.proxy_pool.probe_url.clone(),
			timeout_ms: cfg.proxy_pool.probe_timeout_ms,
		}),
	})
}

/// For deployments that seal credentials before they reach this service.
pub struct PassthroughCipher;
impl CredentialCipher for PassthroughCipher {
	fn encrypt(&self, plaintext: &str) -> Result<String> {
		Ok(plaintext.to_string())
	}

	fn decrypt(&self, sealed: &str) -> Result<String> {
		Ok(sealed.to_string())
	}
}

/// Cookies stored in `account_sessions` as a sealed JSON array.
pub struct PostgresSessions {
	pub db: Db,
	pub cipher: Arc<dyn CredentialCipher>,
}
impl SessionCredentialProvider for PostgresSessions {
	fn get<'a>(
		&'a self,
		workspace_id: &'a str,
		account_id: &'a str,
	) -> BoxFuture<'a, Result<Option<SessionCookies>>> {
		Box::pin(async move {
			let Some(row) = sessions::get(&self.db.pool, workspace_id, account_id).await? else {
				return Ok(None);
			};
			let payload = self.cipher.decrypt(&row.sealed_payload)?;
			let raw: Vec<SessionCookie> = serde_json::from_str(&payload)?;

			Ok(Some(SessionCookies {
				cookies: session::sanitize(raw, OffsetDateTime::now_utc()),
				ip_bound: row.ip_bound,
			}))
		})
	}

	fn store<'a>(
		&'a self,
		workspace_id: &'a str,
		account_id: &'a str,
		session: &'a SessionCookies,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let payload = serde_json::to_string(&session.cookies)?;
			let sealed = self.cipher.encrypt(&payload)?;

			sessions::upsert(
				&self.db.pool,
				workspace_id,
				account_id,
				&sealed,
				session.ip_bound,
				OffsetDateTime::now_utc(),
			)
			.await?;

			Ok(())
		})
	}
}

pub struct PostgresLedger {
	pub db: Db,
}
impl CreditLedger for PostgresLedger {
	fn has_enough_credits<'a>(
		&'a self,
		workspace_id: &'a str,
		amount: u32,
	) -> BoxFuture<'a, Result<bool>> {
		Box::pin(async move {
			let balance = credits::balance(&self.db.pool, workspace_id).await?;

			Ok(balance >= i64::from(amount))
		})
	}

	fn use_credits<'a>(
		&'a self,
		workspace_id: &'a str,
		amount: u32,
		meta: Value,
	) -> BoxFuture<'a, Result<bool>> {
		Box::pin(async move {
			if amount == 0 {
				return Ok(true);
			}

			let charged = credits::debit(
				&self.db,
				workspace_id,
				i64::from(amount),
				&meta,
				OffsetDateTime::now_utc(),
			)
			.await?;

			Ok(charged)
		})
	}

	fn refund<'a>(
		&'a self,
		workspace_id: &'a str,
		amount: u32,
		meta: Value,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			if amount == 0 {
				return Ok(());
			}

			credits::credit(
				&self.db,
				workspace_id,
				"refund",
				i64::from(amount),
				&meta,
				OffsetDateTime::now_utc(),
			)
			.await?;

			Ok(())
		})
	}
}

pub struct PostgresLeadSink {
	pub db: Db,
}
impl LeadSink for PostgresLeadSink {
	fn persist_and_dedupe<'a>(
		&'a self,
		workspace_id: &'a str,
		job_id: Uuid,
		leads: &'a [Lead],
	) -> BoxFuture<'a, Result<SinkOutcome>> {
		Box::pin(async move {
			let rows = leads
				.iter()
				.map(|item| NewLead {
					lead_id: lead::lead_id(workspace_id, &item.profile_url),
					profile_url: &item.profile_url,
					first_name: item.first_name.as_deref(),
					last_name: item.last_name.as_deref(),
					full_name: item.full_name.as_deref(),
					headline: item.headline.as_deref(),
					company: item.company.as_deref(),
					location: item.location.as_deref(),
					connection_degree: item.connection_degree.as_deref(),
					data_source: item.data_source.as_str(),
				})
				.collect::<Vec<_>>();
			let outcome = leads::insert_batch(
				&self.db,
				workspace_id,
				job_id,
				&rows,
				OffsetDateTime::now_utc(),
			)
			.await?;

			Ok(SinkOutcome {
				new_leads: outcome.new_in_workspace,
				appended: outcome.appended_to_job,
			})
		})
	}
}

/// Activity as structured events on the `prospect::activity` target.
pub struct TracingActivity;
impl ActivityEmitter for TracingActivity {
	fn emit(&self, activity: &JobActivity) {
		match activity {
			JobActivity::Started { job_id, workspace_id, account_id } => {
				tracing::info!(
					target: "prospect::activity",
					%job_id,
					workspace_id,
					account_id,
					"Job started."
				);
			},
			JobActivity::Progress { job_id, workspace_id, total_pulled, progress } => {
				tracing::info!(
					target: "prospect::activity",
					%job_id,
					workspace_id,
					total_pulled,
					progress,
					"Job progress."
				);
			},
			JobActivity::Completed { job_id, workspace_id, total_pulled, credits_used } => {
				tracing::info!(
					target: "prospect::activity",
					%job_id,
					workspace_id,
					total_pulled,
					credits_used,
					"Job completed."
				);
			},
			JobActivity::Failed { job_id, workspace_id, error } => {
				tracing::warn!(
					target: "prospect::activity",
					%job_id,
					workspace_id,
					error,
					"Job failed."
				);
			},
			JobActivity::RateLimited { job_id, workspace_id, reason } => {
				tracing::warn!(
					target: "prospect::activity",
					%job_id,
					workspace_id,
					reason,
					"Job rate limited."
				);
			},
		}
	}
}

pub struct ReqwestSearchApi {
	client: SearchApiClient,
}
impl ReqwestSearchApi {
	pub fn new(cfg: &Config) -> Result<Self> {
		Ok(Self { client: SearchApiClient::new(&cfg.retrieval.api, &cfg.session)? })
	}
}
impl SearchApi for ReqwestSearchApi {
	fn page_size(&self) -> u32 {
		self.client.page_size()
	}

	fn fetch_page<'a>(
		&'a self,
		cookies: &'a SessionCookies,
		criteria: &'a SearchCriteria,
		start: u32,
		count: u32,
	) -> BoxFuture<'a, Result<SearchApiPage>> {
		Box::pin(async move { Ok(self.client.fetch_page(cookies, criteria, start, count).await?) })
	}
}

pub struct ChromeLauncher {
	pub cfg: RetrievalBrowser,
	pub user_agent: String,
}
impl BrowserLauncher for ChromeLauncher {
	fn launch<'a>(
		&'a self,
		proxy: Option<&'a ProxyEndpoint>,
	) -> BoxFuture<'a, Result<Box<dyn BrowserSession>>> {
		Box::pin(async move {
			let session = ChromeSession::launch(&self.cfg, &self.user_agent, proxy).await?;
			let browser: Box<dyn BrowserSession> =
				Box::new(ChromeBrowser { session: Mutex::new(Some(session)) });

			Ok(browser)
		})
	}
}

/// Serializes access to one Chrome tab. Emptied by `close`.
pub struct ChromeBrowser {
	session: Mutex<Option<ChromeSession>>,
}
impl ChromeBrowser {
	fn closed() -> Error {
		Error::fatal("Browser session is already closed.")
	}
}
impl BrowserSession for ChromeBrowser {
	fn goto<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let guard = self.session.lock().await;
			let session = guard.as_ref().ok_or_else(Self::closed)?;

			Ok(session.goto(url).await?)
		})
	}

	fn wait_for_navigation(&self) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			let guard = self.session.lock().await;
			let session = guard.as_ref().ok_or_else(Self::closed)?;

			Ok(session.wait_for_navigation().await?)
		})
	}

	fn current_url(&self) -> BoxFuture<'_, Result<String>> {
		Box::pin(async move {
			let guard = self.session.lock().await;
			let session = guard.as_ref().ok_or_else(Self::closed)?;

			Ok(session.current_url().await?)
		})
	}

	fn content(&self) -> BoxFuture<'_, Result<String>> {
		Box::pin(async move {
			let guard = self.session.lock().await;
			let session = guard.as_ref().ok_or_else(Self::closed)?;

			Ok(session.content().await?)
		})
	}

	fn set_cookies<'a>(
		&'a self,
		cookies: &'a [SessionCookie],
		default_domain: &'a str,
	) -> BoxFuture<'a, Result<()>> {
		Box::pin(async move {
			let guard = self.session.lock().await;
			let session = guard.as_ref().ok_or_else(Self::closed)?;

			Ok(session.set_cookies(cookies, default_domain).await?)
		})
	}

	fn click<'a>(&'a self, selector: &'a str) -> BoxFuture<'a, Result<bool>> {
		Box::pin(async move {
			let guard = self.session.lock().await;
			let session = guard.as_ref().ok_or_else(Self::closed)?;

			Ok(session.click(selector).await?)
		})
	}

	fn type_text<'a>(
		&'a self,
		selector: &'a str,
		text: &'a str,
		delays: &'a [Duration],
	) -> BoxFuture<'a, Result<bool>> {
		Box::pin(async move {
			let guard = self.session.lock().await;
			let session = guard.as_ref().ok_or_else(Self::closed)?;

			Ok(session.type_text(selector, text, delays).await?)
		})
	}

	fn scroll_by(&self, pixels: u32) -> BoxFuture<'_, Result<()>> {
		Box::pin(async move {
			let guard = self.session.lock().await;
			let session = guard.as_ref().ok_or_else(Self::closed)?;

			Ok(session.scroll_by(pixels).await?)
		})
	}

	fn close(self: Box<Self>) -> BoxFuture<'static, ()> {
		Box::pin(async move {
			if let Some(session) = self.session.into_inner() {
				session.close().await;
			}
		})
	}
}

pub struct ReqwestProbe {
	pub probe_url: String,
	pub timeout_ms: u64,
}
impl ProxyProbe for ReqwestProbe {
	fn probe<'a>(&'a self, endpoint: &'a ProxyEndpoint) -> BoxFuture<'a, Result<ProbeOutcome>> {
		Box::pin(async move { Ok(probe::probe(endpoint, &self.probe_url, self.timeout_ms).await?) })
	}
}
