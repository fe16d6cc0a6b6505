pub mod control;
pub mod defaults;
pub mod export;
pub mod health;
pub mod jobs;
pub mod pipeline;
pub mod proxy_pool;
pub mod recovery;

mod error;
mod runner;

pub use error::{Error, Result};
pub use export::{Export, ExportFormat};
pub use health::{AccountHealthTracker, HealthStats};
pub use jobs::{CreateJobRequest, JobView, SearchJobManager};
pub use pipeline::{
	BatchOutcome, JobCounters, PipelineHost, PipelineSettings, RetrievalPipeline, RunOutcome,
	RunRequest,
};
pub use prospect_providers::search_api::SearchApiPage;
pub use proxy_pool::{AddProxyRequest, HealthCheckReport, ProxyAssignment, ProxyPool, ProxyView};
pub use recovery::{RecoveryCoordinator, RecoveryReport};

use std::{future::Future, pin::Pin, sync::Arc, time::Duration};

use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

use prospect_config::Config;
use prospect_domain::{
	job::SearchCriteria,
	lead::Lead,
	proxy::{ProbeOutcome, ProxyEndpoint},
	session::{SessionCookie, SessionCookies},
};
use prospect_storage::db::Db;

use crate::runner::{Engine, JobRegistry};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Source of the site session cookies a job runs with.
pub trait SessionCredentialProvider
where
	Self: Send + Sync,
{
	/// Sanitized cookies for the account, or `None` when no session is stored.
	fn get<'a>(
		&'a self,
		workspace_id: &'a str,
		account_id: &'a str,
	) -> BoxFuture<'a, Result<Option<SessionCookies>>>;

	fn store<'a>(
		&'a self,
		workspace_id: &'a str,
		account_id: &'a str,
		session: &'a SessionCookies,
	) -> BoxFuture<'a, Result<()>>;
}

/// Opaque sealing of stored secrets.
pub trait CredentialCipher
where
	Self: Send + Sync,
{
	fn encrypt(&self, plaintext: &str) -> Result<String>;

	fn decrypt(&self, sealed: &str) -> Result<String>;
}

pub trait CreditLedger
where
	Self: Send + Sync,
{
	fn has_enough_credits<'a>(&'a self, workspace_id: &'a str, amount: u32)
	-> BoxFuture<'a, Result<bool>>;

	/// Debits `amount`. Returns `false` without charging anything when the balance is short.
	fn use_credits<'a>(
		&'a self,
		workspace_id: &'a str,
		amount: u32,
		meta: Value,
	) -> BoxFuture<'a, Result<bool>>;

	fn refund<'a>(
		&'a self,
		workspace_id: &'a str,
		amount: u32,
		meta: Value,
	) -> BoxFuture<'a, Result<()>>;
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SinkOutcome {
	/// Leads never stored before in the workspace. Only these are charged.
	pub new_leads: u32,
	/// Leads newly linked to the job's ordered result list.
	pub appended: u32,
}

pub trait LeadSink
where
	Self: Send + Sync,
{
	fn persist_and_dedupe<'a>(
		&'a self,
		workspace_id: &'a str,
		job_id: Uuid,
		leads: &'a [Lead],
	) -> BoxFuture<'a, Result<SinkOutcome>>;
}

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobActivity {
	Started { job_id: Uuid, workspace_id: String, account_id: String },
	Progress { job_id: Uuid, workspace_id: String, total_pulled: u32, progress: u8 },
	Completed { job_id: Uuid, workspace_id: String, total_pulled: u32, credits_used: u32 },
	Failed { job_id: Uuid, workspace_id: String, error: String },
	RateLimited { job_id: Uuid, workspace_id: String, reason: String },
}

/// Best-effort notification sink. Implementations must not block.
pub trait ActivityEmitter
where
	Self: Send + Sync,
{
	fn emit(&self, activity: &JobActivity);
}

/// Tier 1 source.
pub trait SearchApi
where
	Self: Send + Sync,
{
	fn page_size(&self) -> u32;

	fn fetch_page<'a>(
		&'a self,
		cookies: &'a SessionCookies,
		criteria: &'a SearchCriteria,
		start: u32,
		count: u32,
	) -> BoxFuture<'a, Result<SearchApiPage>>;
}

/// Tier 2 driver. One launched session per retrieval attempt.
pub trait BrowserLauncher
where
	Self: Send + Sync,
{
	fn launch<'a>(
		&'a self,
		proxy: Option<&'a ProxyEndpoint>,
	) -> BoxFuture<'a, Result<Box<dyn BrowserSession>>>;
}

pub trait BrowserSession
where
	Self: Send + Sync,
{
	fn goto<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<()>>;

	fn wait_for_navigation(&self) -> BoxFuture<'_, Result<()>>;

	fn current_url(&self) -> BoxFuture<'_, Result<String>>;

	fn content(&self) -> BoxFuture<'_, Result<String>>;

	fn set_cookies<'a>(
		&'a self,
		cookies: &'a [SessionCookie],
		default_domain: &'a str,
	) -> BoxFuture<'a, Result<()>>;

	/// Returns `false` when nothing matches `selector`.
	fn click<'a>(&'a self, selector: &'a str) -> BoxFuture<'a, Result<bool>>;

	/// Types `text` one key at a time and submits. Returns `false` when the field is missing.
	fn type_text<'a>(
		&'a self,
		selector: &'a str,
		text: &'a str,
		delays: &'a [Duration],
	) -> BoxFuture<'a, Result<bool>>;

	fn scroll_by(&self, pixels: u32) -> BoxFuture<'_, Result<()>>;

	/// Always releases the browser. Never fails.
	fn close(self: Box<Self>) -> BoxFuture<'static, ()>;
}

pub trait ProxyProbe
where
	Self: Send + Sync,
{
	fn probe<'a>(&'a self, endpoint: &'a ProxyEndpoint) -> BoxFuture<'a, Result<ProbeOutcome>>;
}

#[derive(Clone)]
pub struct Providers {
	pub credentials: Arc<dyn SessionCredentialProvider>,
	pub cipher: Arc<dyn CredentialCipher>,
	pub ledger: Arc<dyn CreditLedger>,
	pub leads: Arc<dyn LeadSink>,
	pub activity: Arc<dyn ActivityEmitter>,
	/// `None` skips Tier 1 entirely.
	pub search_api: Option<Arc<dyn SearchApi>>,
	pub browser: Arc<dyn BrowserLauncher>,
	pub probe: Arc<dyn ProxyProbe>,
}
impl Providers {
	/// Postgres-backed stores, reqwest clients and headless Chrome.
	pub fn postgres_defaults(cfg: &Config, db: &Db) -> Result<Self> {
		defaults::providers(cfg, db)
	}
}

pub struct ProspectService {
	pub cfg: Arc<Config>,
	pub db: Db,
	pub providers: Providers,
	pub proxy_pool: ProxyPool,
	pub health: AccountHealthTracker,
	pub jobs: SearchJobManager,
	pub recovery: RecoveryCoordinator,
	instance_id: Arc<str>,
}
impl ProspectService {
	pub fn new(cfg: Config, db: Db) -> Result<Self> {
		let providers = Providers::postgres_defaults(&cfg, &db)?;

		Self::with_providers(cfg, db, providers)
	}

	pub fn with_providers(cfg: Config, db: Db, providers: Providers) -> Result<Self> {
		let cfg = Arc::new(cfg);
		let instance_id: Arc<str> =
			format!("{}:{}", cfg.service.instance_name, Uuid::new_v4().simple()).into();
		let proxy_pool = ProxyPool::new(db.clone(), &cfg.proxy_pool, providers.cipher.clone());
		let health = AccountHealthTracker::new(db.clone(), &cfg.account_health);
		let settings = PipelineSettings::from_config(&cfg)?;
		let pipeline = Arc::new(RetrievalPipeline::new(settings, &providers));
		let engine = Engine {
			cfg: cfg.clone(),
			db: db.clone(),
			providers: providers.clone(),
			proxy_pool: proxy_pool.clone(),
			health: health.clone(),
			pipeline,
			registry: JobRegistry::default(),
			instance_id: instance_id.clone(),
		};
		let jobs = SearchJobManager::new(engine.clone());
		let recovery = RecoveryCoordinator::new(engine);

		Ok(Self { cfg, db, providers, proxy_pool, health, jobs, recovery, instance_id })
	}

	/// `{instance_name}:{run id}` recorded as the owner of jobs started by this process.
	pub fn instance_id(&self) -> &str {
		&self.instance_id
	}
}
