use std::path::PathBuf;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub proxy_pool: ProxyPool,
	pub account_health: AccountHealth,
	pub jobs: Jobs,
	pub retrieval: Retrieval,
	pub session: Session,
	pub security: Security,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Service {
	pub http_bind: String,
	pub admin_bind: String,
	pub log_level: String,
	/// Stable name for this deployment. Job ownership is recorded as `{instance_name}:{run id}`.
	#[serde(default = "default_instance_name")]
	pub instance_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Storage {
	pub postgres: Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProxyPool {
	/// Upstream username layout. `{username}` and `{session}` are substituted.
	#[serde(default = "default_sticky_username_template")]
	pub sticky_username_template: String,
	pub probe_url: String,
	pub probe_timeout_ms: u64,
	pub health_check_interval_seconds: u64,
	pub rotation_sweep_interval_seconds: u64,
	pub default_rotation_interval_hours: u32,
	/// Zero means a master proxy accepts any number of concurrent sticky sessions.
	#[serde(default)]
	pub master_max_sessions: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountHealth {
	pub pages_per_hour: u32,
	pub daily_captcha_cap: u32,
	pub cooldown_hours: u32,
	/// Offset used to decide where "local midnight" falls for the daily CAPTCHA counter.
	#[serde(default)]
	pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Jobs {
	pub daily_pull_limit: u32,
	pub max_results_cap: u32,
	pub lease_seconds: i64,
	pub stale_after_seconds: i64,
	#[serde(default = "default_credits_per_lead")]
	pub credits_per_lead: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Retrieval {
	pub api: RetrievalApi,
	pub browser: RetrievalBrowser,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalApi {
	#[serde(default = "default_true")]
	pub enabled: bool,
	pub api_base: String,
	pub search_path: String,
	pub page_size: u32,
	pub max_pages: u32,
	pub timeout_ms: u64,
	pub user_agent: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetrievalBrowser {
	pub landing_url: String,
	/// Direct people-search page used when the landing page offers no search box.
	#[serde(default)]
	pub search_url: Option<String>,
	pub page_size: u32,
	pub max_pages: u32,
	pub max_rotations: u32,
	pub rotation_delay_ms: u64,
	pub page_delay_min_ms: u64,
	pub page_delay_max_ms: u64,
	pub page_jitter_ms: u64,
	pub dwell_min_ms: u64,
	pub dwell_max_ms: u64,
	pub keystroke_delay_ms: u64,
	pub navigation_timeout_ms: u64,
	#[serde(default = "default_true")]
	pub headless: bool,
	pub executable: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Session {
	pub auth_cookie: String,
	pub csrf_cookie: Option<String>,
	pub cookie_domain: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Security {
	pub bind_localhost_only: bool,
	pub admin_auth_token: Option<String>,
}

fn default_instance_name() -> String {
	"prospect".to_string()
}

fn default_sticky_username_template() -> String {
	"{username}-session-{session}".to_string()
}

fn default_credits_per_lead() -> u32 {
	1
}

fn default_true() -> bool {
	true
}
