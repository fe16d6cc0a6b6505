mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	AccountHealth, Config, Jobs, Postgres, ProxyPool, Retrieval, RetrievalApi, RetrievalBrowser,
	Security, Service, Session, Storage,
};

use std::{fs, path::Path};

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;
	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.storage.postgres.dsn.trim().is_empty() {
		return Err(Error::invalid("storage.postgres.dsn", "must be non-empty."));
	}
	if cfg.storage.postgres.pool_max_conns == 0 {
		return Err(Error::invalid("storage.postgres.pool_max_conns", "must be greater than zero."));
	}
	if cfg.service.http_bind.trim().is_empty() || cfg.service.admin_bind.trim().is_empty() {
		return Err(Error::invalid("service", "http_bind and admin_bind must be non-empty."));
	}
	if cfg.service.instance_name.trim().is_empty() || cfg.service.instance_name.contains(':') {
		return Err(Error::invalid(
			"service.instance_name",
			"must be non-empty and must not contain ':'.",
		));
	}

	validate_proxy_pool(&cfg.proxy_pool)?;

	let health = &cfg.account_health;

	if health.pages_per_hour == 0 {
		return Err(Error::invalid("account_health.pages_per_hour", "must be greater than zero."));
	}
	if health.daily_captcha_cap == 0 {
		return Err(Error::invalid(
			"account_health.daily_captcha_cap",
			"must be greater than zero.",
		));
	}
	if health.cooldown_hours == 0 {
		return Err(Error::invalid("account_health.cooldown_hours", "must be greater than zero."));
	}
	if !(-720..=840).contains(&health.utc_offset_minutes) {
		return Err(Error::invalid(
			"account_health.utc_offset_minutes",
			"must be within -720 and 840.",
		));
	}

	let jobs = &cfg.jobs;

	if jobs.daily_pull_limit == 0 {
		return Err(Error::invalid("jobs.daily_pull_limit", "must be greater than zero."));
	}
	if jobs.max_results_cap == 0 {
		return Err(Error::invalid("jobs.max_results_cap", "must be greater than zero."));
	}
	if jobs.lease_seconds <= 0 {
		return Err(Error::invalid("jobs.lease_seconds", "must be greater than zero."));
	}
	if jobs.stale_after_seconds < 0 {
		return Err(Error::invalid("jobs.stale_after_seconds", "must be zero or greater."));
	}
	if jobs.credits_per_lead == 0 {
		return Err(Error::invalid("jobs.credits_per_lead", "must be greater than zero."));
	}

	validate_retrieval(&cfg.retrieval)?;

	if cfg.session.auth_cookie.trim().is_empty() {
		return Err(Error::invalid("session.auth_cookie", "must be non-empty."));
	}

	Ok(())
}

fn validate_proxy_pool(pool: &ProxyPool) -> Result<()> {
	if !pool.sticky_username_template.contains("{session}") {
		return Err(Error::invalid(
			"proxy_pool.sticky_username_template",
			"must contain the {session} placeholder.",
		));
	}
	if !pool.probe_url.starts_with("http://") && !pool.probe_url.starts_with("https://") {
		return Err(Error::invalid("proxy_pool.probe_url", "must be an http(s) URL."));
	}
	if pool.probe_timeout_ms == 0 {
		return Err(Error::invalid("proxy_pool.probe_timeout_ms", "must be greater than zero."));
	}
	if pool.health_check_interval_seconds < 30 {
		return Err(Error::invalid(
			"proxy_pool.health_check_interval_seconds",
			"must be at least 30.",
		));
	}
	if pool.rotation_sweep_interval_seconds == 0 {
		return Err(Error::invalid(
			"proxy_pool.rotation_sweep_interval_seconds",
			"must be greater than zero.",
		));
	}

	Ok(())
}

fn validate_retrieval(retrieval: &Retrieval) -> Result<()> {
	let api = &retrieval.api;

	if api.enabled {
		if api.api_base.trim().is_empty() {
			return Err(Error::invalid(
				"retrieval.api.api_base",
				"must be non-empty when enabled.",
			));
		}
		if !(1..=50).contains(&api.page_size) {
			return Err(Error::invalid("retrieval.api.page_size", "must be in the range 1-50."));
		}
		if api.max_pages == 0 {
			return Err(Error::invalid("retrieval.api.max_pages", "must be greater than zero."));
		}
	}

	let browser = &retrieval.browser;

	if browser.landing_url.trim().is_empty() {
		return Err(Error::invalid("retrieval.browser.landing_url", "must be non-empty."));
	}
	if browser.page_size == 0 {
		return Err(Error::invalid("retrieval.browser.page_size", "must be greater than zero."));
	}
	if browser.max_pages == 0 {
		return Err(Error::invalid("retrieval.browser.max_pages", "must be greater than zero."));
	}
	if browser.max_rotations == 0 {
		return Err(Error::invalid(
			"retrieval.browser.max_rotations",
			"must be greater than zero.",
		));
	}
	if browser.page_delay_min_ms > browser.page_delay_max_ms {
		return Err(Error::invalid(
			"retrieval.browser.page_delay_min_ms",
			"must not exceed page_delay_max_ms.",
		));
	}
	if browser.dwell_min_ms > browser.dwell_max_ms {
		return Err(Error::invalid(
			"retrieval.browser.dwell_min_ms",
			"must not exceed dwell_max_ms.",
		));
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	if cfg.security.admin_auth_token.as_deref().map(|token| token.trim().is_empty()).unwrap_or(false)
	{
		cfg.security.admin_auth_token = None;
	}
	if cfg.session.csrf_cookie.as_deref().map(|name| name.trim().is_empty()).unwrap_or(false) {
		cfg.session.csrf_cookie = None;
	}
	if cfg.retrieval.browser.search_url.as_deref().map(|url| url.trim().is_empty()).unwrap_or(false) {
		cfg.retrieval.browser.search_url = None;
	}
	if cfg
		.retrieval
		.browser
		.executable
		.as_deref()
		.map(|path| path.as_os_str().is_empty())
		.unwrap_or(false)
	{
		cfg.retrieval.browser.executable = None;
	}

	cfg.retrieval.api.api_base = cfg.retrieval.api.api_base.trim_end_matches('/').to_string();
}
