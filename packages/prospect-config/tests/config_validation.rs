use std::{
	env, fs,
	path::PathBuf,
	sync::atomic::{AtomicU64, Ordering},
	time::{SystemTime, UNIX_EPOCH},
};

use toml::{Table, Value};

use prospect_config::{Config, Error};

const SAMPLE_CONFIG_TOML: &str = include_str!("fixtures/sample_config.toml");

static COUNTER: AtomicU64 = AtomicU64::new(0);

fn write_temp_config(payload: &str) -> PathBuf {
	let nanos = SystemTime::now().duration_since(UNIX_EPOCH).expect("Clock before epoch.").as_nanos();
	let seq = COUNTER.fetch_add(1, Ordering::SeqCst);
	let path = env::temp_dir().join(format!("prospect_config_{nanos}_{seq}.toml"));

	fs::write(&path, payload).expect("Failed to write temp config.");

	path
}

fn load_str(payload: &str) -> Result<Config, Error> {
	let path = write_temp_config(payload);
	let result = prospect_config::load(&path);

	fs::remove_file(&path).expect("Failed to remove temp config.");

	result
}

fn patched(section: &[&str], key: &str, value: Value) -> String {
	let mut root: Table = toml::from_str(SAMPLE_CONFIG_TOML).expect("Failed to parse sample config.");
	let mut table = &mut root;

	for name in section {
		table = table
			.get_mut(*name)
			.and_then(Value::as_table_mut)
			.unwrap_or_else(|| panic!("Sample config must include [{name}]."));
	}

	table.insert(key.to_string(), value);

	toml::to_string(&root).expect("Failed to render patched config.")
}

fn validation_field(result: Result<Config, Error>) -> &'static str {
	match result {
		Err(Error::Validation { field, .. }) => field,
		other => panic!("Expected a validation error, got {other:?}."),
	}
}

#[test]
fn sample_config_loads_and_normalizes() {
	let cfg = load_str(SAMPLE_CONFIG_TOML).expect("Sample config must load.");

	assert_eq!(cfg.retrieval.browser.max_rotations, 3);
	assert_eq!(cfg.account_health.cooldown_hours, 6);
	assert_eq!(cfg.retrieval.api.api_base, "https://www.example-network.com");
	assert!(cfg.security.admin_auth_token.is_none());
	assert_eq!(cfg.session.csrf_cookie.as_deref(), Some("JSESSIONID"));
	assert!(cfg.retrieval.browser.executable.is_none());
	assert_eq!(cfg.service.instance_name, "prospect-local");
}

#[test]
fn sticky_template_requires_session_placeholder() {
	let payload =
		patched(&["proxy_pool"], "sticky_username_template", Value::String("{username}".into()));

	assert_eq!(validation_field(load_str(&payload)), "proxy_pool.sticky_username_template");
}

#[test]
fn rejects_zero_hourly_budget() {
	let payload = patched(&["account_health"], "pages_per_hour", Value::Integer(0));

	assert_eq!(validation_field(load_str(&payload)), "account_health.pages_per_hour");
}

#[test]
fn rejects_inverted_page_delay_window() {
	let payload = patched(&["retrieval", "browser"], "page_delay_min_ms", Value::Integer(90_000));

	assert_eq!(validation_field(load_str(&payload)), "retrieval.browser.page_delay_min_ms");
}

#[test]
fn rejects_zero_rotation_budget() {
	let payload = patched(&["retrieval", "browser"], "max_rotations", Value::Integer(0));

	assert_eq!(validation_field(load_str(&payload)), "retrieval.browser.max_rotations");
}

#[test]
fn disabled_api_tier_skips_api_checks() {
	let payload = patched(&["retrieval", "api"], "enabled", Value::Boolean(false));
	let mut root: Table = toml::from_str(&payload).expect("Failed to parse patched config.");

	root.get_mut("retrieval")
		.and_then(|retrieval| retrieval.get_mut("api"))
		.and_then(Value::as_table_mut)
		.expect("[retrieval.api] must be a table.")
		.insert("page_size".to_string(), Value::Integer(0));

	let payload = toml::to_string(&root).expect("Failed to render config.");
	let cfg = load_str(&payload).expect("Disabled API tier must not be validated.");

	assert!(!cfg.retrieval.api.enabled);
}

#[test]
fn missing_file_reports_path() {
	let path = env::temp_dir().join("prospect_config_missing.toml");
	let err = prospect_config::load(&path).expect_err("Missing file must fail.");

	assert!(matches!(err, Error::ReadConfig { .. }));
}

#[test]
fn instance_name_must_not_contain_separator() {
	let payload = patched(&["service"], "instance_name", Value::String("api:1".into()));

	assert_eq!(validation_field(load_str(&payload)), "service.instance_name");
}

#[test]
fn blank_search_url_becomes_none() {
	let payload = patched(&["retrieval", "browser"], "search_url", Value::String("  ".into()));
	let cfg = load_str(&payload).expect("Blank search_url must load.");

	assert!(cfg.retrieval.browser.search_url.is_none());
}
