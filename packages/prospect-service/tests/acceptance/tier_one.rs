use std::sync::{Arc, atomic::Ordering};

use prospect_domain::job::DataSource;
use prospect_service::{Error, RunOutcome, control};

use super::{BrowserScript, FakeHost, ScriptedSearchApi};

#[tokio::test]
async fn structured_search_fills_target_without_browser() {
	let api = Arc::new(ScriptedSearchApi::new(
		2,
		vec![super::api_page(&["ada", "grace"], 40), super::api_page(&["linus", "ken"], 40)],
	));
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(Some(super::session()), Some(api.clone()), script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(3, 0), &host, receiver).await;
	let RunOutcome::Completed(counters) = &outcome else {
		panic!("Expected completion, got {outcome:?}.");
	};

	assert_eq!(counters.total_pulled, 3);
	assert_eq!(counters.credits_used, 3);
	assert_eq!(counters.total_found, 40);
	assert_eq!(counters.data_source, Some(DataSource::Api));
	assert_eq!(api.starts(), vec![0, 2]);
	assert_eq!(host.page_loads.load(Ordering::SeqCst), 2);
	assert_eq!(script.launches.load(Ordering::SeqCst), 0);
	assert_eq!(
		host.stored(),
		vec![
			"https://www.example-network.com/in/ada".to_string(),
			"https://www.example-network.com/in/grace".to_string(),
			"https://www.example-network.com/in/linus".to_string(),
		]
	);
}

#[tokio::test]
async fn structured_search_resumes_from_persisted_offset() {
	let api = Arc::new(ScriptedSearchApi::new(10, vec![super::api_page(&["ada"], 11)]));
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(Some(super::session()), Some(api.clone()), script);
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(11, 10), &host, receiver).await;

	assert!(matches!(outcome, RunOutcome::Completed(_)), "Unexpected outcome {outcome:?}.");
	assert_eq!(api.starts(), vec![10]);
	assert_eq!(outcome.counters().total_pulled, 11);
	assert_eq!(outcome.counters().progress(), 100);
}

#[tokio::test]
async fn empty_structured_search_falls_back_to_browser() {
	let api = Arc::new(ScriptedSearchApi::new(10, Vec::new()));
	let script = Arc::new(BrowserScript::with_pages(vec![(
		format!("{}search/results/people/?keywords=founder", super::SITE),
		super::results_html(&["ada", "grace"], false),
	)]));
	let providers = super::providers(Some(super::session()), Some(api.clone()), script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(25, 0), &host, receiver).await;
	let RunOutcome::Completed(counters) = &outcome else {
		panic!("Expected completion, got {outcome:?}.");
	};

	// Two consecutive empty pages end the API tier.
	assert_eq!(api.starts(), vec![0, 10]);
	assert_eq!(counters.total_pulled, 2);
	assert_eq!(counters.data_source, Some(DataSource::Browser));
	assert_eq!(host.acquires.load(Ordering::SeqCst), 1);
	assert_eq!(script.launches.load(Ordering::SeqCst), 1);
	assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn upstream_throttle_keeps_partial_results() {
	let api = Arc::new(ScriptedSearchApi::new(
		2,
		vec![
			super::api_page(&["ada", "grace"], 10),
			prospect_service::SearchApiPage::RateLimited { status: 429 },
		],
	));
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(Some(super::session()), Some(api), script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(10, 0), &host, receiver).await;

	assert!(matches!(outcome, RunOutcome::Completed(_)), "Unexpected outcome {outcome:?}.");
	assert_eq!(outcome.counters().total_pulled, 2);
	assert_eq!(script.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn two_empty_structured_pages_end_the_tier() {
	let api = Arc::new(ScriptedSearchApi::new(
		2,
		vec![
			super::api_page(&["ada", "grace"], 10),
			super::api_page(&[], 10),
			super::api_page(&[], 10),
			super::api_page(&["linus"], 10),
		],
	));
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(Some(super::session()), Some(api.clone()), script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(10, 0), &host, receiver).await;
	let RunOutcome::Completed(counters) = &outcome else {
		panic!("Expected completion, got {outcome:?}.");
	};

	// The tier found leads, so there is no browser fallback either.
	assert_eq!(api.starts(), vec![0, 2, 4]);
	assert_eq!(counters.total_pulled, 2);
	assert_eq!(script.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn rejected_session_fails_without_browser_fallback() {
	let api = Arc::new(ScriptedSearchApi::new(
		10,
		vec![prospect_service::SearchApiPage::AuthFailed { status: 401 }],
	));
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(Some(super::session()), Some(api), script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(10, 0), &host, receiver).await;
	let RunOutcome::Failed { error, .. } = &outcome else {
		panic!("Expected failure, got {outcome:?}.");
	};

	assert!(matches!(error, Error::SessionInvalid { .. }), "Unexpected error {error:?}.");
	assert_eq!(script.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn session_errors_from_the_search_client_are_not_swallowed() {
	let api = Arc::new(ScriptedSearchApi::failing(10, "Redirected to the authwall"));
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(Some(super::session()), Some(api.clone()), script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(10, 0), &host, receiver).await;

	assert!(
		matches!(&outcome, RunOutcome::Failed { error: Error::SessionInvalid { .. }, .. }),
		"Unexpected outcome {outcome:?}."
	);
	assert_eq!(api.starts(), vec![0]);
	assert_eq!(script.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn challenge_from_the_search_client_rate_limits_and_records_cooldown() {
	let api = Arc::new(ScriptedSearchApi::failing(10, "Response body asked for a captcha"));
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(Some(super::session()), Some(api), script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(10, 0), &host, receiver).await;

	assert!(matches!(outcome, RunOutcome::RateLimited { .. }), "Unexpected outcome {outcome:?}.");
	assert_eq!(host.challenges.load(Ordering::SeqCst), 1);
	assert_eq!(script.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn other_search_client_errors_fall_back_to_browser() {
	let api = Arc::new(ScriptedSearchApi::failing(10, "connection reset by peer"));
	let script = Arc::new(BrowserScript::with_pages(vec![(
		format!("{}search/results/people/?keywords=founder", super::SITE),
		super::results_html(&["ada"], false),
	)]));
	let providers = super::providers(Some(super::session()), Some(api), script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(10, 0), &host, receiver).await;

	assert!(matches!(outcome, RunOutcome::Completed(_)), "Unexpected outcome {outcome:?}.");
	assert_eq!(outcome.counters().data_source, Some(DataSource::Browser));
	assert_eq!(script.launches.load(Ordering::SeqCst), 1);
}
