use std::sync::{Arc, atomic::Ordering};

use prospect_service::{RunOutcome, control};

use super::{BrowserScript, FakeHost};

#[tokio::test]
async fn captcha_on_second_page_rate_limits_and_keeps_first_page() {
	let script = Arc::new(BrowserScript::with_pages(vec![
		(
			format!("{}search/results/people/?keywords=founder", super::SITE),
			super::results_html(&["ada", "grace"], true),
		),
		(super::CHALLENGE_URL.to_string(), super::CHALLENGE_HTML.to_string()),
		(
			format!("{}search/results/people/?keywords=founder&page=3", super::SITE),
			super::results_html(&["never"], false),
		),
	]));
	let providers = super::providers(Some(super::session()), None, script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(50, 0), &host, receiver).await;
	let RunOutcome::RateLimited { counters, message } = &outcome else {
		panic!("Expected rate_limited, got {outcome:?}.");
	};

	assert!(message.contains("challenge"), "Unexpected message {message:?}.");
	assert_eq!(counters.total_pulled, 2);
	assert_eq!(host.challenges.load(Ordering::SeqCst), 1);
	assert_eq!(host.stored().len(), 2);
	// Pagination halted; the third page was never requested.
	assert_eq!(script.pages.lock().expect("Pages lock poisoned.").len(), 1);
	assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn challenge_on_landing_page_never_reaches_search() {
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(Some(super::session()), None, script.clone());
	let mut settings = super::settings();

	// The landing page itself redirects into the checkpoint.
	settings.landing_url = super::CHALLENGE_URL.to_string();

	let pipeline = super::pipeline(settings, &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(50, 0), &host, receiver).await;

	assert!(matches!(outcome, RunOutcome::RateLimited { .. }), "Unexpected outcome {outcome:?}.");
	assert_eq!(host.challenges.load(Ordering::SeqCst), 1);
	assert!(host.stored().is_empty());
	assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn closed_health_gate_rate_limits_before_any_page() {
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(Some(super::session()), None, script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost { page_budget: Some(0), ..Default::default() };
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(50, 0), &host, receiver).await;
	let RunOutcome::RateLimited { message, .. } = &outcome else {
		panic!("Expected rate_limited, got {outcome:?}.");
	};

	assert!(message.contains("Hourly page budget"), "Unexpected message {message:?}.");
	assert_eq!(host.page_loads.load(Ordering::SeqCst), 0);
	assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn captcha_while_walking_to_resume_page_rate_limits() {
	let script = Arc::new(BrowserScript::with_pages(vec![
		(
			format!("{}search/results/people/?keywords=founder", super::SITE),
			super::results_html(&["ada", "grace"], true),
		),
		(super::CHALLENGE_URL.to_string(), super::CHALLENGE_HTML.to_string()),
	]));
	let providers = super::providers(Some(super::session()), None, script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	// Twenty already pulled at ten per page: the run walks two pages before harvesting.
	let outcome = pipeline.run(&super::run_request(50, 20), &host, receiver).await;
	let RunOutcome::RateLimited { counters, .. } = &outcome else {
		panic!("Expected rate_limited, got {outcome:?}.");
	};

	assert_eq!(counters.total_pulled, 20);
	assert_eq!(host.challenges.load(Ordering::SeqCst), 1);
	// Landing plus both walked pages count against the hourly budget.
	assert_eq!(host.page_loads.load(Ordering::SeqCst), 3);
	assert!(host.stored().is_empty());
}

#[tokio::test]
async fn challenge_reported_by_the_browser_is_recorded_once() {
	let script =
		Arc::new(BrowserScript::failing("Navigation redirected to /checkpoint/challenge/AgE"));
	let providers = super::providers(Some(super::session()), None, script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(50, 0), &host, receiver).await;

	assert!(matches!(outcome, RunOutcome::RateLimited { .. }), "Unexpected outcome {outcome:?}.");
	assert_eq!(host.challenges.load(Ordering::SeqCst), 1);
	// Not a proxy fault, so no rotation.
	assert_eq!(script.launches.load(Ordering::SeqCst), 1);
	assert_eq!(host.rotations.load(Ordering::SeqCst), 0);
}
