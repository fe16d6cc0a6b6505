use std::sync::{Arc, atomic::Ordering};

use prospect_service::{Error, RunOutcome, control};

use super::{BrowserScript, FakeHost};

#[tokio::test]
async fn three_transient_failures_rotate_twice_then_fail() {
	let script = Arc::new(BrowserScript::failing(super::TUNNEL_FAILURE));
	let providers = super::providers(Some(super::session()), None, script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(50, 0), &host, receiver).await;
	let RunOutcome::Failed { error, .. } = &outcome else {
		panic!("Expected failure, got {outcome:?}.");
	};

	assert!(matches!(error, Error::ProxyTransient { .. }), "Unexpected error {error:?}.");
	assert!(error.to_string().contains("rotation exhausted after 3"), "Unexpected error {error}.");
	assert_eq!(host.acquires.load(Ordering::SeqCst), 1);
	assert_eq!(host.rotations.load(Ordering::SeqCst), 2);
	assert_eq!(script.launches.load(Ordering::SeqCst), 3);
	assert_eq!(script.closes.load(Ordering::SeqCst), 3);

	let proxies = script.proxies.lock().expect("Proxy lock poisoned.").clone();

	assert_eq!(
		proxies,
		vec![
			Some("user-session-0".to_string()),
			Some("user-session-1".to_string()),
			Some("user-session-2".to_string()),
		]
	);
}

#[tokio::test]
async fn ip_bound_session_runs_without_a_proxy() {
	let script = Arc::new(BrowserScript::with_pages(vec![(
		format!("{}search/results/people/?keywords=founder", super::SITE),
		super::results_html(&["ada"], false),
	)]));
	let providers = super::providers(
		Some(prospect_domain::session::SessionCookies { ip_bound: true, ..super::session() }),
		None,
		script.clone(),
	);
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(50, 0), &host, receiver).await;

	assert!(matches!(outcome, RunOutcome::Completed(_)), "Unexpected outcome {outcome:?}.");
	assert_eq!(host.acquires.load(Ordering::SeqCst), 0);
	assert_eq!(*script.proxies.lock().expect("Proxy lock poisoned."), vec![None]);
}

#[tokio::test]
async fn missing_auth_cookie_fails_with_session_invalid() {
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(
		Some(prospect_domain::session::SessionCookies::default()),
		None,
		script.clone(),
	);
	let pipeline = super::pipeline(super::settings(), &providers);
	let host = FakeHost::default();
	let (_control, receiver) = control::channel();
	let outcome = pipeline.run(&super::run_request(50, 0), &host, receiver).await;

	assert!(
		matches!(&outcome, RunOutcome::Failed { error: Error::SessionInvalid { .. }, .. }),
		"Unexpected outcome {outcome:?}."
	);
	assert_eq!(script.launches.load(Ordering::SeqCst), 0);
}
