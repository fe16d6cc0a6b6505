use std::sync::{Arc, atomic::Ordering};

use prospect_service::{
	RunOutcome,
	control::{self, Control, Stop},
};

use super::{BrowserScript, FakeHost, ScriptedSearchApi};

#[tokio::test]
async fn pause_after_first_batch_stops_with_progress_saved() {
	let api = Arc::new(ScriptedSearchApi::new(
		2,
		vec![super::api_page(&["ada", "grace"], 10), super::api_page(&["linus", "ken"], 10)],
	));
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(Some(super::session()), Some(api.clone()), script);
	let pipeline = super::pipeline(super::settings(), &providers);
	let (sender, receiver) = control::channel();
	let host = FakeHost::default();

	*host.after_first_batch.lock().expect("Control lock poisoned.") =
		Some((sender, Control::Pause));

	let outcome = pipeline.run(&super::run_request(10, 0), &host, receiver).await;
	let RunOutcome::Stopped { counters, stop } = &outcome else {
		panic!("Expected a stop, got {outcome:?}.");
	};

	assert_eq!(*stop, Stop::Paused);
	assert_eq!(counters.total_pulled, 2);
	assert_eq!(api.starts(), vec![0]);

	let saved = host.saved.lock().expect("Saved lock poisoned.").clone();

	assert_eq!(saved.len(), 1);
	assert_eq!(saved[0].total_pulled, 2);
	assert_eq!(saved[0].progress(), 20);
}

#[tokio::test]
async fn cancel_before_start_touches_nothing() {
	let api = Arc::new(ScriptedSearchApi::new(2, vec![super::api_page(&["ada"], 1)]));
	let script = Arc::new(BrowserScript::default());
	let providers = super::providers(Some(super::session()), Some(api.clone()), script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let (sender, receiver) = control::channel();
	let host = FakeHost::default();

	sender.send_replace(Control::Cancel);

	let outcome = pipeline.run(&super::run_request(10, 0), &host, receiver).await;

	assert!(
		matches!(outcome, RunOutcome::Stopped { stop: Stop::Cancelled, .. }),
		"Unexpected outcome {outcome:?}."
	);
	assert!(api.starts().is_empty());
	assert_eq!(host.page_loads.load(Ordering::SeqCst), 0);
	assert_eq!(script.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancel_interrupts_a_long_page_delay() {
	let script = Arc::new(BrowserScript::with_pages(vec![
		(
			format!("{}search/results/people/?keywords=founder", super::SITE),
			super::results_html(&["ada"], true),
		),
		(
			format!("{}search/results/people/?keywords=founder&page=2", super::SITE),
			super::results_html(&["grace"], false),
		),
	]));
	let providers = super::providers(Some(super::session()), None, script.clone());
	let mut settings = super::settings();

	// Long enough that the test would time out if the delay were not interruptible.
	settings.cadence.page_delay_min_ms = 600_000;
	settings.cadence.page_delay_max_ms = 600_000;

	let pipeline = super::pipeline(settings, &providers);
	let (sender, receiver) = control::channel();
	let host = FakeHost::default();

	*host.after_first_batch.lock().expect("Control lock poisoned.") =
		Some((sender, Control::Cancel));

	let outcome = tokio::time::timeout(
		std::time::Duration::from_secs(5),
		pipeline.run(&super::run_request(10, 0), &host, receiver),
	)
	.await
	.expect("Cancel did not interrupt the page delay.");

	assert!(
		matches!(outcome, RunOutcome::Stopped { stop: Stop::Cancelled, .. }),
		"Unexpected outcome {outcome:?}."
	);
	assert_eq!(host.stored().len(), 1);
	assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn browser_resume_walks_past_counted_pages() {
	let script = Arc::new(BrowserScript::with_pages(vec![
		(
			format!("{}search/results/people/?keywords=founder", super::SITE),
			super::results_html(&["ada", "grace"], true),
		),
		(
			format!("{}search/results/people/?keywords=founder&page=2", super::SITE),
			super::results_html(&["linus", "ken"], false),
		),
	]));
	let providers = super::providers(Some(super::session()), None, script.clone());
	let pipeline = super::pipeline(super::settings(), &providers);
	let (_sender, receiver) = control::channel();
	let host = FakeHost::default();
	// Ten per page, so the first page was fully pulled before the pause.
	let outcome = pipeline.run(&super::run_request(12, 10), &host, receiver).await;
	let RunOutcome::Completed(counters) = &outcome else {
		panic!("Expected completion, got {outcome:?}.");
	};

	assert_eq!(counters.total_pulled, 12);
	assert_eq!(
		host.stored(),
		vec![
			"https://www.example-network.com/in/linus".to_string(),
			"https://www.example-network.com/in/ken".to_string(),
		]
	);
	// Landing, the walked page and the harvested page.
	assert_eq!(host.page_loads.load(Ordering::SeqCst), 3);
	assert_eq!(script.closes.load(Ordering::SeqCst), 1);
}
