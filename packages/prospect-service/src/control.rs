//! Pause and cancel signalling for running jobs.
//!
//! Each runner holds a `watch` receiver. Delays and network waits race against it so a pause or
//! cancel takes effect at the next suspension point instead of after the current page delay.

use std::{future::Future, time::Duration};

use tokio::sync::watch;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Control {
	Run,
	Pause,
	Cancel,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stop {
	Paused,
	Cancelled,
}

pub fn channel() -> (watch::Sender<Control>, watch::Receiver<Control>) {
	watch::channel(Control::Run)
}

/// Returns the requested stop, if any, without waiting.
pub fn check(control: &watch::Receiver<Control>) -> Result<(), Stop> {
	match stop_of(*control.borrow()) {
		Some(stop) => Err(stop),
		None => Ok(()),
	}
}

/// Drives `fut` unless a stop arrives first.
pub async fn interruptible<F>(
	control: &mut watch::Receiver<Control>,
	fut: F,
) -> Result<F::Output, Stop>
where
	F: Future,
{
	check(control)?;

	tokio::select! {
		output = fut => Ok(output),
		stop = wait_for_stop(control) => Err(stop),
	}
}

pub async fn sleep(control: &mut watch::Receiver<Control>, duration: Duration) -> Result<(), Stop> {
	if duration.is_zero() {
		return check(control);
	}

	interruptible(control, tokio::time::sleep(duration)).await
}

async fn wait_for_stop(control: &mut watch::Receiver<Control>) -> Stop {
	loop {
		if let Some(stop) = stop_of(*control.borrow_and_update()) {
			return stop;
		}
		// A dropped sender means nobody can stop the job anymore.
		if control.changed().await.is_err() {
			return std::future::pending().await;
		}
	}
}

fn stop_of(control: Control) -> Option<Stop> {
	match control {
		Control::Run => None,
		Control::Pause => Some(Stop::Paused),
		Control::Cancel => Some(Stop::Cancelled),
	}
}
