use std::time::Duration;

use rand::Rng;

/// Humanized timing for browser interaction.
#[derive(Clone, Debug)]
pub struct Cadence {
	pub page_delay_min_ms: u64,
	pub page_delay_max_ms: u64,
	pub page_jitter_ms: u64,
	pub dwell_min_ms: u64,
	pub dwell_max_ms: u64,
	pub keystroke_delay_ms: u64,
	pub rotation_delay_ms: u64,
}
impl Cadence {
	pub fn from_config(cfg: &prospect_config::RetrievalBrowser) -> Self {
		Self {
			page_delay_min_ms: cfg.page_delay_min_ms,
			page_delay_max_ms: cfg.page_delay_max_ms,
			page_jitter_ms: cfg.page_jitter_ms,
			dwell_min_ms: cfg.dwell_min_ms,
			dwell_max_ms: cfg.dwell_max_ms,
			keystroke_delay_ms: cfg.keystroke_delay_ms,
			rotation_delay_ms: cfg.rotation_delay_ms,
		}
	}

	/// Zero delays everywhere; used by tests and dry runs.
	pub fn immediate() -> Self {
		Self {
			page_delay_min_ms: 0,
			page_delay_max_ms: 0,
			page_jitter_ms: 0,
			dwell_min_ms: 0,
			dwell_max_ms: 0,
			keystroke_delay_ms: 0,
			rotation_delay_ms: 0,
		}
	}

	pub fn page_delay<R>(&self, rng: &mut R) -> Duration
	where
		R: Rng,
	{
		let base = uniform(rng, self.page_delay_min_ms, self.page_delay_max_ms);
		let jitter = uniform(rng, 0, self.page_jitter_ms);

		Duration::from_millis(base + jitter)
	}

	pub fn dwell<R>(&self, rng: &mut R) -> Duration
	where
		R: Rng,
	{
		Duration::from_millis(uniform(rng, self.dwell_min_ms, self.dwell_max_ms))
	}

	/// Per-keystroke delay within +/-40% of the configured base.
	pub fn keystroke<R>(&self, rng: &mut R) -> Duration
	where
		R: Rng,
	{
		let spread = self.keystroke_delay_ms * 2 / 5;
		let low = self.keystroke_delay_ms.saturating_sub(spread);

		Duration::from_millis(uniform(rng, low, self.keystroke_delay_ms + spread))
	}

	pub fn rotation_delay(&self) -> Duration {
		Duration::from_millis(self.rotation_delay_ms)
	}

	/// Scroll offsets in pixels for the warm-up phase.
	pub fn scroll_steps<R>(&self, rng: &mut R) -> Vec<u32>
	where
		R: Rng,
	{
		let steps = rng.random_range(2..=4);

		(0..steps).map(|_| rng.random_range(240..=720)).collect()
	}
}

fn uniform<R>(rng: &mut R, low: u64, high: u64) -> u64
where
	R: Rng,
{
	if high <= low { low } else { rng.random_range(low..=high) }
}

#[cfg(test)]
mod tests {
	use rand::{SeedableRng, rngs::StdRng};

	use super::*;

	#[test]
	fn page_delay_stays_in_window() {
		let cadence = Cadence {
			page_delay_min_ms: 20_000,
			page_delay_max_ms: 40_000,
			page_jitter_ms: 5_000,
			..Cadence::immediate()
		};
		let mut rng = StdRng::seed_from_u64(7);

		for _ in 0..200 {
			let delay = cadence.page_delay(&mut rng).as_millis();

			assert!((20_000..=45_000).contains(&delay));
		}
	}

	#[test]
	fn immediate_cadence_never_sleeps() {
		let cadence = Cadence::immediate();
		let mut rng = StdRng::seed_from_u64(1);

		assert_eq!(cadence.page_delay(&mut rng), Duration::ZERO);
		assert_eq!(cadence.keystroke(&mut rng), Duration::ZERO);
	}
}
