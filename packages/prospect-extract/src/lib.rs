//! Parsers for search results returned by the target site.
//!
//! Both the structured API payloads and the rendered result pages are handled by an ordered list
//! of [`Extractor`] strategies, most specific first. Callers take the first non-empty result.

pub mod api;
pub mod challenge;
pub mod dom;

use std::collections::HashSet;

use prospect_domain::lead::Lead;

pub trait Extractor<Input: ?Sized> {
	fn name(&self) -> &'static str;

	fn extract(&self, input: &Input) -> Vec<Lead>;
}

#[derive(Debug, Default)]
pub struct Extraction {
	pub leads: Vec<Lead>,
	/// Name of the strategy that produced `leads`, if any did.
	pub strategy: Option<&'static str>,
}
impl Extraction {
	pub fn is_empty(&self) -> bool {
		self.leads.is_empty()
	}
}

/// Runs `chain` in order and returns the first non-empty result.
pub fn run_chain<Input: ?Sized>(
	chain: &[&dyn Extractor<Input>],
	input: &Input,
) -> Extraction {
	for extractor in chain {
		let leads = dedupe(extractor.extract(input));

		if !leads.is_empty() {
			return Extraction { leads, strategy: Some(extractor.name()) };
		}
	}

	Extraction::default()
}

fn dedupe(leads: Vec<Lead>) -> Vec<Lead> {
	let mut seen = HashSet::new();

	leads.into_iter().filter(|lead| seen.insert(lead.profile_url.clone())).collect()
}
