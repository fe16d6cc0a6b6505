//! Shape matchers for the structured search API.
//!
//! The upstream payload drifts between a nested `elements -> items -> entityResult` layout, a flat
//! `included` entity list, and ad-hoc variations of both. Matchers run from strict to lenient.

use serde_json::Value;
use url::Url;

use prospect_domain::{job::DataSource, lead::{self, Lead}};

use crate::{Extraction, Extractor};

const ENTITY_RESULT_TYPE: &str = "EntityResultViewModel";
const MAX_WALK_DEPTH: usize = 12;

pub struct ApiPage {
	pub json: Value,
	pub base: Url,
}

/// `data.elements[].items[].item.entityResult`, with or without the `data` envelope.
pub struct StrictElements;
impl Extractor<ApiPage> for StrictElements {
	fn name(&self) -> &'static str {
		"api_strict_elements"
	}

	fn extract(&self, page: &ApiPage) -> Vec<Lead> {
		let Some(elements) = page
			.json
			.pointer("/data/elements")
			.or_else(|| page.json.get("elements"))
			.and_then(Value::as_array)
		else {
			return Vec::new();
		};

		elements
			.iter()
			.filter_map(|element| element.get("items").and_then(Value::as_array))
			.flatten()
			.filter_map(|item| item.pointer("/item/entityResult"))
			.filter_map(|entity| lead_from_entity(entity, &page.base))
			.collect()
	}
}

/// Flat `included[]` list of entity view models.
pub struct IncludedEntities;
impl Extractor<ApiPage> for IncludedEntities {
	fn name(&self) -> &'static str {
		"api_included_entities"
	}

	fn extract(&self, page: &ApiPage) -> Vec<Lead> {
		let Some(included) = page.json.get("included").and_then(Value::as_array) else {
			return Vec::new();
		};

		included
			.iter()
			.filter(|entity| {
				entity
					.get("$type")
					.and_then(Value::as_str)
					.is_some_and(|kind| kind.contains(ENTITY_RESULT_TYPE))
			})
			.filter_map(|entity| lead_from_entity(entity, &page.base))
			.collect()
	}
}

/// Depth-first walk that accepts any object carrying a profile link and a display name.
pub struct LenientWalk;
impl Extractor<ApiPage> for LenientWalk {
	fn name(&self) -> &'static str {
		"api_lenient_walk"
	}

	fn extract(&self, page: &ApiPage) -> Vec<Lead> {
		let mut out = Vec::new();

		walk(&page.json, &page.base, 0, &mut out);

		out
	}
}

pub fn extract_page(page: &ApiPage) -> Extraction {
	let chain: [&dyn Extractor<ApiPage>; 3] = [&StrictElements, &IncludedEntities, &LenientWalk];

	crate::run_chain(&chain, page)
}

/// Upstream total result count, when the payload reports one.
pub fn total_results(json: &Value) -> Option<u32> {
	["/data/paging/total", "/paging/total", "/data/metadata/totalResultCount"]
		.into_iter()
		.find_map(|pointer| json.pointer(pointer).and_then(Value::as_u64))
		.map(|total| total.min(u64::from(u32::MAX)) as u32)
}

fn walk(value: &Value, base: &Url, depth: usize, out: &mut Vec<Lead>) {
	if depth > MAX_WALK_DEPTH {
		return;
	}

	match value {
		Value::Object(map) => {
			if let Some(lead) = lead_from_entity(value, base) {
				out.push(lead);

				return;
			}

			for child in map.values() {
				walk(child, base, depth + 1, out);
			}
		},
		Value::Array(items) =>
			for item in items {
				walk(item, base, depth + 1, out);
			},
		_ => {},
	}
}

fn lead_from_entity(entity: &Value, base: &Url) -> Option<Lead> {
	let link = entity
		.get("navigationUrl")
		.or_else(|| entity.get("profileUrl"))
		.and_then(Value::as_str)?;
	let profile_url = lead::normalize_profile_url(link, base)?;
	let full_name = text_field(entity, "title").or_else(|| text_field(entity, "name"))?;
	let degree = text_field(entity, "badgeText").or_else(|| {
		entity
			.pointer("/entityCustomTrackingInfo/memberDistance")
			.and_then(Value::as_str)
			.map(str::to_string)
	});

	Some(Lead::from_parts(
		profile_url,
		Some(full_name),
		text_field(entity, "primarySubtitle").or_else(|| text_field(entity, "headline")),
		text_field(entity, "secondarySubtitle").or_else(|| text_field(entity, "location")),
		degree,
		DataSource::Api,
	))
}

/// Reads either `{ "key": { "text": "..." } }` or `{ "key": "..." }`.
fn text_field(entity: &Value, key: &str) -> Option<String> {
	let field = entity.get(key)?;
	let text = field.get("text").and_then(Value::as_str).or_else(|| field.as_str())?;

	if text.trim().is_empty() { None } else { Some(text.to_string()) }
}
