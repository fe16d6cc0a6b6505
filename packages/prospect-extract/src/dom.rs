//! Extraction chain for rendered search result pages.

use scraper::{ElementRef, Html, Selector};
use url::Url;

use prospect_domain::{job::DataSource, lead::{self, Lead}};

use crate::{Extraction, Extractor};

const PROFILE_LINK: &str = "a[href*='/in/']";
/// Enabled pagination control. Also used by the browser driver to click through pages.
pub const NEXT_BUTTON: &str = "button[aria-label='Next']:not([disabled]), \
	button.artdeco-pagination__button--next:not([disabled])";
pub const SEARCH_BOX: &str =
	"input.search-global-typeahead__input, input[role='combobox'][placeholder*='Search']";
pub const PEOPLE_FILTER: &str = "button[aria-label*='People'], \
	button.search-reusables__filter-pill-button[aria-label*='People']";
const NO_RESULTS: &str = ".search-reusable-search-no-results, .artdeco-empty-state";

pub struct ResultsPage {
	pub document: Html,
	pub base: Url,
}
impl ResultsPage {
	pub fn parse(html: &str, base: Url) -> Self {
		Self { document: Html::parse_document(html), base }
	}
}

/// Selector set for one card layout.
struct CardLayout {
	container: &'static str,
	/// Tried in order; the first selector with text wins.
	names: &'static [&'static str],
	headline: &'static str,
	location: &'static str,
	degree: &'static str,
}

/// Classic result-card markup.
pub struct ResultCards;
impl Extractor<ResultsPage> for ResultCards {
	fn name(&self) -> &'static str {
		"dom_result_cards"
	}

	fn extract(&self, page: &ResultsPage) -> Vec<Lead> {
		extract_cards(
			page,
			&CardLayout {
				container: "li.reusable-search__result-container, div.entity-result",
				names: &[
					".entity-result__title-text span[aria-hidden='true']",
					".entity-result__title-text a",
				],
				headline: ".entity-result__primary-subtitle",
				location: ".entity-result__secondary-subtitle",
				degree: ".entity-result__badge-text",
			},
		)
		.unwrap_or_default()
	}
}

/// Newer markup keyed on data attributes instead of class names.
pub struct DataAttributeCards;
impl Extractor<ResultsPage> for DataAttributeCards {
	fn name(&self) -> &'static str {
		"dom_data_attributes"
	}

	fn extract(&self, page: &ResultsPage) -> Vec<Lead> {
		extract_cards(
			page,
			&CardLayout {
				container: "[data-chameleon-result-urn], \
					[data-view-name='search-entity-result-universal-template']",
				names: &["span[dir='ltr'] span[aria-hidden='true']", "[data-anonymize='person-name']"],
				headline: "[data-anonymize='headline'], div.t-14.t-black.t-normal",
				location: "[data-anonymize='location'], div.t-14.t-normal:not(.t-black)",
				degree: "span.dist-value, .entity-result__badge-text",
			},
		)
		.unwrap_or_default()
	}
}

/// Any list item holding a profile link; fields are read positionally from its text lines.
pub struct GenericList;
impl Extractor<ResultsPage> for GenericList {
	fn name(&self) -> &'static str {
		"dom_generic_list"
	}

	fn extract(&self, page: &ResultsPage) -> Vec<Lead> {
		let items = selector("main ul > li, ul[role='list'] > li");
		let (Some(items), Some(link)) = (items, selector(PROFILE_LINK)) else {
			return Vec::new();
		};

		page.document
			.select(&items)
			.filter_map(|item| {
				let href = item.select(&link).next()?.value().attr("href")?;
				let profile_url = lead::normalize_profile_url(href, &page.base)?;
				let mut degree = None;
				let mut fields = Vec::with_capacity(3);

				for line in text_lines(item) {
					if lead::normalize_degree(&line).is_some() && line.len() <= 8 {
						degree = Some(line);
					} else if !is_noise(&line) {
						fields.push(line);
					}
					if fields.len() == 3 {
						break;
					}
				}

				let mut fields = fields.into_iter();

				Some(Lead::from_parts(
					profile_url,
					fields.next(),
					fields.next(),
					fields.next(),
					degree,
					DataSource::Browser,
				))
			})
			.collect()
	}
}

/// Last resort: one minimal record per distinct profile anchor.
pub struct AnchorFallback;
impl Extractor<ResultsPage> for AnchorFallback {
	fn name(&self) -> &'static str {
		"dom_anchor_fallback"
	}

	fn extract(&self, page: &ResultsPage) -> Vec<Lead> {
		let Some(link) = selector(PROFILE_LINK) else {
			return Vec::new();
		};

		page.document
			.select(&link)
			.filter_map(|anchor| {
				let href = anchor.value().attr("href")?;
				let profile_url = lead::normalize_profile_url(href, &page.base)?;
				let name = anchor
					.value()
					.attr("aria-label")
					.map(name_from_aria_label)
					.or_else(|| text_lines(anchor).into_iter().find(|line| !is_noise(line)));

				Some(Lead::from_parts(profile_url, name, None, None, None, DataSource::Browser))
			})
			.collect()
	}
}

pub fn extract_page(page: &ResultsPage) -> Extraction {
	let chain: [&dyn Extractor<ResultsPage>; 4] =
		[&ResultCards, &DataAttributeCards, &GenericList, &AnchorFallback];

	crate::run_chain(&chain, page)
}

pub fn has_next_page(page: &ResultsPage) -> bool {
	selector(NEXT_BUTTON).is_some_and(|next| page.document.select(&next).next().is_some())
}

pub fn shows_no_results(page: &ResultsPage) -> bool {
	selector(NO_RESULTS).is_some_and(|empty| page.document.select(&empty).next().is_some())
}

fn extract_cards(page: &ResultsPage, layout: &CardLayout) -> Option<Vec<Lead>> {
	let container = selector(layout.container)?;
	let link = selector(PROFILE_LINK)?;
	let names = layout.names.iter().map(|css| selector(css)).collect::<Option<Vec<_>>>()?;
	let headline = selector(layout.headline)?;
	let location = selector(layout.location)?;
	let degree = selector(layout.degree)?;
	let leads = page
		.document
		.select(&container)
		.filter_map(|card| {
			let href = card.select(&link).next()?.value().attr("href")?;
			let profile_url = lead::normalize_profile_url(href, &page.base)?;
			let full_name = names.iter().find_map(|name| first_text(card, name))?;

			Some(Lead::from_parts(
				profile_url,
				Some(full_name),
				first_text(card, &headline),
				first_text(card, &location),
				first_text(card, &degree),
				DataSource::Browser,
			))
		})
		.collect();

	Some(leads)
}

fn selector(css: &str) -> Option<Selector> {
	Selector::parse(css).ok()
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
	scope.select(selector).find_map(|element| {
		let text = element.text().collect::<Vec<_>>().join(" ");
		let text = text.split_whitespace().collect::<Vec<_>>().join(" ");

		if text.is_empty() { None } else { Some(text) }
	})
}

fn text_lines(scope: ElementRef<'_>) -> Vec<String> {
	scope
		.text()
		.map(|chunk| chunk.split_whitespace().collect::<Vec<_>>().join(" "))
		.filter(|line| !line.is_empty())
		.collect()
}

fn is_noise(line: &str) -> bool {
	let lower = line.to_ascii_lowercase();

	matches!(lower.as_str(), "connect" | "follow" | "message" | "pending" | "•" | "status is offline")
		|| lower.starts_with("view ")
}

/// `View Jane Doe’s profile` -> `Jane Doe`.
fn name_from_aria_label(label: &str) -> String {
	let trimmed = label.trim();
	let trimmed = trimmed.strip_prefix("View ").unwrap_or(trimmed);

	for suffix in ["’s profile", "'s profile", " profile"] {
		if let Some(name) = trimmed.strip_suffix(suffix) {
			return name.trim().to_string();
		}
	}

	trimmed.to_string()
}
