//! HTML parsers for listing and detail pages
//!
//! This module handles parsing fetched pages to extract:
//! - Ordered (detail URL, external id) pairs from listing pages
//! - Flat field maps from detail pages, with the damaged flag honoured
//! - Publication dates written in Polish long form

use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// Path fragment every detail link on a listing page contains
pub const DETAIL_PATH_MARKER: &str = "/oferta/";

/// Detail fields read from `div[data-testid=...]` blocks, as (key, testid)
const TESTID_FIELDS: &[(&str, &str)] = &[
    ("condition", "new_used"),
    ("make", "make"),
    ("model", "model"),
    ("version", "version"),
    ("generation", "generation"),
    ("year", "year"),
    ("mileage", "mileage"),
    ("power", "engine_power"),
    ("engine_capacity", "engine_capacity"),
    ("fuel_type", "fuel_type"),
    ("co2_emission", "co2_emission"),
    ("drive", "drive"),
    ("gearbox", "gearbox"),
    ("body_type", "body_type"),
    ("door_count", "door_count"),
    ("color", "color"),
    ("origin_country", "origin_country"),
    ("first_owner", "first_owner"),
    ("first_registration", "first_registration"),
];

const MONTHS: &[(&str, u32)] = &[
    ("stycznia", 1),
    ("lutego", 2),
    ("marca", 3),
    ("kwietnia", 4),
    ("maja", 5),
    ("czerwca", 6),
    ("lipca", 7),
    ("sierpnia", 8),
    ("września", 9),
    ("października", 10),
    ("listopada", 11),
    ("grudnia", 12),
];

/// One detail link found on a listing page
#[derive(Debug, Clone, PartialEq)]
pub struct ListingEntry {
    pub url: Url,

    /// May be empty when neither the listing nor the URL carries an id
    pub external_id: String,
}

/// One fetched detail record as a flat field map
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawItem {
    pub fields: BTreeMap<String, String>,
}

impl RawItem {
    /// Returns a field value, or "" when absent
    pub fn get(&self, key: &str) -> &str {
        self.fields.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn external_id(&self) -> &str {
        self.get("id")
    }

    /// Publication date as `DD.MM.YYYY`, or "" when the page had none
    pub fn publication_date(&self) -> &str {
        self.get("date")
    }
}

/// Result of parsing a detail page
#[derive(Debug, Clone, PartialEq)]
pub enum DetailOutcome {
    /// The source marks the item as damaged; it is skipped
    Damaged,

    Item(RawItem),
}

/// Extracts detail links from a listing page, in page order
///
/// Every `article[data-id]` contributes its first link if that link points
/// at a detail page. A missing `data-id` is recovered from the URL.
///
/// # Arguments
///
/// * `html` - The listing page HTML
/// * `base_url` - The listing URL, for resolving relative links
///
/// # Example
///
/// ```
/// use sumi_pipeline::crawler::parse_listing;
/// use url::Url;
///
/// let html = r#"<article data-id="42"><a href="/osobowe/oferta/audi-a4-42.html">A4</a></article>"#;
/// let base = Url::parse("https://example.com/osobowe/audi/?page=1").unwrap();
/// let entries = parse_listing(html, &base);
/// assert_eq!(entries[0].external_id, "42");
/// assert_eq!(entries[0].url.as_str(), "https://example.com/osobowe/oferta/audi-a4-42.html");
/// ```
pub fn parse_listing(html: &str, base_url: &Url) -> Vec<ListingEntry> {
    let document = Html::parse_document(html);
    let mut entries = Vec::new();

    let (Ok(article_selector), Ok(link_selector)) =
        (Selector::parse("article[data-id]"), Selector::parse("a[href]"))
    else {
        return entries;
    };

    for article in document.select(&article_selector) {
        let Some(href) = article
            .select(&link_selector)
            .next()
            .and_then(|a| a.value().attr("href"))
        else {
            continue;
        };

        if !href.contains(DETAIL_PATH_MARKER) {
            continue;
        }

        let Ok(url) = base_url.join(href) else {
            tracing::debug!("Skipping unresolvable detail link {}", href);
            continue;
        };

        let mut external_id = article
            .value()
            .attr("data-id")
            .unwrap_or("")
            .trim()
            .to_string();
        if external_id.is_empty() {
            external_id = extract_id_from_url(url.as_str());
        }

        entries.push(ListingEntry { url, external_id });
    }

    entries
}

/// Parses a detail page into a flat field map
///
/// # Arguments
///
/// * `html` - The detail page HTML
/// * `url` - The detail page URL
/// * `external_id` - Id taken from the listing; may be empty
pub fn parse_detail(html: &str, url: &Url, external_id: &str) -> DetailOutcome {
    let document = Html::parse_document(html);

    if is_damaged(&document) {
        return DetailOutcome::Damaged;
    }

    let mut item = RawItem::default();

    let id = if !external_id.is_empty() {
        external_id.to_string()
    } else {
        let from_url = extract_id_from_url(url.as_str());
        if from_url.is_empty() {
            let text = collapse_whitespace(document.root_element().text());
            find_labelled_id(&text).unwrap_or_default()
        } else {
            from_url
        }
    };
    item.set("id", id);
    item.set("url", url.as_str());

    let price = first_text(&document, "span.offer-price__number")
        .map(|p| p.chars().filter(|c| !c.is_whitespace()).collect::<String>())
        .filter(|p| p.parse::<u64>().is_ok())
        .unwrap_or_default();
    item.set("price", price);
    item.set(
        "currency",
        first_text(&document, "span.offer-price__currency").unwrap_or_else(|| "PLN".to_string()),
    );

    let date = document_select(&document, "div.ooa-vtq6wn")
        .and_then(|container| {
            let p = Selector::parse("p").ok()?;
            container.select(&p).next().map(element_text)
        })
        .filter(|text| !text.is_empty())
        .map(|text| parse_polish_date(&text))
        .unwrap_or_default();
    item.set("date", date);

    let location = document_select(&document, r##"a[href$="#map"]"##)
        .and_then(|link| {
            let p = Selector::parse("p").ok()?;
            link.select(&p).next().map(element_text)
        })
        .unwrap_or_default();
    item.set("location", location);

    for (key, testid) in TESTID_FIELDS {
        item.set(key, value_by_testid(&document, testid));
    }

    let features = Selector::parse("li.offer-features__item")
        .map(|selector| {
            document
                .select(&selector)
                .map(element_text)
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
        })
        .unwrap_or_default();
    item.set("features", features.join("; "));

    DetailOutcome::Item(item)
}

/// Converts a Polish long-form date such as "2 grudnia 2025 13:26" to `02.12.2025`
///
/// Text without a recognisable day, month word and year is returned trimmed.
/// An unknown month word maps to January.
pub fn parse_polish_date(text: &str) -> String {
    let lowered = text.to_lowercase();
    let tokens: Vec<&str> = lowered.split_whitespace().collect();

    for window in tokens.windows(3) {
        let (day, month, year) = (window[0], window[1], window[2]);

        let day_ok = (1..=2).contains(&day.len()) && day.chars().all(|c| c.is_ascii_digit());
        let month_ok = !month.is_empty() && month.chars().all(char::is_alphabetic);
        let year_digits: String = year.chars().take_while(|c| c.is_ascii_digit()).collect();

        if day_ok && month_ok && year_digits.len() == 4 {
            let day: u32 = day.parse().unwrap_or(1);
            let month_num = MONTHS
                .iter()
                .find(|(name, _)| *name == month)
                .map(|(_, n)| *n)
                .unwrap_or(1);
            return format!("{:02}.{:02}.{}", day, month_num, year_digits);
        }
    }

    text.trim().to_string()
}

/// Extracts the numeric id from a URL ending in `-<digits>.html`
///
/// Returns "" if the URL has no such suffix.
pub fn extract_id_from_url(url: &str) -> String {
    for (index, _) in url.match_indices(".html") {
        let prefix = &url[..index];
        let digits_start = prefix
            .char_indices()
            .rev()
            .take_while(|(_, c)| c.is_ascii_digit())
            .last()
            .map(|(i, _)| i);

        if let Some(start) = digits_start {
            if prefix[..start].ends_with('-') {
                return prefix[start..].to_string();
            }
        }
    }
    String::new()
}

/// Finds `ID: <digits>` (or `ID <digits>`) in page text
fn find_labelled_id(text: &str) -> Option<String> {
    for (index, _) in text.match_indices("ID") {
        let rest = &text[index + 2..];
        let after_label = rest.trim_start_matches(|c: char| c == ':' || c.is_whitespace());
        if after_label.len() == rest.len() {
            continue;
        }
        let digits: String = after_label.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            return Some(digits);
        }
    }
    None
}

fn is_damaged(document: &Html) -> bool {
    document_select(document, r#"div[data-testid="damaged"]"#)
        .map(|div| element_text(div).to_lowercase().contains("tak"))
        .unwrap_or(false)
}

/// Text of the last `<p>` inside `div[data-testid=testid]`
fn value_by_testid(document: &Html, testid: &str) -> String {
    let css = format!(r#"div[data-testid="{}"]"#, testid);
    let (Some(div), Ok(p)) = (document_select(document, &css), Selector::parse("p")) else {
        return String::new();
    };
    div.select(&p).last().map(element_text).unwrap_or_default()
}

fn document_select<'a>(document: &'a Html, css: &str) -> Option<ElementRef<'a>> {
    let selector = Selector::parse(css).ok()?;
    document.select(&selector).next()
}

fn first_text(document: &Html, css: &str) -> Option<String> {
    document_select(document, css)
        .map(element_text)
        .filter(|t| !t.is_empty())
}

fn element_text(element: ElementRef<'_>) -> String {
    collapse_whitespace(element.text())
}

fn collapse_whitespace<'a>(parts: impl Iterator<Item = &'a str>) -> String {
    parts
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}
