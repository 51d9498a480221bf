//! Pure transform from a raw scrape payload to a [`CanonicalListing`].
//!
//! The raw payload is an open JSON document whose shape varies by platform
//! and scraper version, so every field is narrowed individually and absence
//! degrades to a documented default. The only hard failure is a payload that
//! is not a key-value document at all. Given identical input, the output is
//! byte-for-byte identical, which is what makes canonical upserts safe to
//! re-run.

use std::sync::LazyLock;

use regex::Regex;
use scraper::Html;
use serde_json::Value;

use crate::canonical::{
    AMENITY_CATEGORIES, AmenityItem, CanonicalListing, Description, Host, HouseRule, Identity,
    Image, Location, Price, Property, RULE_PHASES, Ratings, Review, Sections,
};

#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("payload is not a structured document (got {0})")]
    NotADocument(&'static str),
}

static RE_BOLD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<(?:b|strong)\b[^>]*>(.*?)</(?:b|strong)\s*>")
        .expect("invalid regex: bold span")
});
static RE_LINE_BREAK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<br\s*/?>|</p>|</li>").expect("invalid regex: line break")
});
static RE_DIGITS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+").expect("invalid regex: digits"));
static RE_DECIMAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(?:\.\d+)?").expect("invalid regex: decimal"));
static RE_MONEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d[\d,]*(?:\.\d+)?").expect("invalid regex: money"));
static RE_ROOM_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/rooms/(\d+)").expect("invalid regex: room id"));

/// Normalize a raw scrape payload into the canonical document.
///
/// Fails only when `raw` is not a JSON object; every missing or oddly
/// shaped field inside the object falls back to its default instead.
pub fn normalize(raw: &Value) -> Result<CanonicalListing, NormalizeError> {
    if !raw.is_object() {
        return Err(NormalizeError::NotADocument(json_kind(raw)));
    }

    Ok(CanonicalListing {
        identity: derive_identity(raw),
        description: normalize_description(raw),
        property: normalize_property(raw),
        host: normalize_host(raw),
        location: normalize_location(raw),
        amenities: normalize_amenities(raw),
        house_rules: normalize_house_rules(raw),
        images: normalize_images(raw),
        ratings: normalize_ratings(raw),
        reviews: normalize_reviews(raw),
        price: normalize_price(raw),
    })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

// Field narrowing helpers. Each takes the `Option` straight from
// `Value::get` so call sites can chain lookups freely.

fn text_of(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn bool_of(value: Option<&Value>) -> bool {
    value.and_then(Value::as_bool).unwrap_or(false)
}

fn f64_of(value: Option<&Value>) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0)
}

fn array_of<'a>(value: Option<&'a Value>) -> &'a [Value] {
    value
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Strip tags, unescape entities and collapse whitespace.
fn html_to_text(html: &str) -> String {
    let spaced = RE_LINE_BREAK.replace_all(html, " ");
    let fragment = Html::parse_fragment(&spaced);
    normalize_whitespace(&fragment.root_element().text().collect::<String>())
}

// Identity

fn derive_identity(raw: &Value) -> Identity {
    let mut id = text_of(raw.get("id"));
    if id.is_empty() {
        id = text_of(raw.get("listingId"));
    }
    let url = text_of(raw.get("url"));
    if id.is_empty()
        && let Some(caps) = RE_ROOM_ID.captures(&url)
    {
        id = caps[1].to_string();
    }

    let canonical_url = if !url.is_empty() {
        url
    } else if !id.is_empty() {
        format!("https://www.airbnb.com/rooms/{}", id)
    } else {
        String::new()
    };

    Identity {
        id,
        canonical_url,
        language: text_of(raw.get("language")),
        is_guest_favorite: bool_of(raw.get("isGuestFavorite")),
    }
}

// Description

fn normalize_description(raw: &Value) -> Description {
    let mut raw_html = text_of(raw.get("htmlDescription").and_then(|h| h.get("htmlText")));
    if raw_html.is_empty() {
        raw_html = text_of(raw.get("description"));
    }

    let mut sections = split_sections(&raw_html);
    apply_location_blurbs(&mut sections, raw);

    Description {
        plain_text: html_to_text(&raw_html),
        raw_html,
        sections,
    }
}

/// Split the description blob on its bold-tagged headers.
///
/// Text before the first bold span is the listing description proper; the
/// text between one bold span and the next belongs to the section named by
/// that span's label. Labels are matched case-insensitively against a small
/// known set; an unrecognized label's body is discarded.
fn split_sections(html: &str) -> Sections {
    let mut sections = Sections::default();

    let mut spans: Vec<(String, usize, usize)> = Vec::new();
    for caps in RE_BOLD.captures_iter(html) {
        if let (Some(whole), Some(label)) = (caps.get(0), caps.get(1)) {
            spans.push((html_to_text(label.as_str()), whole.start(), whole.end()));
        }
    }

    let lead_end = spans.first().map(|(_, start, _)| *start).unwrap_or(html.len());
    sections.listing_description = html_to_text(&html[..lead_end]);

    for (i, (label, _, body_start)) in spans.iter().enumerate() {
        let body_end = spans
            .get(i + 1)
            .map(|(_, next_start, _)| *next_start)
            .unwrap_or(html.len());
        let body = html_to_text(&html[*body_start..body_end]);

        let lower = label.to_lowercase();
        if lower.contains("guest access") || lower.contains("guest interaction") {
            sections.guest_access = body;
        } else if lower.contains("other things to note") || lower.contains("other notes") {
            sections.other_notes = body;
        } else if lower.contains("space") {
            sections.space = body;
        } else {
            log::debug!("Discarding unrecognized description header '{}'", label);
        }
    }

    sections
}

/// The neighbourhood sections come from a separate list of titled location
/// blurbs, independent of the bold-tag pass.
fn apply_location_blurbs(sections: &mut Sections, raw: &Value) {
    for blurb in array_of(raw.get("locationDescriptions")) {
        let title = text_of(blurb.get("title")).to_lowercase();
        let content = html_to_text(&text_of(blurb.get("content")));
        if title.contains("neighbourhood") || title.contains("neighborhood") {
            sections.neighbourhood = content;
        } else if title.contains("getting around") {
            sections.getting_around = content;
        }
    }
}

// Property

fn extract_count(text: &str) -> Option<u32> {
    RE_DIGITS.find(text)?.as_str().parse().ok()
}

fn extract_decimal(text: &str) -> Option<f64> {
    RE_DECIMAL.find(text)?.as_str().parse().ok()
}

fn normalize_property(raw: &Value) -> Property {
    let mut property = Property {
        room_type: text_of(raw.get("roomType")),
        property_type: text_of(raw.get("propertyType")),
        capacity: raw
            .get("personCapacity")
            .and_then(Value::as_u64)
            .map(|n| n as u32),
        bedrooms: None,
        beds: None,
        baths: None,
    };

    // Counts arrive as free-text items ("2 guests", "1.5 baths", "Studio").
    // "bedroom" must be checked before "bed", and a digitless descriptor
    // leaves the field unset.
    for item in array_of(raw.get("subDescription").and_then(|s| s.get("items"))) {
        let Some(text) = item.as_str() else { continue };
        let lower = text.to_lowercase();
        if lower.contains("guest") {
            property.capacity = extract_count(text).or(property.capacity);
        } else if lower.contains("bedroom") {
            property.bedrooms = extract_count(text);
        } else if lower.contains("bath") {
            property.baths = extract_decimal(text);
        } else if lower.contains("bed") {
            property.beds = extract_count(text);
        }
    }

    property
}

// Host and location

fn normalize_host(raw: &Value) -> Host {
    let host = raw.get("host");
    Host {
        id: text_of(host.and_then(|h| h.get("id"))),
        name: text_of(host.and_then(|h| h.get("name"))),
        is_superhost: bool_of(host.and_then(|h| h.get("isSuperHost")))
            || bool_of(host.and_then(|h| h.get("isSuperhost"))),
    }
}

fn normalize_location(raw: &Value) -> Location {
    let coordinates = raw.get("coordinates");
    Location {
        lat: f64_of(coordinates.and_then(|c| c.get("latitude"))),
        lng: f64_of(coordinates.and_then(|c| c.get("longitude"))),
        // Upstream rarely carries these; empty strings are the documented
        // default.
        city: text_of(raw.get("city")),
        region: text_of(raw.get("region")),
        country: text_of(raw.get("country")),
    }
}

// Amenities

fn canonical_category(title: &str) -> &'static str {
    let lower = title.trim().to_lowercase();
    if lower.is_empty() {
        return "Other";
    }
    AMENITY_CATEGORIES
        .iter()
        .find(|category| {
            let canonical = category.to_lowercase();
            canonical == lower || canonical.contains(&lower) || lower.contains(&canonical)
        })
        .copied()
        .unwrap_or("Other")
}

fn availability_of(value: Option<&Value>) -> bool {
    match value {
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) => {
            s.eq_ignore_ascii_case("available") || s.eq_ignore_ascii_case("true")
        }
        // Listed without a flag means offered.
        _ => true,
    }
}

fn normalize_amenities(raw: &Value) -> indexmap::IndexMap<String, Vec<AmenityItem>> {
    let mut amenities: indexmap::IndexMap<String, Vec<AmenityItem>> = AMENITY_CATEGORIES
        .iter()
        .map(|category| (category.to_string(), Vec::new()))
        .collect();

    for group in array_of(raw.get("amenities")) {
        let category = canonical_category(&text_of(group.get("title")));
        let items = array_of(group.get("values")).iter().map(|item| AmenityItem {
            title: text_of(item.get("title")),
            available: availability_of(item.get("available")),
            subtitle: text_of(item.get("subtitle")),
        });
        if let Some(bucket) = amenities.get_mut(category) {
            bucket.extend(items);
        }
    }

    amenities
}

// House rules

fn rule_phase(title: &str) -> &'static str {
    let lower = title.to_lowercase();
    if lower.contains("check") {
        "checking_in_and_out"
    } else if lower.contains("during") || lower.contains("stay") {
        "during_your_stay"
    } else if lower.contains("leav") || lower.contains("before") {
        "before_you_leave"
    } else {
        "general"
    }
}

fn normalize_house_rules(raw: &Value) -> indexmap::IndexMap<String, Vec<HouseRule>> {
    let mut house_rules: indexmap::IndexMap<String, Vec<HouseRule>> = RULE_PHASES
        .iter()
        .map(|phase| (phase.to_string(), Vec::new()))
        .collect();

    // Either a bare list of groups or an object with the groups under
    // `general`, depending on scraper version.
    let container = raw.get("houseRules");
    let groups = match container {
        Some(Value::Array(groups)) => groups.as_slice(),
        Some(other) => array_of(other.get("general")),
        None => &[],
    };

    for group in groups {
        let phase = rule_phase(&text_of(group.get("title")));
        let rules = array_of(group.get("values"))
            .iter()
            .map(|rule| HouseRule {
                title: text_of(rule.get("title")),
            });
        if let Some(bucket) = house_rules.get_mut(phase) {
            bucket.extend(rules);
        }
    }

    // Free-text additional rules ride along in the general bucket.
    let additional = normalize_whitespace(&text_of(container.and_then(|c| c.get("additional"))));
    if !additional.is_empty()
        && let Some(bucket) = house_rules.get_mut("general")
    {
        bucket.push(HouseRule { title: additional });
    }

    house_rules
}

// Images, ratings, reviews

fn normalize_images(raw: &Value) -> Vec<Image> {
    array_of(raw.get("images"))
        .iter()
        .map(|image| {
            let mut url = text_of(image.get("url"));
            if url.is_empty() {
                url = text_of(image.get("imageUrl"));
            }
            Image {
                url,
                title: text_of(image.get("title")),
            }
        })
        .collect()
}

fn normalize_ratings(raw: &Value) -> Ratings {
    let rating = raw.get("rating");
    let review_count = rating
        .and_then(|r| r.get("reviewsCount").or_else(|| r.get("reviewCount")))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    Ratings {
        value: f64_of(rating.and_then(|r| r.get("value"))),
        accuracy: f64_of(rating.and_then(|r| r.get("accuracy"))),
        checkin: f64_of(rating.and_then(|r| r.get("checkin"))),
        location: f64_of(rating.and_then(|r| r.get("location"))),
        cleanliness: f64_of(rating.and_then(|r| r.get("cleanliness"))),
        review_count,
        communication: f64_of(rating.and_then(|r| r.get("communication"))),
        guest_satisfaction: f64_of(rating.and_then(|r| r.get("guestSatisfaction"))),
    }
}

fn person_name(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(person @ Value::Object(_)) => {
            let first_name = text_of(person.get("firstName"));
            if first_name.is_empty() {
                text_of(person.get("name"))
            } else {
                first_name
            }
        }
        _ => String::new(),
    }
}

fn normalize_reviews(raw: &Value) -> Vec<Review> {
    array_of(raw.get("reviews"))
        .iter()
        .filter(|review| review.is_object())
        .map(|review| {
            let mut localized_response = text_of(review.get("localizedResponse"));
            if localized_response.is_empty() {
                localized_response = text_of(review.get("response"));
            }
            Review {
                rating: review.get("rating").and_then(Value::as_i64).unwrap_or(0),
                reviewee: person_name(review.get("reviewee")),
                reviewer: person_name(review.get("reviewer")),
                created_at: text_of(review.get("createdAt")),
                subtitle_items: array_of(review.get("subtitleItems"))
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect(),
                localized_review: text_of(review.get("localizedReview")),
                localized_response,
                highlight: text_of(review.get("highlight")),
            }
        })
        .collect()
}

// Price

/// First run of digits with an optional decimal point; thousands
/// separators dropped; no digits at all is 0.0.
fn parse_money(text: &str) -> f64 {
    RE_MONEY
        .find(text)
        .map(|m| m.as_str().replace(',', "").parse().unwrap_or(0.0))
        .unwrap_or(0.0)
}

fn currency_code(text: &str) -> &'static str {
    for ch in text.chars() {
        match ch {
            '$' => return "USD",
            '€' => return "EUR",
            '£' => return "GBP",
            '¥' => return "JPY",
            _ => {}
        }
    }
    ""
}

/// Money fields arrive either as a formatted string, a bare number, or an
/// object with a `price` string inside.
fn money_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        Some(nested @ Value::Object(_)) => text_of(nested.get("price")),
        _ => String::new(),
    }
}

fn normalize_price(raw: &Value) -> Price {
    let price = raw.get("price");

    if let Some(Value::String(s)) = price {
        return Price {
            total: parse_money(s),
            currency: currency_code(s).to_string(),
            ..Price::default()
        };
    }

    let breakdown = price.and_then(|p| p.get("breakDown").or_else(|| p.get("breakdown")));
    let base_text = money_text(breakdown.and_then(|b| b.get("basePrice")));
    let cleaning_text = money_text(breakdown.and_then(|b| b.get("cleaningFee")));
    let service_text = money_text(breakdown.and_then(|b| b.get("serviceFee")));
    let taxes_text = money_text(breakdown.and_then(|b| b.get("taxes")));
    let mut total_text = money_text(breakdown.and_then(|b| b.get("total")));
    if total_text.is_empty() {
        total_text = money_text(price.and_then(|p| p.get("total")));
    }
    if total_text.is_empty() {
        total_text = money_text(price.and_then(|p| p.get("price")));
    }

    let currency = [
        &total_text,
        &base_text,
        &cleaning_text,
        &service_text,
        &taxes_text,
    ]
    .iter()
    .map(|text| currency_code(text))
    .find(|code| !code.is_empty())
    .unwrap_or("");

    Price {
        base_price: parse_money(&base_text),
        cleaning_fee: parse_money(&cleaning_text),
        service_fee: parse_money(&service_text),
        taxes: parse_money(&taxes_text),
        total: parse_money(&total_text),
        currency: currency.to_string(),
    }
}
