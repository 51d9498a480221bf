use std::fmt::Display;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Amenity categories in canonical order. The normalized document always
/// carries every category, empty or not, so consumers can diff documents
/// positionally. Groups whose upstream title matches none of these are
/// bucketed under `Other`.
pub const AMENITY_CATEGORIES: [&str; 14] = [
    "Bathroom",
    "Bedroom and laundry",
    "Entertainment",
    "Family",
    "Heating and cooling",
    "Home safety",
    "Internet and office",
    "Kitchen and dining",
    "Location features",
    "Outdoor",
    "Parking and facilities",
    "Services",
    "Not included",
    "Other",
];

/// House-rule phases in canonical order. Unmatched upstream groups are
/// bucketed under `general`, never dropped.
pub const RULE_PHASES: [&str; 4] = [
    "checking_in_and_out",
    "during_your_stay",
    "before_you_leave",
    "general",
];

/// The normalized listing document. One logical entity per listing
/// identity, derived from (not owned by) a scrape attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanonicalListing {
    pub identity: Identity,
    pub description: Description,
    pub property: Property,
    pub host: Host,
    pub location: Location,
    pub amenities: IndexMap<String, Vec<AmenityItem>>,
    pub house_rules: IndexMap<String, Vec<HouseRule>>,
    pub images: Vec<Image>,
    pub ratings: Ratings,
    pub reviews: Vec<Review>,
    pub price: Price,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: String,
    pub canonical_url: String,
    pub language: String,
    pub is_guest_favorite: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Description {
    pub raw_html: String,
    pub plain_text: String,
    pub sections: Sections,
}

/// Fixed-key section mapping. Every key is always present; absent
/// sections are empty strings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Sections {
    pub listing_description: String,
    pub space: String,
    pub guest_access: String,
    pub other_notes: String,
    pub neighbourhood: String,
    pub getting_around: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Property {
    pub room_type: String,
    pub property_type: String,
    pub capacity: Option<u32>,
    pub bedrooms: Option<u32>,
    pub beds: Option<u32>,
    pub baths: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Host {
    pub id: String,
    pub name: String,
    pub is_superhost: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub lat: f64,
    pub lng: f64,
    pub city: String,
    pub region: String,
    pub country: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AmenityItem {
    pub title: String,
    pub available: bool,
    pub subtitle: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HouseRule {
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Image {
    pub url: String,
    pub title: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ratings {
    pub value: f64,
    pub accuracy: f64,
    pub checkin: f64,
    pub location: f64,
    pub cleanliness: f64,
    pub review_count: u64,
    pub communication: f64,
    pub guest_satisfaction: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Review {
    pub rating: i64,
    pub reviewee: String,
    pub reviewer: String,
    pub created_at: String,
    pub subtitle_items: Vec<String>,
    pub localized_review: String,
    pub localized_response: String,
    pub highlight: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Price {
    pub base_price: f64,
    pub cleaning_fee: f64,
    pub service_fee: f64,
    pub taxes: f64,
    pub total: f64,
    pub currency: String,
}

impl Display for CanonicalListing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "┌─ {} ─ {}",
            if self.identity.id.is_empty() {
                "(no id)"
            } else {
                self.identity.id.as_str()
            },
            self.identity.canonical_url
        )?;
        if !self.property.room_type.is_empty() {
            writeln!(f, "│  {}", self.property.room_type)?;
        }
        if let Some(capacity) = self.property.capacity {
            writeln!(f, "│  Sleeps {}", capacity)?;
        }
        writeln!(f, "│  Host: {}", self.host.name)?;
        if self.ratings.review_count > 0 {
            writeln!(
                f,
                "│  Rated {} over {} review(s)",
                self.ratings.guest_satisfaction, self.ratings.review_count
            )?;
        }
        if self.price.total > 0.0 {
            writeln!(f, "│  Total: {} {}", self.price.total, self.price.currency)?;
        }
        let amenity_count: usize = self.amenities.values().map(Vec::len).sum();
        writeln!(
            f,
            "└─ {} amenity item(s), {} image(s), {} review(s)",
            amenity_count,
            self.images.len(),
            self.reviews.len()
        )
    }
}

impl Display for AmenityItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} [{}]",
            self.title,
            if self.available { "yes" } else { "no" }
        )?;
        if !self.subtitle.is_empty() {
            write!(f, " — {}", self.subtitle)?;
        }
        Ok(())
    }
}
