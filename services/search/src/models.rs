use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use karigo_common::events::RidePublished;

pub const PUBLISHED: &str = "published";

/// A ride as the search index sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchDocument {
    pub ride_id: Uuid,
    pub driver_id: Uuid,
    pub origin: String,
    pub destination: String,
    pub departure_at: DateTime<Utc>,
    pub seats_available: i32,
    pub price_per_seat: i64,
    pub currency: String,
    pub status: String,
    pub indexed_at: DateTime<Utc>,
}

impl From<&RidePublished> for SearchDocument {
    fn from(ride: &RidePublished) -> Self {
        Self {
            ride_id: ride.ride_id,
            driver_id: ride.driver_id,
            origin: ride.origin.clone(),
            destination: ride.destination.clone(),
            departure_at: ride.departure_at,
            seats_available: ride.seats_available,
            price_per_seat: ride.price_per_seat,
            currency: ride.currency.clone(),
            status: PUBLISHED.to_string(),
            indexed_at: Utc::now(),
        }
    }
}

impl SearchDocument {
    pub fn is_bookable(&self) -> bool {
        self.status == PUBLISHED && self.seats_available > 0
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchQuery {
    pub origin: Option<String>,
    pub destination: Option<String>,
}

impl SearchQuery {
    /// Case-insensitive exact match on each given field.
    pub fn matches(&self, doc: &SearchDocument) -> bool {
        let field = |wanted: &Option<String>, actual: &str| {
            wanted
                .as_deref()
                .map(str::trim)
                .filter(|w| !w.is_empty())
                .map_or(true, |w| w.eq_ignore_ascii_case(actual.trim()))
        };
        field(&self.origin, &doc.origin) && field(&self.destination, &doc.destination)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc() -> SearchDocument {
        SearchDocument {
            ride_id: Uuid::new_v4(),
            driver_id: Uuid::new_v4(),
            origin: "Lyon".to_string(),
            destination: "Grenoble".to_string(),
            departure_at: Utc::now(),
            seats_available: 2,
            price_per_seat: 1200,
            currency: "EUR".to_string(),
            status: PUBLISHED.to_string(),
            indexed_at: Utc::now(),
        }
    }

    #[test]
    fn queries_match_case_insensitively_and_ignore_blank_fields() {
        let doc = doc();
        let query = |origin: Option<&str>, destination: Option<&str>| SearchQuery {
            origin: origin.map(String::from),
            destination: destination.map(String::from),
        };

        assert!(query(None, None).matches(&doc));
        assert!(query(Some("lyon"), Some(" GRENOBLE ")).matches(&doc));
        assert!(query(Some(""), Some("grenoble")).matches(&doc));
        assert!(!query(Some("Paris"), None).matches(&doc));
    }

    #[test]
    fn full_or_withdrawn_rides_are_not_bookable() {
        let mut doc = doc();
        assert!(doc.is_bookable());
        doc.seats_available = 0;
        assert!(!doc.is_bookable());
        doc.seats_available = 1;
        doc.status = "cancelled".to_string();
        assert!(!doc.is_bookable());
    }
}
