//! The catalog boundary: zone definitions and trusted prices.
//!
//! Catalog CRUD lives outside this service; the reservation path only
//! needs two things from it: the published zones (to seed the inventory
//! engine) and the trusted unit price of a zone when the client omits one.

use booking_rush_core::{Money, SaleWindow, ZoneKey};
use serde::Deserialize;
use std::collections::HashMap;

/// One published show-zone, as the catalog describes it.
#[derive(Debug, Clone, Deserialize)]
pub struct ZoneDef {
    /// The inventory key.
    #[serde(flatten)]
    pub zone: ZoneKey,
    /// Seats published for the zone.
    pub total_seats: u32,
    /// Trusted price per seat, minor units.
    pub unit_price: Money,
    /// ISO currency code.
    pub currency: String,
    /// Optional sale window.
    pub sale_window: Option<SaleWindow>,
}

/// Read-side view of the catalog.
pub trait PriceCatalog: Send + Sync {
    /// The trusted unit price of a zone, if published.
    fn unit_price(&self, zone: ZoneKey) -> Option<(Money, String)>;

    /// Every published zone; seeds the inventory engine at startup and
    /// bounds the reconciler's sweep.
    fn zones(&self) -> Vec<ZoneDef>;
}

/// A catalog snapshot loaded once at startup.
pub struct StaticCatalog {
    zones: Vec<ZoneDef>,
    prices: HashMap<ZoneKey, (Money, String)>,
}

impl StaticCatalog {
    /// Builds a catalog from zone definitions.
    #[must_use]
    pub fn new(zones: Vec<ZoneDef>) -> Self {
        let prices = zones
            .iter()
            .map(|def| (def.zone, (def.unit_price, def.currency.clone())))
            .collect();
        Self { zones, prices }
    }

    /// Parses a JSON array of zone definitions (the `CATALOG_JSON`
    /// environment variable).
    ///
    /// # Errors
    ///
    /// Returns the parse error if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let zones: Vec<ZoneDef> = serde_json::from_str(json)?;
        Ok(Self::new(zones))
    }
}

impl PriceCatalog for StaticCatalog {
    fn unit_price(&self, zone: ZoneKey) -> Option<(Money, String)> {
        self.prices.get(&zone).cloned()
    }

    fn zones(&self) -> Vec<ZoneDef> {
        self.zones.clone()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use booking_rush_core::{ShowId, ZoneId};

    #[test]
    fn catalog_json_roundtrip() {
        let show_id = ShowId::new();
        let zone_id = ZoneId::new();
        let json = format!(
            r#"[{{"show_id": "{show_id}", "zone_id": "{zone_id}",
                 "total_seats": 100, "unit_price": 2500, "currency": "THB"}}]"#
        );

        let catalog = StaticCatalog::from_json(&json).unwrap();
        let (price, currency) = catalog
            .unit_price(ZoneKey::new(show_id, zone_id))
            .unwrap();
        assert_eq!(price, Money::from_cents(2500));
        assert_eq!(currency, "THB");
        assert_eq!(catalog.zones().len(), 1);
    }
}
