use std::collections::HashMap;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::recipient::{GeoPoint, Recipient};

pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let d_lat = (b.lat - a.lat).to_radians();
    let d_lng = (b.lng - a.lng).to_radians();

    let h = (d_lat / 2.0).sin().powi(2)
        + a.lat.to_radians().cos() * b.lat.to_radians().cos() * (d_lng / 2.0).sin().powi(2);

    2.0 * EARTH_RADIUS_KM * h.sqrt().min(1.0).asin()
}

fn probability(p: f64) -> f64 {
    if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) }
}

#[derive(Debug, Clone)]
pub struct GeoFilterConfig {
    pub radius_km: f64,
    /// Fraction of the radius inside which recipients are always included.
    pub inner_ratio: f64,
    pub boundary_probability: f64,
    pub unknown_location_probability: f64,
}

impl Default for GeoFilterConfig {
    fn default() -> Self {
        Self {
            radius_km: 30.0,
            inner_ratio: 0.8,
            boundary_probability: 0.5,
            unknown_location_probability: 0.3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Zone {
    Inner,
    Boundary,
    Outside,
    Unknown,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoSelectionStats {
    pub inner: usize,
    pub boundary_included: usize,
    pub boundary_dropped: usize,
    pub outside: usize,
    pub unknown_included: usize,
    pub unknown_dropped: usize,
}

impl GeoSelectionStats {
    pub fn included(&self) -> usize {
        self.inner + self.boundary_included + self.unknown_included
    }
}

/// Narrows recipients to those near an event.
///
/// Classification by distance is deterministic and may be memoised; the
/// inclusion draws for the boundary band and unknown locations are not.
pub struct GeoFilter {
    config: GeoFilterConfig,
}

impl GeoFilter {
    pub fn new(config: GeoFilterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeoFilterConfig {
        &self.config
    }

    pub fn classify(&self, event: GeoPoint, location: Option<GeoPoint>) -> Zone {
        let Some(location) = location else {
            return Zone::Unknown;
        };

        let distance = haversine_km(event, location);
        if !distance.is_finite() {
            Zone::Unknown
        } else if distance <= self.config.radius_km * self.config.inner_ratio {
            Zone::Inner
        } else if distance <= self.config.radius_km {
            Zone::Boundary
        } else {
            Zone::Outside
        }
    }

    pub fn classify_all<'a>(
        &self,
        event: GeoPoint,
        recipients: impl IntoIterator<Item = &'a Recipient>,
    ) -> HashMap<String, Zone> {
        recipients
            .into_iter()
            .map(|r| (r.user_id.clone(), self.classify(event, r.location)))
            .collect()
    }

    pub fn include<R: Rng + ?Sized>(&self, zone: Zone, rng: &mut R) -> bool {
        match zone {
            Zone::Inner => true,
            Zone::Outside => false,
            Zone::Boundary => rng.random_bool(probability(self.config.boundary_probability)),
            Zone::Unknown => rng.random_bool(probability(self.config.unknown_location_probability)),
        }
    }

    /// Applies the inclusion policy. Recipients missing from `zones` are
    /// classified on the spot.
    pub fn filter<'a, R: Rng + ?Sized>(
        &self,
        event: GeoPoint,
        recipients: impl IntoIterator<Item = &'a Recipient>,
        zones: &HashMap<String, Zone>,
        rng: &mut R,
    ) -> (Vec<&'a Recipient>, GeoSelectionStats) {
        let mut stats = GeoSelectionStats::default();
        let mut selected = Vec::new();

        for recipient in recipients {
            let zone = zones
                .get(&recipient.user_id)
                .copied()
                .unwrap_or_else(|| self.classify(event, recipient.location));
            let included = self.include(zone, rng);

            match (zone, included) {
                (Zone::Inner, _) => stats.inner += 1,
                (Zone::Outside, _) => stats.outside += 1,
                (Zone::Boundary, true) => stats.boundary_included += 1,
                (Zone::Boundary, false) => stats.boundary_dropped += 1,
                (Zone::Unknown, true) => stats.unknown_included += 1,
                (Zone::Unknown, false) => stats.unknown_dropped += 1,
            }

            if included {
                selected.push(recipient);
            }
        }

        debug!(
            radius_km = self.config.radius_km,
            included = stats.included(),
            outside = stats.outside,
            "Geo filter applied"
        );

        (selected, stats)
    }
}
