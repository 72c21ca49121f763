use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DriverStatus {
    Available,
    Offline,
}

/// A driver as published in the location snapshot. Point-in-time copy, possibly stale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverRecord {
    pub driver_id: Uuid,
    pub location: GeoPoint,
    pub rating: f64,
    pub deliveries_today: u32,
    pub last_assignment_at: Option<DateTime<Utc>>,
    pub status: DriverStatus,
}

/// A driver that passed radius, cooldown and lock filtering for one matching attempt.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub driver: DriverRecord,
    pub distance_km: f64,
    pub score: f64,
}
