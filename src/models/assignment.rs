use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ResponseKind {
    Accept,
    Decline,
}

/// A driver's answer to an offer, reported back by the notification gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfferResponse {
    pub driver_id: Uuid,
    pub order_id: Uuid,
    pub response: ResponseKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum MatchEvent {
    Assigned(Assignment),
    Failed { order_id: Uuid, reason: String },
    Cancelled { order_id: Uuid },
}
