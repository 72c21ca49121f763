use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::driver::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ServiceAreaClass {
    Urban,
    Suburban,
}

impl ServiceAreaClass {
    pub fn max_radius_km(self) -> f64 {
        match self {
            ServiceAreaClass::Urban => 15.0,
            ServiceAreaClass::Suburban => 25.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Matching,
    Assigned,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub pickup: GeoPoint,
    pub service_area_class: ServiceAreaClass,
    pub status: OrderStatus,
    pub assigned_driver: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}
