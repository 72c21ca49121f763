use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::SnapshotError;
use crate::models::driver::DriverRecord;

/// Read-only view of available drivers, refreshed by a collaborator on its own schedule.
#[async_trait]
pub trait DriverSnapshotProvider: Send + Sync {
    async fn available_drivers(&self) -> Result<Arc<Vec<DriverRecord>>, SnapshotError>;
}

#[derive(Debug, Clone)]
struct Published {
    drivers: Arc<Vec<DriverRecord>>,
    refreshed_at: Option<DateTime<Utc>>,
}

/// Snapshot published into the process by the location pipeline.
///
/// Readers get a cheap `Arc` clone; a publish swaps the whole list.
#[derive(Debug)]
pub struct SharedSnapshot {
    inner: RwLock<Published>,
}

impl Default for SharedSnapshot {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedSnapshot {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Published {
                drivers: Arc::new(Vec::new()),
                refreshed_at: None,
            }),
        }
    }

    pub fn publish(&self, drivers: Vec<DriverRecord>) -> Result<(), SnapshotError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| SnapshotError::Unavailable("snapshot lock poisoned".to_string()))?;
        inner.drivers = Arc::new(drivers);
        inner.refreshed_at = Some(Utc::now());
        Ok(())
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.inner.read().ok().and_then(|inner| inner.refreshed_at)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .map(|inner| inner.drivers.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DriverSnapshotProvider for SharedSnapshot {
    async fn available_drivers(&self) -> Result<Arc<Vec<DriverRecord>>, SnapshotError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| SnapshotError::Unavailable("snapshot lock poisoned".to_string()))?;
        Ok(inner.drivers.clone())
    }
}
