use std::collections::VecDeque;
use std::sync::Mutex;
#[cfg(test)]
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::{Duration, Instant};

/// Queried fresh at every escalation step; never cached across rounds.
pub trait PeakHourSignal: Send + Sync {
    fn is_peak_hours(&self) -> bool;
}

/// Reports peak hours when more than `threshold` orders arrived within `window`.
#[derive(Debug)]
pub struct OrderVolumeSignal {
    arrivals: Mutex<VecDeque<Instant>>,
    window: Duration,
    threshold: usize,
}

impl OrderVolumeSignal {
    pub fn new(window: Duration, threshold: usize) -> Self {
        Self {
            arrivals: Mutex::new(VecDeque::new()),
            window,
            threshold,
        }
    }

    pub fn record_order(&self) {
        let now = Instant::now();
        let mut arrivals = match self.arrivals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        arrivals.push_back(now);
        Self::prune(&mut arrivals, now, self.window);
    }

    pub fn recent_orders(&self) -> usize {
        let now = Instant::now();
        let mut arrivals = match self.arrivals.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Self::prune(&mut arrivals, now, self.window);
        arrivals.len()
    }

    fn prune(arrivals: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(oldest) = arrivals.front() {
            if now.duration_since(*oldest) >= window {
                arrivals.pop_front();
            } else {
                break;
            }
        }
    }
}

impl PeakHourSignal for OrderVolumeSignal {
    fn is_peak_hours(&self) -> bool {
        self.recent_orders() > self.threshold
    }
}

#[cfg(test)]
#[derive(Debug, Default)]
pub struct StaticPeak(AtomicBool);

#[cfg(test)]
impl StaticPeak {
    pub fn new(peak: bool) -> Self {
        Self(AtomicBool::new(peak))
    }
}

#[cfg(test)]
impl PeakHourSignal for StaticPeak {
    fn is_peak_hours(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}
