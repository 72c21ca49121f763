use std::cmp::Ordering;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::engine::cooldown::{fairness_score, recency_score};
use crate::models::driver::Candidate;

const RATING_WEIGHT: f64 = 0.40;
const FAIRNESS_WEIGHT: f64 = 0.30;
const RECENCY_WEIGHT: f64 = 0.20;
const JITTER_WEIGHT: f64 = 0.10;

/// Drivers whose distances chain together within this band compete on score.
pub const TIER_TOLERANCE_KM: f64 = 0.25;

const TIER_EPSILON_KM: f64 = 1e-9;

/// Source of the random scoring term, drawn from `[0, 1)`.
pub trait JitterSource: Send + Sync {
    fn sample(&self) -> f64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRngJitter;

impl JitterSource for ThreadRngJitter {
    fn sample(&self) -> f64 {
        rand::thread_rng().gen_range(0.0..1.0)
    }
}

/// Reproducible jitter for simulations and replays.
#[derive(Debug)]
pub struct SeededJitter {
    rng: Mutex<StdRng>,
}

impl SeededJitter {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl JitterSource for SeededJitter {
    fn sample(&self) -> f64 {
        match self.rng.lock() {
            Ok(mut rng) => rng.gen_range(0.0..1.0),
            Err(poisoned) => poisoned.into_inner().gen_range(0.0..1.0),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedJitter(pub f64);

impl JitterSource for FixedJitter {
    fn sample(&self) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreBreakdown {
    pub rating_score: f64,
    pub fairness_score: f64,
    pub recency_score: f64,
    pub jitter: f64,
}

pub fn weighted_score(breakdown: &ScoreBreakdown) -> f64 {
    (breakdown.rating_score * RATING_WEIGHT)
        + (breakdown.fairness_score * FAIRNESS_WEIGHT)
        + (breakdown.recency_score * RECENCY_WEIGHT)
        + (breakdown.jitter * JITTER_WEIGHT)
}

fn rating_score(rating: f64) -> f64 {
    (rating / 5.0).clamp(0.0, 1.0)
}

/// Returns the closest distance tier. Tiers are built by walking candidates in
/// ascending distance and starting a new tier whenever the gap to the previous
/// candidate exceeds `tolerance_km`.
pub fn closest_tier(mut candidates: Vec<Candidate>, tolerance_km: f64) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        a.distance_km
            .total_cmp(&b.distance_km)
            .then_with(|| a.driver.driver_id.cmp(&b.driver.driver_id))
    });

    let mut tier_end = candidates.len();
    for (idx, pair) in candidates.windows(2).enumerate() {
        if pair[1].distance_km - pair[0].distance_km > tolerance_km + TIER_EPSILON_KM {
            tier_end = idx + 1;
            break;
        }
    }

    candidates.truncate(tier_end);
    candidates
}

pub struct CandidateScorer {
    jitter: Arc<dyn JitterSource>,
}

impl CandidateScorer {
    pub fn new(jitter: Arc<dyn JitterSource>) -> Self {
        Self { jitter }
    }

    pub fn breakdown(&self, candidate: &Candidate, now: DateTime<Utc>) -> ScoreBreakdown {
        ScoreBreakdown {
            rating_score: rating_score(candidate.driver.rating),
            fairness_score: fairness_score(candidate.driver.deliveries_today),
            recency_score: recency_score(candidate.driver.last_assignment_at, now),
            jitter: self.jitter.sample(),
        }
    }

    /// Scores the closest tier and returns it best-first. Farther tiers are dropped.
    pub fn rank(&self, candidates: Vec<Candidate>, now: DateTime<Utc>) -> Vec<Candidate> {
        let mut tier = closest_tier(candidates, TIER_TOLERANCE_KM);

        for candidate in &mut tier {
            let breakdown = self.breakdown(candidate, now);
            candidate.score = weighted_score(&breakdown);
        }

        tier.sort_by(|a, b| match b.score.total_cmp(&a.score) {
            Ordering::Equal => a.driver.driver_id.cmp(&b.driver.driver_id),
            other => other,
        });
        tier
    }
}
