//! The built-in exercise payload: a shifted sphere function.
//!
//! Deliberately boring, deterministic work so the binaries can drive the
//! dispatch stack end to end without any real optimization problem
//! attached. The raw result is the sum of squared distances from the
//! optimum; the transformed result is its square root.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use optforge_core::{EvalError, Evaluate, ResultPair, WorkItem};

const OPTIMUM: f64 = 0.5;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SphereCandidate {
    pub coords: Vec<f64>,
    /// Artificial evaluation cost, to make remote dispatch observable.
    pub eval_ms: u64,
}

impl SphereCandidate {
    /// Deterministic candidate derived from its position in a batch, so
    /// server and worker logs can be cross-checked without shared state.
    pub fn seeded(batch: u64, slot: usize, dimension: usize, eval_ms: u64) -> Self {
        let coords = (0..dimension)
            .map(|axis| {
                let wobble = ((batch as usize + slot + axis) % 17) as f64;
                OPTIMUM + wobble / 16.0
            })
            .collect();
        Self { coords, eval_ms }
    }
}

impl Evaluate for SphereCandidate {
    fn evaluate(&mut self) -> Result<Vec<ResultPair>, EvalError> {
        if self.coords.is_empty() {
            return Err(EvalError::Flagged("empty candidate".to_string()));
        }
        if self.eval_ms > 0 {
            std::thread::sleep(Duration::from_millis(self.eval_ms));
        }
        let raw: f64 = self
            .coords
            .iter()
            .map(|coord| (coord - OPTIMUM) * (coord - OPTIMUM))
            .sum();
        Ok(vec![ResultPair::new(raw, raw.sqrt())])
    }
}

/// A fresh demo batch of the given size.
pub fn demo_batch(batch: u64, size: usize, dimension: usize, eval_ms: u64) -> Vec<WorkItem<SphereCandidate>> {
    (0..size)
        .map(|slot| WorkItem::new(SphereCandidate::seeded(batch, slot, dimension, eval_ms)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use optforge_core::ItemStatus;

    #[test]
    fn sphere_is_zero_at_the_optimum() {
        let mut item = WorkItem::new(SphereCandidate {
            coords: vec![OPTIMUM; 4],
            eval_ms: 0,
        });
        item.process();
        assert_eq!(item.status(), ItemStatus::Processed);
        assert_eq!(item.results()[0].raw, 0.0);
    }

    #[test]
    fn empty_candidates_are_flagged() {
        let mut item = WorkItem::new(SphereCandidate {
            coords: Vec::new(),
            eval_ms: 0,
        });
        item.process();
        assert_eq!(item.status(), ItemStatus::ErrorFlagged);
    }

    #[test]
    fn seeding_is_deterministic() {
        let a = SphereCandidate::seeded(3, 1, 8, 0);
        let b = SphereCandidate::seeded(3, 1, 8, 0);
        assert_eq!(a.coords, b.coords);
    }
}
