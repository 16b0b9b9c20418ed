use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// structs

/// Best and average fitness scores of a single generation, computed by the
/// trainer after each call to `evaluate_generation`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PopEvaluation {
    pub best_fitness: f64,
    pub avg_fitness: f64,
}

impl PopEvaluation {
    /// Summarize a set of fitness scores. Returns `None` for an empty set.
    pub fn from_scores(scores: impl IntoIterator<Item = f64>) -> Option<Self> {
        let mut best_fitness = f64::NEG_INFINITY;
        let mut sum = 0.0;
        let mut n = 0usize;
        for s in scores {
            best_fitness = best_fitness.max(s);
            sum += s;
            n += 1;
        }

        (n > 0).then(|| Self {
            best_fitness,
            avg_fitness: sum / n as f64,
        })
    }
}

// util functions

pub fn env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("${} not set", key))
}

/// Lock a mutex, recovering the guard if a previous holder panicked.
///
/// The scheduler state stays consistent across a panic in an unrelated
/// thread because every mutation completes before the guard is released.
pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Return `Error::Config` with a formatted message unless the condition holds
#[macro_export]
macro_rules! bail_assert {
    ($cond:expr) => {
        if !$cond {
            return Err($crate::Error::Config(format!(
                "Assertion failed: {}",
                stringify!($cond)
            ))
            .into());
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::Error::Config(format!($($arg)+)).into());
        }
    };
}
