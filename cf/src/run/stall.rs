//! Stall detection
//!
//! A rolling window of recent tool-call result hashes per run. When the
//! last N consecutive results are identical the worker is looping and the
//! run is terminated before it burns more budget.

use std::collections::VecDeque;

use sha2::{Digest, Sha256};

/// Hash a tool-call result for window comparison
pub fn hash_result(output: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(output.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Rolling window of result hashes
#[derive(Debug)]
pub struct StallWindow {
    hashes: VecDeque<String>,
    threshold: usize,
}

impl StallWindow {
    /// Window requiring `threshold` identical consecutive results
    pub fn new(threshold: usize) -> Self {
        Self {
            hashes: VecDeque::with_capacity(threshold.max(1)),
            threshold: threshold.max(1),
        }
    }

    /// Record a result hash
    pub fn push(&mut self, hash: String) {
        if self.hashes.len() == self.threshold {
            self.hashes.pop_front();
        }
        self.hashes.push_back(hash);
    }

    /// Whether the window is full of identical hashes
    pub fn is_stalled(&self) -> bool {
        self.hashes.len() == self.threshold && self.hashes.iter().all(|h| h == &self.hashes[0])
    }
}
