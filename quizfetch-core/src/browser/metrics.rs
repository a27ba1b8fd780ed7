use serde::{Deserialize, Serialize};

use super::task::FailureClassification;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExportMetrics {
    pub attempts: u64,
    pub downloads: u64,
    pub popups: u64,
    pub rate_limits: u64,
    pub timeouts: u64,
    pub not_found: u64,
    pub other_failures: u64,
    pub same_round_requeues: u64,
    pub next_round_requeues: u64,
}

impl ExportMetrics {
    pub fn record_attempt(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    pub fn record_download(&mut self) {
        self.downloads = self.downloads.saturating_add(1);
    }

    pub fn record_failure(&mut self, failure: &FailureClassification) {
        let counter = match failure {
            FailureClassification::Popup => &mut self.popups,
            FailureClassification::RateLimited => &mut self.rate_limits,
            FailureClassification::Timeout => &mut self.timeouts,
            FailureClassification::NotFound => &mut self.not_found,
            FailureClassification::Other(_) => &mut self.other_failures,
        };
        *counter = counter.saturating_add(1);
    }

    pub fn record_same_round_requeue(&mut self) {
        self.same_round_requeues = self.same_round_requeues.saturating_add(1);
    }

    pub fn record_next_round_requeue(&mut self) {
        self.next_round_requeues = self.next_round_requeues.saturating_add(1);
    }

    pub fn success_rate(&self) -> f64 {
        if self.attempts == 0 {
            0.0
        } else {
            (self.downloads as f64 / self.attempts as f64) * 100.0
        }
    }
}
