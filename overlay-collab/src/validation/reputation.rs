//! Peer reputation and report-based blocking.
//!
//! Reputation lives outside the link (normally with the backend). The gate
//! only reads it through [`ReputationSource`]. [`ReportLedger`] is the
//! in-memory source: reports carry a category weight and an expiry, and
//! the score is recomputed from the reports still active.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use crate::protocol::now_millis;

pub const MAX_SCORE: i32 = 100;

/// Report category. Each carries its own score decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportReason {
    Spam,
    Harassment,
    Inappropriate,
    Impersonation,
    Other,
}

impl ReportReason {
    pub fn weight(&self) -> i32 {
        match self {
            ReportReason::Spam => 10,
            ReportReason::Harassment => 20,
            ReportReason::Inappropriate => 15,
            ReportReason::Impersonation => 25,
            ReportReason::Other => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerReputation {
    pub score: i32,
    pub report_count: u32,
    pub is_blocked: bool,
}

impl Default for PeerReputation {
    fn default() -> Self {
        Self {
            score: MAX_SCORE,
            report_count: 0,
            is_blocked: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerReport {
    pub reporter: String,
    pub reported: String,
    pub reason: ReportReason,
    pub created_at: i64,
    pub expires_at: i64,
}

impl PeerReport {
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.expires_at > now_ms
    }
}

/// Read side of the reputation store.
pub trait ReputationSource: Send + Sync {
    fn reputation(&self, user_id: &str, now_ms: i64) -> PeerReputation;

    /// Reports against `user_id` that have not expired at `now_ms`.
    fn active_reports(&self, user_id: &str, now_ms: i64) -> Vec<PeerReport>;
}

/// When a reputation turns into a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReputationPolicy {
    /// Score at or below which a peer is blocked.
    pub block_threshold: i32,
    /// Active reports with one reason that block regardless of score.
    pub same_reason_limit: usize,
}

impl Default for ReputationPolicy {
    fn default() -> Self {
        Self {
            block_threshold: 20,
            same_reason_limit: 5,
        }
    }
}

/// Why a peer is blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockCause {
    Flagged,
    LowScore(i32),
    RepeatedReports(ReportReason, usize),
}

impl std::fmt::Display for BlockCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockCause::Flagged => f.write_str("blocked"),
            BlockCause::LowScore(score) => write!(f, "reputation score {score}"),
            BlockCause::RepeatedReports(reason, n) => write!(f, "{n} active {reason:?} reports"),
        }
    }
}

impl ReputationPolicy {
    /// Evaluate the block rule for one user.
    pub fn evaluate(
        &self,
        source: &dyn ReputationSource,
        user_id: &str,
        now_ms: i64,
    ) -> Option<BlockCause> {
        let rep = source.reputation(user_id, now_ms);
        if rep.is_blocked {
            return Some(BlockCause::Flagged);
        }
        if rep.score <= self.block_threshold {
            return Some(BlockCause::LowScore(rep.score));
        }

        let mut by_reason: HashMap<ReportReason, usize> = HashMap::new();
        for report in source.active_reports(user_id, now_ms) {
            *by_reason.entry(report.reason).or_default() += 1;
        }
        by_reason
            .into_iter()
            .filter(|(_, n)| *n >= self.same_reason_limit)
            .max_by_key(|(_, n)| *n)
            .map(|(reason, n)| BlockCause::RepeatedReports(reason, n))
    }
}

#[derive(Debug, Default)]
struct LedgerEntry {
    flagged: bool,
    reports: Vec<PeerReport>,
}

/// In-memory reputation store with categorized decrements and expiry.
pub struct ReportLedger {
    entries: RwLock<HashMap<String, LedgerEntry>>,
    retention: Duration,
}

impl ReportLedger {
    pub fn new(retention: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            retention,
        }
    }

    /// File a report at the current time.
    pub fn report(&self, reporter: &str, reported: &str, reason: ReportReason) -> PeerReputation {
        self.report_at(reporter, reported, reason, now_millis())
    }

    /// File a report at `now_ms`. A reporter's repeat of an active report
    /// with the same reason is ignored.
    pub fn report_at(
        &self,
        reporter: &str,
        reported: &str,
        reason: ReportReason,
        now_ms: i64,
    ) -> PeerReputation {
        {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            let entry = entries.entry(reported.to_string()).or_default();
            let duplicate = entry
                .reports
                .iter()
                .any(|r| r.reporter == reporter && r.reason == reason && r.is_active(now_ms));
            if duplicate {
                log::debug!("Duplicate {reason:?} report from {reporter} against {reported}");
            } else {
                entry.reports.push(PeerReport {
                    reporter: reporter.to_string(),
                    reported: reported.to_string(),
                    reason,
                    created_at: now_ms,
                    expires_at: now_ms + self.retention.as_millis() as i64,
                });
            }
        }
        self.reputation_at(reported, now_ms)
    }

    pub fn block(&self, user_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.entry(user_id.to_string()).or_default().flagged = true;
    }

    pub fn unblock(&self, user_id: &str) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(entry) = entries.get_mut(user_id) {
            entry.flagged = false;
        }
    }

    /// Drop expired reports. Returns how many were removed.
    pub fn purge_expired(&self, now_ms: i64) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = 0;
        for entry in entries.values_mut() {
            let before = entry.reports.len();
            entry.reports.retain(|r| r.is_active(now_ms));
            removed += before - entry.reports.len();
        }
        entries.retain(|_, e| e.flagged || !e.reports.is_empty());
        removed
    }

    pub fn reputation_at(&self, user_id: &str, now_ms: i64) -> PeerReputation {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let Some(entry) = entries.get(user_id) else {
            return PeerReputation::default();
        };
        let active: Vec<&PeerReport> = entry.reports.iter().filter(|r| r.is_active(now_ms)).collect();
        let penalty: i32 = active.iter().map(|r| r.reason.weight()).sum();
        PeerReputation {
            score: (MAX_SCORE - penalty).max(0),
            report_count: active.len() as u32,
            is_blocked: entry.flagged,
        }
    }
}

impl ReputationSource for ReportLedger {
    fn reputation(&self, user_id: &str, now_ms: i64) -> PeerReputation {
        self.reputation_at(user_id, now_ms)
    }

    fn active_reports(&self, user_id: &str, now_ms: i64) -> Vec<PeerReport> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(user_id)
            .map(|e| e.reports.iter().filter(|r| r.is_active(now_ms)).cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Duration = Duration::from_secs(86_400);

    #[test]
    fn test_fresh_peer_has_full_score() {
        let ledger = ReportLedger::new(DAY);
        assert_eq!(ledger.reputation("nobody", now_millis()), PeerReputation::default());
        assert!(ReputationPolicy::default().evaluate(&ledger, "nobody", now_millis()).is_none());
    }

    #[test]
    fn test_reports_decrement_by_category() {
        let ledger = ReportLedger::new(DAY);
        let now = 1_000;
        ledger.report_at("a", "x", ReportReason::Spam, now);
        let rep = ledger.report_at("b", "x", ReportReason::Harassment, now);
        assert_eq!(rep.score, 70);
        assert_eq!(rep.report_count, 2);
    }

    #[test]
    fn test_duplicate_report_ignored() {
        let ledger = ReportLedger::new(DAY);
        ledger.report_at("a", "x", ReportReason::Spam, 0);
        let rep = ledger.report_at("a", "x", ReportReason::Spam, 10);
        assert_eq!(rep.report_count, 1);
    }

    #[test]
    fn test_reports_expire() {
        let ledger = ReportLedger::new(Duration::from_millis(100));
        ledger.report_at("a", "x", ReportReason::Impersonation, 0);
        assert_eq!(ledger.reputation_at("x", 50).score, 75);
        assert_eq!(ledger.reputation_at("x", 100).score, MAX_SCORE);
        assert!(ledger.active_reports("x", 100).is_empty());
        assert_eq!(ledger.purge_expired(100), 1);
    }

    #[test]
    fn test_same_reason_limit_blocks() {
        let ledger = ReportLedger::new(DAY);
        let policy = ReputationPolicy {
            block_threshold: 0,
            same_reason_limit: 5,
        };
        let now = 1_000;
        for i in 0..4 {
            ledger.report_at(&format!("r{i}"), "x", ReportReason::Other, now);
        }
        assert!(policy.evaluate(&ledger, "x", now).is_none());
        ledger.report_at("r4", "x", ReportReason::Other, now);
        assert_eq!(
            policy.evaluate(&ledger, "x", now),
            Some(BlockCause::RepeatedReports(ReportReason::Other, 5))
        );
    }

    #[test]
    fn test_low_score_blocks() {
        let ledger = ReportLedger::new(DAY);
        let policy = ReputationPolicy::default();
        let now = now_millis();
        for (i, reason) in [
            ReportReason::Impersonation,
            ReportReason::Impersonation,
            ReportReason::Harassment,
            ReportReason::Spam,
        ]
        .into_iter()
        .enumerate()
        {
            ledger.report_at(&format!("r{i}"), "x", reason, now);
        }
        // 100 - 25 - 25 - 20 - 10 = 20
        assert_eq!(policy.evaluate(&ledger, "x", now), Some(BlockCause::LowScore(20)));
    }

    #[test]
    fn test_flag_and_unflag() {
        let ledger = ReportLedger::new(DAY);
        let policy = ReputationPolicy::default();
        ledger.block("x");
        assert_eq!(policy.evaluate(&ledger, "x", now_millis()), Some(BlockCause::Flagged));
        ledger.unblock("x");
        assert!(policy.evaluate(&ledger, "x", now_millis()).is_none());
    }
}
