use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use crate::error::CoordinatorError;

/// Type of session event being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventType {
    Keygen,
    Keysign,
    Timeout,
    Verification,
    Error,
}

impl AuditEventType {
    /// Classifies a failed operation, looking through exhausted retries.
    pub fn for_error(e: &CoordinatorError) -> Self {
        match e {
            CoordinatorError::Timeout(_) => AuditEventType::Timeout,
            CoordinatorError::RetriesExhausted { last, .. } => AuditEventType::for_error(last),
            _ => AuditEventType::Error,
        }
    }
}

/// Record of a session-related event
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub event_type: AuditEventType,
    pub session_id: String,
    pub party_id: Option<String>,
    pub message: String,
    pub timestamp: String, // RFC3339
}

impl AuditRecord {
    pub fn new(event_type: AuditEventType, session_id: &str, party_id: &str, message: String) -> Self {
        AuditRecord {
            event_type,
            session_id: session_id.to_string(),
            party_id: Some(party_id.to_string()),
            message,
            timestamp: now_rfc3339(),
        }
    }

    pub fn event_type_label(&self) -> &'static str {
        match self.event_type {
            AuditEventType::Keygen => "KEYGEN",
            AuditEventType::Keysign => "KEYSIGN",
            AuditEventType::Timeout => "TIMEOUT",
            AuditEventType::Verification => "VERIFY",
            AuditEventType::Error => "ERROR",
        }
    }
}

/// Bounded in-memory audit trail
pub struct AuditTracker {
    records: Mutex<VecDeque<AuditRecord>>,
    max_entries: usize,
}

impl Default for AuditTracker {
    fn default() -> Self {
        AuditTracker::new(500)
    }
}

impl AuditTracker {
    pub fn new(max_entries: usize) -> Self {
        Self {
            records: Mutex::new(VecDeque::with_capacity(max_entries)),
            max_entries: max_entries.max(1),
        }
    }

    /// Record a new event, evicting the oldest when full
    pub fn log(&self, record: AuditRecord) {
        tracing::info!(
            event = record.event_type_label(),
            session_id = %record.session_id,
            party = ?record.party_id,
            "{}",
            record.message
        );

        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        if records.len() == self.max_entries {
            records.pop_front();
        }
        records.push_back(record);
    }

    /// Most recent first
    pub fn recent(&self, count: usize) -> Vec<AuditRecord> {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.iter().rev().take(count).cloned().collect()
    }

    pub fn count(&self, event_type: AuditEventType) -> usize {
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        records.iter().filter(|r| r.event_type == event_type).count()
    }
}

/// Helper to get current timestamp as RFC3339 string
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}
