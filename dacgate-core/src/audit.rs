//! Audit trail for dacgate sessions
//!
//! Session lifecycle events are serialized to JSON and emitted on the
//! `dacgate::audit` tracing target, so operators can route them with the
//! ordinary subscriber configuration.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Tracing target audit records are emitted on
pub const AUDIT_TARGET: &str = "dacgate::audit";

/// Audit event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Severity {
    /// Debug information
    Debug = 0,
    /// Informational message
    Info = 1,
    /// Warning message
    Warning = 2,
    /// Error condition
    Error = 3,
}

/// Audit action types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    /// Connection admitted, session created
    SessionStart,
    /// Handshake outcome
    Authentication,
    /// Session torn down
    SessionEnd,
    /// Connection refused by the admission gate
    AdmissionRejected,
}

/// Audit result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditResult {
    /// Operation successful
    Success,
    /// Operation failed
    Failure,
    /// Operation denied
    Denied,
}

/// Audit event structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Event timestamp
    pub timestamp: DateTime<Utc>,
    /// Event ID
    pub event_id: Uuid,
    /// Session ID
    pub session_id: Option<Uuid>,
    /// Remote address
    pub peer_address: Option<String>,
    /// Authenticated peer identification
    pub peer_identification: Option<String>,
    /// Action performed
    pub action: AuditAction,
    /// Result of operation
    pub result: AuditResult,
    /// Coarse error code, never names the failing check
    pub error_code: Option<String>,
    /// Duration in milliseconds
    pub duration_ms: Option<u64>,
    /// Additional metadata
    pub metadata: HashMap<String, String>,
}

impl AuditEvent {
    /// Create new audit event
    pub fn new(action: AuditAction, result: AuditResult) -> Self {
        Self {
            timestamp: Utc::now(),
            event_id: Uuid::new_v4(),
            session_id: None,
            peer_address: None,
            peer_identification: None,
            action,
            result,
            error_code: None,
            duration_ms: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_session_id(mut self, session_id: Uuid) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_peer_address(mut self, peer_address: impl Into<String>) -> Self {
        self.peer_address = Some(peer_address.into());
        self
    }

    pub fn with_peer_identification(mut self, identification: impl Into<String>) -> Self {
        self.peer_identification = Some(identification.into());
        self
    }

    /// Record the coarse class of `error`
    pub fn with_error(mut self, error: &Error) -> Self {
        self.error_code = Some(error_code(error).to_string());
        self
    }

    pub fn with_duration(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Error code recorded in the audit trail. Every cryptographic or handshake
/// rejection shares one code.
pub fn error_code(error: &Error) -> &'static str {
    match error {
        Error::AuthenticationFailed | Error::InvalidPeerKey | Error::Protocol(_) => "rejected",
        Error::Timeout(_) => "timeout",
        Error::ConnectionClosed => "connection_closed",
        Error::Transport(_) => "transport",
        Error::AdmissionRejected => "admission",
        Error::FrameTooLarge { .. } => "frame_too_large",
        Error::InvalidPhase(_) => "invalid_phase",
        Error::KeyGen(_) | Error::Identity(_) | Error::Config(_) => "internal",
    }
}

/// Audit logger implementation
#[derive(Debug, Clone)]
pub struct AuditLogger {
    min_severity: Severity,
    source: String,
}

impl Default for AuditLogger {
    fn default() -> Self {
        Self::new(Severity::Info, "dacgate-server")
    }
}

impl AuditLogger {
    pub fn new(min_severity: Severity, source: impl Into<String>) -> Self {
        Self {
            min_severity,
            source: source.into(),
        }
    }

    /// Emit an audit event if it meets the minimum severity
    pub fn log_event(&self, event: &AuditEvent) -> Result<()> {
        let severity = self.get_severity(event);
        if severity < self.min_severity {
            return Ok(());
        }

        let entry = serde_json::to_string(&self.create_log_entry(event, severity))?;
        match severity {
            Severity::Debug => tracing::debug!(target: AUDIT_TARGET, "{}", entry),
            Severity::Info => tracing::info!(target: AUDIT_TARGET, "{}", entry),
            Severity::Warning => tracing::warn!(target: AUDIT_TARGET, "{}", entry),
            Severity::Error => tracing::error!(target: AUDIT_TARGET, "{}", entry),
        }
        Ok(())
    }

    /// Create structured log entry
    pub fn create_log_entry(&self, event: &AuditEvent, severity: Severity) -> serde_json::Value {
        serde_json::json!({
            "timestamp": event.timestamp.to_rfc3339(),
            "event_id": event.event_id.to_string(),
            "source": self.source,
            "event_type": format!("{:?}", event.action),
            "severity": format!("{:?}", severity),
            "session_id": event.session_id.map(|id| id.to_string()),
            "peer_address": event.peer_address,
            "peer_identification": event.peer_identification,
            "result": format!("{:?}", event.result),
            "error_code": event.error_code,
            "duration_ms": event.duration_ms,
            "metadata": event.metadata,
            "device_version": env!("CARGO_PKG_VERSION"),
        })
    }

    /// Get severity level for event
    pub fn get_severity(&self, event: &AuditEvent) -> Severity {
        match event.result {
            AuditResult::Success => match event.action {
                AuditAction::Authentication
                | AuditAction::SessionStart
                | AuditAction::SessionEnd => Severity::Info,
                AuditAction::AdmissionRejected => Severity::Warning,
            },
            AuditResult::Failure => match event.action {
                AuditAction::Authentication => Severity::Error,
                _ => Severity::Warning,
            },
            AuditResult::Denied => Severity::Warning,
        }
    }
}
