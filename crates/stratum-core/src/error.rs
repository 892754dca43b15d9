// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for stratum-core.
//!
//! Business rule violations are not errors: they are [`Rejection`] values
//! written to the log and returned to the command's originator. [`CoreError`]
//! covers conditions the state machine cannot resolve on its own.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors raised while processing a record.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum CoreError {
    /// An invariant that must always hold was broken for this instance.
    ///
    /// The instance is moved to the failed token table; the partition keeps
    /// processing.
    Fatal {
        /// Key of the affected element instance.
        key: i64,
        /// What could not be resolved.
        reason: String,
    },

    /// A variable needed to continue could not be read from the payload.
    UnresolvedVariable {
        /// Key of the affected element instance.
        key: i64,
        /// Name of the missing variable.
        variable: String,
    },

    /// A log entry could not be decoded.
    InvalidRecord {
        /// Position of the entry.
        position: u64,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Fatal { .. } => "FATAL",
            Self::UnresolvedVariable { .. } => "IO_MAPPING_ERROR",
            Self::InvalidRecord { .. } => "INVALID_RECORD",
        }
    }

    /// Element instance the error belongs to, if any.
    pub fn instance_key(&self) -> Option<i64> {
        match self {
            Self::Fatal { key, .. } | Self::UnresolvedVariable { key, .. } => Some(*key),
            Self::InvalidRecord { .. } => None,
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal { key, reason } => {
                write!(f, "Fatal error on element instance {}: {}", key, reason)
            }
            Self::UnresolvedVariable { key, variable } => {
                write!(
                    f,
                    "Failed to extract the correlation key from variable '{}' of element instance {}",
                    variable, key
                )
            }
            Self::InvalidRecord { position, details } => {
                write!(f, "Log entry at position {} is invalid: {}", position, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

/// Category of a rejected command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionType {
    /// The command targets something that does not exist or cannot take it.
    NotApplicable,
    /// The command carries an invalid value.
    BadValue,
    /// The command conflicts with the current state.
    InvalidState,
}

impl RejectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotApplicable => "NOT_APPLICABLE",
            Self::BadValue => "BAD_VALUE",
            Self::InvalidState => "INVALID_STATE",
        }
    }
}

impl fmt::Display for RejectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected command, as written to the log and returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub rejection_type: RejectionType,
    pub reason: String,
}

impl Rejection {
    pub fn new(rejection_type: RejectionType, reason: impl Into<String>) -> Self {
        Self {
            rejection_type,
            reason: reason.into(),
        }
    }

    pub fn not_applicable(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::NotApplicable, reason)
    }

    pub fn bad_value(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::BadValue, reason)
    }

    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::new(RejectionType::InvalidState, reason)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.rejection_type, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        let fatal = CoreError::Fatal {
            key: 7,
            reason: "process is not deployed".to_string(),
        };
        assert_eq!(fatal.error_code(), "FATAL");
        assert_eq!(fatal.instance_key(), Some(7));

        let invalid = CoreError::InvalidRecord {
            position: 3,
            details: "eof".to_string(),
        };
        assert_eq!(invalid.error_code(), "INVALID_RECORD");
        assert_eq!(invalid.instance_key(), None);
    }

    #[test]
    fn test_error_display() {
        let err = CoreError::UnresolvedVariable {
            key: 12,
            variable: "orderId".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("orderId"));
        assert!(msg.contains("12"));
    }

    #[test]
    fn test_rejection_serializes_type_as_code() {
        let rejection = Rejection::not_applicable("workflow instance is not running");
        let json = serde_json::to_value(&rejection).unwrap();
        assert_eq!(json["rejection_type"], "NOT_APPLICABLE");
        assert_eq!(
            rejection.to_string(),
            "NOT_APPLICABLE: workflow instance is not running"
        );
    }
}
