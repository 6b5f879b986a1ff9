//! Error taxonomy shared by every layer of the routine engine.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::status::MissionStatus;

/// Which outgoing edge of a node was required but absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransitionKind {
    Next,
    Failure,
}

impl fmt::Display for TransitionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransitionKind::Next => write!(f, "next"),
            TransitionKind::Failure => write!(f, "failure"),
        }
    }
}

/// Global error type spanning graph configuration problems, device I/O
/// failures, remote rejections, cancellation and telemetry availability.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BotError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Node with ID {0} not found")]
    NodeNotFound(String),

    #[error("No {kind} transition defined for node {node_id}")]
    MissingTransition { node_id: String, kind: TransitionKind },

    #[error("Unsupported node type: {0}")]
    UnsupportedNodeType(String),

    #[error("Connection failure on {endpoint}: {details}")]
    ConnectionFailure { endpoint: String, details: String },

    #[error("Remote service error: {0}")]
    RemoteServiceError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Heartbeat timeout: {0}")]
    Timeout(String),

    #[error("Canceled: {0}")]
    Canceled(String),

    #[error("Robot status not available yet")]
    StatusNotAvailable,

    #[error("Robot status is stale ({age_ms} ms old)")]
    StatusStale {
        last_known: Box<MissionStatus>,
        age_ms: u64,
    },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BotError {
    pub fn connection(endpoint: impl Into<String>, details: impl fmt::Display) -> Self {
        BotError::ConnectionFailure {
            endpoint: endpoint.into(),
            details: details.to_string(),
        }
    }

    pub fn missing_transition(node_id: impl Into<String>, kind: TransitionKind) -> Self {
        BotError::MissingTransition {
            node_id: node_id.into(),
            kind,
        }
    }

    /// `true` for [`BotError::Canceled`].
    pub fn is_canceled(&self) -> bool {
        matches!(self, BotError::Canceled(_))
    }

    /// Transient failures worth another attempt under a retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BotError::ConnectionFailure { .. }
                | BotError::RemoteServiceError(_)
                | BotError::InvalidResponse(_)
                | BotError::Timeout(_)
        )
    }

    /// Errors that abort a run immediately, ignoring failure transitions.
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            BotError::InvalidInput(_)
                | BotError::NodeNotFound(_)
                | BotError::MissingTransition { .. }
                | BotError::UnsupportedNodeType(_)
        )
    }
}
