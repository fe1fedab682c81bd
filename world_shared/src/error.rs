//! Error taxonomy shared by every world component.
//!
//! Asynchronous operations never unwind across the loop: they hand one of these
//! to their completion callback instead.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::id::{EntityId, GameId};

/// Errors raised by the entity, space, dispatch and storage layers.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorldError {
    /// Entity, space, service or stored record absent at query time.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller broke an API contract (nil-space kind, duplicate type, ...).
    #[error("misuse: {0}")]
    Misuse(String),

    /// A migration acknowledgement or storage round-trip took too long.
    #[error("timed out: {0}")]
    Timeout(String),

    /// A frame could not be handed to the messaging layer. Commands are
    /// at-most-once, so this is logged and the frame dropped.
    #[error("delivery to {to} failed: {reason}")]
    TransientDeliveryFailure {
        /// Intended destination.
        to: GameId,
        /// Transport-specific reason.
        reason: String,
    },

    /// A declared name has no backing type; the cluster config is broken.
    #[error("fatal misconfiguration: {0}")]
    FatalMisconfiguration(String),

    /// A second migration was requested while one is still in flight.
    #[error("entity {0} already has a migration in flight")]
    MigrationInFlight(EntityId),

    /// A value failed validation at the serialization boundary.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Backend failure reported by a storage collaborator.
    #[error("storage error: {0}")]
    Storage(String),
}

impl WorldError {
    pub fn not_found(what: impl Into<String>) -> Self {
        WorldError::NotFound(what.into())
    }

    pub fn misuse(what: impl Into<String>) -> Self {
        WorldError::Misuse(what.into())
    }

    /// Whether the error is a configuration problem that should stop a game
    /// at startup rather than be retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            WorldError::FatalMisconfiguration(_) | WorldError::Misuse(_)
        )
    }
}

pub type WorldResult<T> = Result<T, WorldError>;
