//! Inter-game frames and the messaging collaborator.
//!
//! Goals:
//! - One serde enum for everything games say to each other.
//! - Validate call arguments where they are serialized, not where they are issued.
//! - Ordered delivery per (source, destination) pair.
//!
//! The production transport is out of scope. [`LocalNetwork`] connects games
//! living in one process and is what the harness and tests use.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::{
    error::{WorldError, WorldResult},
    id::{EntityId, GameId},
    math::Vec3,
    storage::EntitySnapshot,
    value::{validate_args, Attrs, Value},
};

/// Outcome of a load request, reported to the requesting game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoadOutcome {
    /// Registered on the given game.
    Loaded(GameId),
    /// Already live or already being loaded somewhere; nothing was done.
    AlreadyPresent,
    Failed(WorldError),
}

/// Message between games.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    // ─── Dispatch ───
    /// One-way method call routed toward the owner of `id`.
    Call {
        id: EntityId,
        method: String,
        args: Vec<Value>,
        hops: u8,
    },

    // ─── Creation & loading ───
    /// Create an entity with a reserved ID on the receiving game.
    Create {
        id: EntityId,
        type_name: String,
        attrs: Attrs,
    },
    /// To the location authority: load `id` on `target` unless already present.
    LoadRequest {
        type_name: String,
        id: EntityId,
        target: GameId,
        requester: GameId,
        token: u64,
    },
    /// To the target game: load `id` from storage.
    Load {
        type_name: String,
        id: EntityId,
        requester: GameId,
        token: u64,
    },
    /// To the requester of a load; `token` names the request it answers.
    LoadOutcome {
        id: EntityId,
        token: u64,
        outcome: LoadOutcome,
    },

    // ─── Location authority ───
    /// `id` will appear on `game`; calls are queued until it does.
    Reserve { id: EntityId, game: GameId },
    /// `id` now lives on `game`.
    Located { id: EntityId, game: GameId },
    /// `id` was removed from `game` (destroyed or failed to appear).
    Gone { id: EntityId, game: GameId },

    // ─── Migration ───
    /// Entity state routed toward the owner of `space`.
    MigrateIn {
        migration: u64,
        source: GameId,
        space: EntityId,
        position: Vec3,
        snapshot: EntitySnapshot,
        hops: u8,
    },
    MigrateAck {
        id: EntityId,
        migration: u64,
        dest: GameId,
    },
    MigrateReject {
        id: EntityId,
        migration: u64,
        reason: WorldError,
    },
    MigrateCommit { id: EntityId, migration: u64 },
    MigrateAbort { id: EntityId, migration: u64 },

    // ─── Services ───
    /// To the name's authority: resolve or lazily create the service.
    ServiceQuery { name: String, requester: GameId },
    /// Broadcast or reply: `name` is backed by `id`.
    ServiceRegistered { name: String, id: EntityId },
    /// `id` no longer backs `name`.
    ServiceReleased { name: String, id: EntityId },

    // ─── Membership ───
    /// Periodic entity count used by the placement policy.
    LoadReport { game: GameId, entities: u32 },
}

impl Frame {
    /// Checks the values a frame carries before it is serialized.
    pub fn validate(&self) -> WorldResult<()> {
        match self {
            Frame::Call { args, .. } => validate_args(args),
            Frame::Create { attrs, .. } => attrs.values().try_for_each(Value::validate),
            Frame::MigrateIn {
                position, snapshot, ..
            } => {
                if !position.is_finite() {
                    return Err(WorldError::InvalidArgument(format!(
                        "non-finite position {position:?}"
                    )));
                }
                snapshot.validate()
            }
            _ => Ok(()),
        }
    }
}

/// A frame with its routing header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: GameId,
    pub to: GameId,
    pub frame: Frame,
}

/// Validates and serializes an envelope.
pub fn encode_envelope(env: &Envelope) -> WorldResult<Bytes> {
    env.frame.validate()?;
    serde_json::to_vec(env)
        .map(Bytes::from)
        .map_err(|e| WorldError::InvalidArgument(format!("serialize frame: {e}")))
}

pub fn decode_envelope(b: &[u8]) -> anyhow::Result<Envelope> {
    serde_json::from_slice(b).context("deserialize envelope")
}

/// Messaging collaborator: ordered, reliable per (from, to) pair.
pub trait Messenger: Send + Sync {
    /// Hands a frame to the transport. Failure means the frame is dropped.
    fn send(&self, env: &Envelope) -> WorldResult<()>;

    /// Games currently reachable, sorted.
    fn live_games(&self) -> Vec<GameId>;
}

/// In-process network: one unbounded ordered channel per game.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inboxes: Arc<RwLock<HashMap<GameId, mpsc::UnboundedSender<Bytes>>>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `game` and returns its inbox.
    pub fn join(&self, game: GameId) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Ok(mut inboxes) = self.inboxes.write() {
            inboxes.insert(game, tx);
        }
        rx
    }

    /// Removes `game`; frames sent to it afterwards fail.
    pub fn leave(&self, game: GameId) {
        if let Ok(mut inboxes) = self.inboxes.write() {
            inboxes.remove(&game);
        }
    }
}

impl Messenger for LocalNetwork {
    fn send(&self, env: &Envelope) -> WorldResult<()> {
        let payload = encode_envelope(env)?;
        let fail = |reason: &str| WorldError::TransientDeliveryFailure {
            to: env.to,
            reason: reason.to_string(),
        };
        let inboxes = self.inboxes.read().map_err(|_| fail("network lock poisoned"))?;
        let tx = inboxes.get(&env.to).ok_or_else(|| fail("game not connected"))?;
        tx.send(payload).map_err(|_| fail("inbox closed"))
    }

    fn live_games(&self) -> Vec<GameId> {
        let mut games: Vec<GameId> = self
            .inboxes
            .read()
            .map(|inboxes| inboxes.keys().copied().collect())
            .unwrap_or_default();
        games.sort();
        games
    }
}
