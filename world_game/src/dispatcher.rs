//! Call routing and location authority.
//!
//! Every game is the location authority for a hash-partitioned share of the
//! entity IDs: `games[fnv1a(id) % games.len()]`. The authority knows which
//! game owns each of its IDs, or which game an ID is about to appear on, and
//! queues frames for IDs that are still pending. Nil space IDs carry their game
//! and bypass the authority.
//!
//! Remote calls are one-way. A call that finds nothing to deliver to is logged
//! and dropped; callers never see an error.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};
use world_shared::id::stable_hash;
use world_shared::net::{Envelope, Frame, Messenger};
use world_shared::prelude::*;

use crate::entity::Residency;
use crate::game::Game;

/// A call held back until its target can run it.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCall {
    pub method: String,
    pub args: Vec<Value>,
    pub hops: u8,
}

/// What the authority knows about one ID.
#[derive(Debug, Clone, PartialEq)]
pub enum Placement {
    Live(GameId),
    /// Creation or load in progress on `game`; frames wait in `queued`.
    Pending { game: GameId, queued: Vec<Frame> },
}

impl Placement {
    pub fn game(&self) -> GameId {
        match self {
            Placement::Live(g) => *g,
            Placement::Pending { game, .. } => *game,
        }
    }
}

/// Placements for the IDs this game is the authority of.
#[derive(Debug, Default)]
pub struct LocationAuthority {
    placements: HashMap<EntityId, Placement>,
}

impl LocationAuthority {
    pub fn placement(&self, id: EntityId) -> Option<&Placement> {
        self.placements.get(&id)
    }

    pub fn is_known(&self, id: EntityId) -> bool {
        self.placements.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.placements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.placements.is_empty()
    }

    /// Marks `id` pending on `game`. An ID already known keeps its placement.
    pub fn reserve(&mut self, id: EntityId, game: GameId) -> bool {
        if self.placements.contains_key(&id) {
            return false;
        }
        self.placements.insert(
            id,
            Placement::Pending {
                game,
                queued: Vec::new(),
            },
        );
        true
    }

    /// Records `id` live on `game` and returns the frames that waited for it.
    pub fn located(&mut self, id: EntityId, game: GameId) -> Vec<Frame> {
        match self.placements.insert(id, Placement::Live(game)) {
            Some(Placement::Pending { queued, .. }) => queued,
            _ => Vec::new(),
        }
    }

    /// Forgets `id` if it was placed on `game`. Returns the frames that were
    /// still waiting, or `None` when the placement belongs to another game.
    pub fn gone(&mut self, id: EntityId, game: GameId) -> Option<Vec<Frame>> {
        if self.placements.get(&id).map(Placement::game) != Some(game) {
            return None;
        }
        match self.placements.remove(&id) {
            Some(Placement::Pending { queued, .. }) => Some(queued),
            _ => Some(Vec::new()),
        }
    }

    /// Queues a frame behind a pending placement. Returns the frame back when
    /// `id` is not pending.
    pub fn queue(&mut self, id: EntityId, frame: Frame) -> Result<(), Frame> {
        match self.placements.get_mut(&id) {
            Some(Placement::Pending { queued, .. }) => {
                queued.push(frame);
                Ok(())
            }
            _ => Err(frame),
        }
    }
}

/// Outbound side of a game: who owns what, and how to reach them.
pub struct Dispatcher {
    game: GameId,
    games: Vec<GameId>,
    messenger: Arc<dyn Messenger>,
    max_hops: u8,
    pub(crate) authority: LocationAuthority,
}

impl Dispatcher {
    pub fn new(game: GameId, games: Vec<GameId>, messenger: Arc<dyn Messenger>, max_hops: u8) -> Self {
        Self {
            game,
            games,
            messenger,
            max_hops,
            authority: LocationAuthority::default(),
        }
    }

    fn pick(&self, hash: u64) -> GameId {
        if self.games.is_empty() {
            return self.game;
        }
        self.games[(hash % self.games.len() as u64) as usize]
    }

    /// Location authority of `id`; a nil space is its own game's business.
    pub fn authority_of(&self, id: EntityId) -> GameId {
        match id.nil_space_game() {
            Some(game) => game,
            None => self.pick(stable_hash(&id.to_hex())),
        }
    }

    /// Authority serializing creation of the service `name`.
    pub fn authority_of_name(&self, name: &str) -> GameId {
        self.pick(stable_hash(name))
    }

    pub fn max_hops(&self) -> u8 {
        self.max_hops
    }

    /// Live games, this one included.
    pub fn live_games(&self) -> Vec<GameId> {
        let mut games = self.messenger.live_games();
        if !games.contains(&self.game) {
            games.push(self.game);
            games.sort();
        }
        games
    }

    /// Hands a frame to the transport. Delivery failures are logged and the
    /// frame is dropped.
    pub fn send(&self, to: GameId, frame: Frame) -> bool {
        let env = Envelope {
            from: self.game,
            to,
            frame,
        };
        match self.messenger.send(&env) {
            Ok(()) => true,
            Err(e) => {
                warn!(game = %self.game, %to, error = %e, "Frame dropped");
                false
            }
        }
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("game", &self.game)
            .field("games", &self.games)
            .field("placements", &self.authority.len())
            .finish()
    }
}

impl Game {
    /// Delivers a frame; frames addressed to this game are handled in place.
    pub(crate) fn send(&mut self, to: GameId, frame: Frame) {
        if to == self.id() {
            self.handle_frame(to, frame);
        } else {
            self.dispatcher.send(to, frame);
        }
    }

    /// Sends `frame` to every live game, this one last.
    pub(crate) fn broadcast(&mut self, frame: Frame) {
        let me = self.id();
        for game in self.dispatcher.live_games() {
            if game != me {
                self.dispatcher.send(game, frame.clone());
            }
        }
        self.handle_frame(me, frame);
    }

    /// Calls `method` on `id` wherever it lives. Local entities run now; remote
    /// ones get a one-way frame. Unknown targets are logged and dropped.
    pub fn call(&mut self, id: EntityId, method: &str, args: Vec<Value>) {
        self.route_call(
            id,
            PendingCall {
                method: method.to_string(),
                args,
                hops: 0,
            },
        );
    }

    /// Calls `method` on the nil space of every live game, this one included.
    pub fn call_nil_spaces(&mut self, method: &str, args: Vec<Value>) {
        for game in self.dispatcher.live_games() {
            self.call(EntityId::nil_space(game), method, args.clone());
        }
    }

    fn forward_call(&mut self, to: GameId, id: EntityId, call: PendingCall) {
        if call.hops >= self.dispatcher.max_hops() {
            warn!(game = %self.id(), entity = %id, method = %call.method, hops = call.hops, "Call exceeded hop limit, dropped");
            return;
        }
        self.dispatcher.send(
            to,
            Frame::Call {
                id,
                method: call.method,
                args: call.args,
                hops: call.hops + 1,
            },
        );
    }

    pub(crate) fn route_call(&mut self, id: EntityId, call: PendingCall) {
        let me = self.id();
        if let Some(entity) = self.entities.get(id) {
            if entity.residency() == Residency::Active {
                self.execute_call(id, &call.method, &call.args);
            } else {
                debug!(game = %me, entity = %id, method = %call.method, "Call buffered during migration");
                self.migrations.buffer_call(id, call);
            }
            return;
        }
        if let Some(dest) = self.migrations.redirect(id) {
            self.forward_call(dest, id, call);
            return;
        }
        if let Some(game) = id.nil_space_game() {
            if game == me {
                warn!(game = %me, entity = %id, "Call to missing nil space dropped");
            } else {
                self.forward_call(game, id, call);
            }
            return;
        }
        let authority = self.dispatcher.authority_of(id);
        if authority != me {
            self.forward_call(authority, id, call);
            return;
        }
        match self.dispatcher.authority.placement(id).map(Placement::game) {
            Some(owner) if owner != me => {
                let frame = Frame::Call {
                    id,
                    method: call.method.clone(),
                    args: call.args.clone(),
                    hops: call.hops,
                };
                if self.dispatcher.authority.queue(id, frame).is_err() {
                    self.forward_call(owner, id, call);
                }
            }
            Some(_) => {
                let frame = Frame::Call {
                    id,
                    method: call.method.clone(),
                    args: call.args.clone(),
                    hops: call.hops,
                };
                if self.dispatcher.authority.queue(id, frame).is_err() {
                    warn!(game = %me, entity = %id, method = %call.method, "Call to departed entity dropped");
                }
            }
            None => {
                warn!(game = %me, entity = %id, method = %call.method, "Call to unknown entity dropped");
            }
        }
    }

    /// Runs a call on a local active entity. Behavior errors end here.
    pub(crate) fn execute_call(&mut self, id: EntityId, method: &str, args: &[Value]) {
        match self.with_behavior(id, |b, ctx| b.on_call(ctx, method, args)) {
            Some(Ok(())) => {}
            Some(Err(e)) => {
                warn!(game = %self.id(), entity = %id, method, error = %format!("{e:#}"), "Call failed");
            }
            None => warn!(game = %self.id(), entity = %id, method, "Call target busy, dropped"),
        }
    }

    /// Re-routes frames released by the authority.
    pub(crate) fn replay(&mut self, frames: Vec<Frame>) {
        let me = self.id();
        for frame in frames {
            self.handle_frame(me, frame);
        }
    }

    pub(crate) fn handle_reserve(&mut self, id: EntityId, game: GameId) {
        if !self.dispatcher.authority.reserve(id, game) {
            debug!(game = %self.id(), entity = %id, "Reserve ignored, already placed");
        }
    }

    pub(crate) fn handle_located(&mut self, id: EntityId, game: GameId) {
        let queued = self.dispatcher.authority.located(id, game);
        if !queued.is_empty() {
            debug!(game = %self.id(), entity = %id, owner = %game, count = queued.len(), "Releasing queued frames");
        }
        self.replay(queued);
    }

    pub(crate) fn handle_gone(&mut self, id: EntityId, game: GameId) {
        match self.dispatcher.authority.gone(id, game) {
            Some(queued) if !queued.is_empty() => {
                warn!(game = %self.id(), entity = %id, dropped = queued.len(), "Entity gone, queued frames dropped");
                for frame in queued {
                    if let Frame::MigrateIn {
                        migration,
                        source,
                        snapshot,
                        ..
                    } = frame
                    {
                        self.send(
                            source,
                            Frame::MigrateReject {
                                id: snapshot.id,
                                migration,
                                reason: WorldError::not_found(format!("space {id}")),
                            },
                        );
                    }
                }
            }
            Some(_) => {}
            None => debug!(game = %self.id(), entity = %id, %game, "Stale gone ignored"),
        }
    }
}
