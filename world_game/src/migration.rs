//! Space changes and cross-game migration.
//!
//! Entering a space hosted on this game is a plain AOI move. Entering a space
//! hosted elsewhere migrates the entity:
//!
//! ```text
//!   source                         destination
//!   Leaving, buffer calls
//!   MigrateIn(snapshot) ─────────► Arriving (inactive), enter AOI
//!                      ◄───────── MigrateAck
//!   drop entity, redirect
//!   MigrateCommit ───────────────► Active, Located → authority
//!   buffered calls ──────────────► run in order
//! ```
//!
//! Interest hooks for a copy in either role are held with its buffered calls
//! and run once that copy is active again. A copy that goes away drops them
//! along with the space membership they describe.
//!
//! No ack within `migrate_timeout` rolls the source back: the entity stays,
//! buffered calls run locally. A late ack is answered with `MigrateAbort` and
//! the destination drops its copy. The destination gives up on its own after
//! twice the timeout.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use world_shared::net::Frame;
use world_shared::prelude::*;
use world_shared::storage::EntitySnapshot;

use crate::aoi::AoiEvent;
use crate::dispatcher::{PendingCall, Placement};
use crate::entity::{Entity, Residency};
use crate::game::Game;
use crate::scheduler::TimerId;

/// Migration state of one entity as seen by this game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Idle,
    Leaving,
    Arriving,
    /// Moved away; calls are still redirected.
    Done,
    Failed,
}

/// Published on the event bus as migrations resolve.
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationEvent {
    /// Source: the destination acknowledged and the entity left.
    Committed { id: EntityId, dest: GameId },
    /// Destination: the entity became active here.
    Arrived { id: EntityId, source: GameId },
    /// Source: rolled back, the entity is active here again.
    Failed { id: EntityId, reason: WorldError },
    /// Destination: the arriving copy was dropped.
    Discarded { id: EntityId },
}

struct Outgoing {
    migration: u64,
    deadline: Instant,
    timer: TimerId,
    buffered: Vec<PendingCall>,
    interest: Vec<AoiEvent>,
    /// The space it left from was destroyed; it is parked in the nil space.
    rehomed: bool,
}

struct Incoming {
    migration: u64,
    source: GameId,
    timer: TimerId,
    buffered: Vec<PendingCall>,
    interest: Vec<AoiEvent>,
}

#[derive(Debug, Clone, Copy)]
struct Redirect {
    game: GameId,
    expires: Instant,
}

/// Per-game bookkeeping of migrations in flight and recent departures.
pub struct MigrationCoordinator {
    next: u64,
    ttl: Duration,
    outgoing: HashMap<EntityId, Outgoing>,
    incoming: HashMap<EntityId, Incoming>,
    redirects: HashMap<EntityId, Redirect>,
}

impl MigrationCoordinator {
    pub fn new(redirect_ttl: Duration) -> Self {
        Self {
            next: 0,
            ttl: redirect_ttl,
            outgoing: HashMap::new(),
            incoming: HashMap::new(),
            redirects: HashMap::new(),
        }
    }

    fn next_migration(&mut self) -> u64 {
        self.next += 1;
        self.next
    }

    pub fn state(&self, id: EntityId) -> MigrationState {
        if self.outgoing.contains_key(&id) {
            MigrationState::Leaving
        } else if self.incoming.contains_key(&id) {
            MigrationState::Arriving
        } else if self.redirects.contains_key(&id) {
            MigrationState::Done
        } else {
            MigrationState::Idle
        }
    }

    pub fn in_flight(&self) -> usize {
        self.outgoing.len() + self.incoming.len()
    }

    /// Holds a call for an entity in either migration role.
    pub(crate) fn buffer_call(&mut self, id: EntityId, call: PendingCall) {
        if let Some(out) = self.outgoing.get_mut(&id) {
            out.buffered.push(call);
        } else if let Some(inc) = self.incoming.get_mut(&id) {
            inc.buffered.push(call);
        } else {
            warn!(entity = %id, method = %call.method, "No migration to buffer call on, dropped");
        }
    }

    /// Holds an interest change whose observer is migrating. Returns false
    /// when the observer is not in flight.
    pub(crate) fn hold_interest(&mut self, ev: AoiEvent) -> bool {
        if let Some(out) = self.outgoing.get_mut(&ev.observer) {
            out.interest.push(ev);
        } else if let Some(inc) = self.incoming.get_mut(&ev.observer) {
            inc.interest.push(ev);
        } else {
            return false;
        }
        true
    }

    /// Game an entity recently migrated to, if the record is still fresh.
    pub fn redirect(&self, id: EntityId) -> Option<GameId> {
        self.redirects
            .get(&id)
            .filter(|r| r.expires > Instant::now())
            .map(|r| r.game)
    }

    /// Drops expired redirect records.
    pub fn prune_redirects(&mut self) -> usize {
        let now = Instant::now();
        let before = self.redirects.len();
        self.redirects.retain(|_, r| r.expires > now);
        before - self.redirects.len()
    }
}

impl std::fmt::Debug for MigrationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MigrationCoordinator")
            .field("outgoing", &self.outgoing.len())
            .field("incoming", &self.incoming.len())
            .field("redirects", &self.redirects.len())
            .finish()
    }
}

impl Game {
    pub fn migration_state(&self, id: EntityId) -> MigrationState {
        self.migrations.state(id)
    }

    fn active_entity(&self, id: EntityId) -> WorldResult<&Entity> {
        let entity = self
            .entities
            .get(id)
            .ok_or_else(|| WorldError::not_found(format!("entity {id}")))?;
        if entity.is_space() {
            return Err(WorldError::misuse(format!("space {id} cannot change space")));
        }
        if !entity.is_active() {
            return Err(WorldError::MigrationInFlight(id));
        }
        Ok(entity)
    }

    /// Puts `id` into `space` at `position`, migrating when the space is
    /// hosted by another game.
    pub fn enter_space(&mut self, id: EntityId, space: EntityId, position: Vec3) -> WorldResult<()> {
        if !position.is_finite() {
            return Err(WorldError::InvalidArgument(format!(
                "non-finite position {position:?}"
            )));
        }
        if space.is_nil_space() {
            return Err(WorldError::misuse(
                "nil spaces cannot be entered; use leave_space or migrate_to_game",
            ));
        }
        self.active_entity(id)?;
        if self.spaces.contains(space) {
            self.change_space_locally(id, space, position)
        } else {
            self.begin_migration(id, space, position)
        }
    }

    /// Moves `id` back to this game's nil space.
    pub fn leave_space(&mut self, id: EntityId) -> WorldResult<()> {
        self.active_entity(id)?;
        self.move_to_nil_space(id);
        Ok(())
    }

    /// Migrates `id` into the nil space of `game`.
    pub fn migrate_to_game(&mut self, id: EntityId, game: GameId) -> WorldResult<()> {
        let position = self.active_entity(id)?.position();
        if game == self.id() {
            self.move_to_nil_space(id);
            return Ok(());
        }
        self.begin_migration(id, EntityId::nil_space(game), position)
    }

    pub(crate) fn move_to_nil_space(&mut self, id: EntityId) {
        let nil = self.spaces.nil_space_id();
        let Some(entity) = self.entities.get(id) else {
            return;
        };
        if entity.space() == Some(nil) {
            return;
        }
        let position = entity.position();
        if !entity.is_active() {
            return self.park_in_flight(id, position);
        }
        if let Err(e) = self.change_space_locally(id, nil, position) {
            warn!(game = %self.id(), entity = %id, error = %e, "Move to nil space failed");
        }
    }

    /// Moves a migrating copy into the nil space without running its hooks.
    /// `on_enter_space` runs when the copy becomes active: at commit on the
    /// destination, at roll back on the source.
    fn park_in_flight(&mut self, id: EntityId, position: Vec3) {
        let nil = self.spaces.nil_space_id();
        let prior = self.entities.get(id).and_then(Entity::space);
        let mut events = Vec::new();
        if let Err(e) = self.spaces.enter(prior, nil, id, position, &mut events) {
            warn!(game = %self.id(), entity = %id, error = %e, "Parking in nil space failed");
            return;
        }
        if let Some(entity) = self.entities.get_mut(id) {
            entity.space = Some(nil);
        }
        if let Some(out) = self.migrations.outgoing.get_mut(&id) {
            out.rehomed = true;
        }
        debug!(game = %self.id(), entity = %id, "Migrating entity parked in nil space");
        self.dispatch_aoi_events(events);
    }

    fn change_space_locally(&mut self, id: EntityId, space: EntityId, position: Vec3) -> WorldResult<()> {
        let prior = self.entities.get(id).and_then(Entity::space);
        let mut events = Vec::new();
        self.spaces.enter(prior, space, id, position, &mut events)?;
        if let Some(entity) = self.entities.get_mut(id) {
            entity.space = Some(space);
            entity.position = position;
        }
        self.dispatch_aoi_events(events);
        self.with_behavior(id, |b, ctx| b.on_enter_space(ctx, space));
        Ok(())
    }

    fn begin_migration(&mut self, id: EntityId, space: EntityId, position: Vec3) -> WorldResult<()> {
        self.active_entity(id)?;
        if self.migrations.outgoing.contains_key(&id) {
            return Err(WorldError::MigrationInFlight(id));
        }
        self.with_behavior(id, |b, ctx| b.on_migrate_out(ctx));

        let Some(entity) = self.entities.get_mut(id) else {
            return Err(WorldError::not_found(format!("entity {id}")));
        };
        entity.residency = Residency::Leaving;
        let snapshot = entity.snapshot();

        let migration = self.migrations.next_migration();
        let timeout = self.cfg.migrate_timeout();
        let timer = self.add_callback(timeout, move |game| {
            game.migration_timed_out(id, migration);
            Ok(())
        });
        self.migrations.outgoing.insert(
            id,
            Outgoing {
                migration,
                deadline: Instant::now() + timeout,
                timer,
                buffered: Vec::new(),
                interest: Vec::new(),
                rehomed: false,
            },
        );
        info!(game = %self.id(), entity = %id, %space, migration, "Migration started");

        let source = self.id();
        self.handle_migrate_in(migration, source, space, position, snapshot, 0);
        Ok(())
    }

    /// Routes a migration toward the game hosting `space`, accepting it when
    /// that is this game.
    pub(crate) fn handle_migrate_in(
        &mut self,
        migration: u64,
        source: GameId,
        space: EntityId,
        position: Vec3,
        snapshot: EntitySnapshot,
        hops: u8,
    ) {
        let me = self.id();
        if self.spaces.contains(space) && source != me {
            self.accept_migration(migration, source, space, position, snapshot);
            return;
        }
        let frame = Frame::MigrateIn {
            migration,
            source,
            space,
            position,
            snapshot,
            hops: hops.saturating_add(1),
        };
        if hops >= self.dispatcher.max_hops() {
            return self.reject_migration(frame, WorldError::not_found(format!("space {space} (hop limit)")));
        }
        let next = match space.nil_space_game() {
            Some(game) if game != me => Some(game),
            Some(_) => None,
            None => {
                let authority = self.dispatcher.authority_of(space);
                if authority != me {
                    Some(authority)
                } else {
                    match self.dispatcher.authority.placement(space) {
                        Some(Placement::Live(owner)) if *owner != me => Some(*owner),
                        Some(Placement::Pending { .. }) => {
                            if let Err(frame) = self.dispatcher.authority.queue(space, frame) {
                                self.reject_migration(frame, WorldError::not_found(format!("space {space}")));
                            }
                            return;
                        }
                        _ => None,
                    }
                }
            }
        };
        match next {
            Some(to) => {
                self.dispatcher.send(to, frame);
            }
            None => self.reject_migration(frame, WorldError::not_found(format!("space {space}"))),
        }
    }

    fn reject_migration(&mut self, frame: Frame, reason: WorldError) {
        if let Frame::MigrateIn {
            migration,
            source,
            snapshot,
            ..
        } = frame
        {
            warn!(game = %self.id(), entity = %snapshot.id, error = %reason, "Migration rejected");
            self.send(
                source,
                Frame::MigrateReject {
                    id: snapshot.id,
                    migration,
                    reason,
                },
            );
        }
    }

    fn accept_migration(
        &mut self,
        migration: u64,
        source: GameId,
        space: EntityId,
        position: Vec3,
        snapshot: EntitySnapshot,
    ) {
        let id = snapshot.id;
        let behavior = match self.types.instantiate(&snapshot.type_name) {
            Ok(b) => b,
            Err(e) => {
                let frame = Frame::MigrateIn {
                    migration,
                    source,
                    space,
                    position,
                    snapshot,
                    hops: 0,
                };
                return self.reject_migration(frame, e);
            }
        };
        if self.entities.contains(id) || self.migrations.incoming.contains_key(&id) {
            self.send(
                source,
                Frame::MigrateReject {
                    id,
                    migration,
                    reason: WorldError::misuse(format!("entity {id} already present on {}", self.id())),
                },
            );
            return;
        }

        let flags = self.types.flags(&snapshot.type_name);
        let mut entity = Entity::new(id, &snapshot.type_name, flags, snapshot.attrs, behavior);
        entity.residency = Residency::Arriving;
        entity.position = position;
        entity.space = Some(space);
        if let Err(e) = self.entities.insert(entity) {
            warn!(game = %self.id(), entity = %id, error = %e, "Arrival failed");
            return;
        }
        let mut events = Vec::new();
        if let Err(e) = self.spaces.enter(None, space, id, position, &mut events) {
            self.entities.remove(id);
            self.send(
                source,
                Frame::MigrateReject {
                    id,
                    migration,
                    reason: e,
                },
            );
            return;
        }

        let timeout = self.cfg.migrate_timeout() * 2;
        let timer = self.add_callback(timeout, move |game| {
            game.arrival_timed_out(id, migration);
            Ok(())
        });
        self.migrations.incoming.insert(
            id,
            Incoming {
                migration,
                source,
                timer,
                buffered: Vec::new(),
                interest: Vec::new(),
            },
        );
        debug!(game = %self.id(), entity = %id, %source, migration, "Migration arriving");
        let dest = self.id();
        self.send(source, Frame::MigrateAck { id, migration, dest });
        self.dispatch_aoi_events(events);
    }

    pub(crate) fn handle_migrate_ack(&mut self, id: EntityId, migration: u64, dest: GameId) {
        let current = self
            .migrations
            .outgoing
            .get(&id)
            .is_some_and(|o| o.migration == migration);
        if !current {
            debug!(game = %self.id(), entity = %id, migration, "Late migration ack, aborting");
            self.send(dest, Frame::MigrateAbort { id, migration });
            return;
        }
        // Past the deadline the ack counts as late even if the timer has not
        // fired yet.
        if self
            .migrations
            .outgoing
            .get(&id)
            .is_some_and(|o| o.deadline <= Instant::now())
        {
            self.roll_back(id, WorldError::Timeout(format!("migration {migration} of {id}")));
            self.send(dest, Frame::MigrateAbort { id, migration });
            return;
        }
        let Some(out) = self.migrations.outgoing.remove(&id) else {
            return;
        };
        self.scheduler.cancel(out.timer);

        let mut events = Vec::new();
        if let Some(space) = self.entities.get(id).and_then(Entity::space) {
            self.spaces.leave(space, id, &mut events);
        }
        self.entities.remove(id);
        self.dispatch_aoi_events(events);

        self.send(dest, Frame::MigrateCommit { id, migration });
        let buffered = out.buffered.len();
        for call in out.buffered {
            self.dispatcher.send(
                dest,
                Frame::Call {
                    id,
                    method: call.method,
                    args: call.args,
                    hops: call.hops.saturating_add(1),
                },
            );
        }
        let expires = Instant::now() + self.migrations.ttl;
        self.migrations.redirects.insert(id, Redirect { game: dest, expires });
        info!(game = %self.id(), entity = %id, %dest, buffered, "Migration committed");
        self.publish(MigrationEvent::Committed { id, dest });
    }

    pub(crate) fn handle_migrate_reject(&mut self, id: EntityId, migration: u64, reason: WorldError) {
        if self
            .migrations
            .outgoing
            .get(&id)
            .is_some_and(|o| o.migration == migration)
        {
            self.roll_back(id, reason);
        }
    }

    fn migration_timed_out(&mut self, id: EntityId, migration: u64) {
        if self
            .migrations
            .outgoing
            .get(&id)
            .is_some_and(|o| o.migration == migration)
        {
            self.roll_back(id, WorldError::Timeout(format!("migration {migration} of {id}")));
        }
    }

    fn roll_back(&mut self, id: EntityId, reason: WorldError) {
        let Some(out) = self.migrations.outgoing.remove(&id) else {
            return;
        };
        self.scheduler.cancel(out.timer);
        if let Some(entity) = self.entities.get_mut(id) {
            entity.residency = Residency::Active;
        }
        warn!(game = %self.id(), entity = %id, error = %reason, "Migration failed, rolled back");
        self.with_behavior(id, |b, ctx| b.on_migrate_failed(ctx, &reason));
        if out.rehomed {
            let nil = self.spaces.nil_space_id();
            self.with_behavior(id, |b, ctx| b.on_enter_space(ctx, nil));
        }
        for ev in out.interest {
            self.run_interest_hook(ev);
        }
        self.publish(MigrationEvent::Failed { id, reason });
        for call in out.buffered {
            self.route_call(id, call);
        }
    }

    pub(crate) fn handle_migrate_commit(&mut self, id: EntityId, migration: u64) {
        let current = self
            .migrations
            .incoming
            .get(&id)
            .is_some_and(|i| i.migration == migration);
        if !current {
            warn!(game = %self.id(), entity = %id, migration, "Commit for unknown arrival ignored");
            return;
        }
        let Some(inc) = self.migrations.incoming.remove(&id) else {
            return;
        };
        self.scheduler.cancel(inc.timer);
        let space = match self.entities.get_mut(id) {
            Some(entity) => {
                entity.residency = Residency::Active;
                entity.space
            }
            None => return,
        };
        let authority = self.dispatcher.authority_of(id);
        let me = self.id();
        self.send(authority, Frame::Located { id, game: me });
        info!(game = %me, entity = %id, source = %inc.source, "Migration arrived");
        self.with_behavior(id, |b, ctx| b.on_migrate_in(ctx));
        if let Some(space) = space {
            self.with_behavior(id, |b, ctx| b.on_enter_space(ctx, space));
        }
        for ev in inc.interest {
            self.run_interest_hook(ev);
        }
        self.publish(MigrationEvent::Arrived {
            id,
            source: inc.source,
        });
        for call in inc.buffered {
            self.route_call(id, call);
        }
    }

    pub(crate) fn handle_migrate_abort(&mut self, id: EntityId, migration: u64) {
        if self
            .migrations
            .incoming
            .get(&id)
            .is_some_and(|i| i.migration == migration)
        {
            self.discard_arrival(id);
        }
    }

    fn arrival_timed_out(&mut self, id: EntityId, migration: u64) {
        if self
            .migrations
            .incoming
            .get(&id)
            .is_some_and(|i| i.migration == migration)
        {
            warn!(game = %self.id(), entity = %id, migration, "Arrival never committed");
            self.discard_arrival(id);
        }
    }

    /// Drops an arriving copy. Calls that reached it go back to the source,
    /// which still owns the entity.
    fn discard_arrival(&mut self, id: EntityId) {
        let Some(inc) = self.migrations.incoming.remove(&id) else {
            return;
        };
        self.scheduler.cancel(inc.timer);
        let mut events = Vec::new();
        if let Some(space) = self.entities.get(id).and_then(Entity::space) {
            self.spaces.leave(space, id, &mut events);
        }
        self.entities.remove(id);
        self.dispatch_aoi_events(events);
        for call in inc.buffered {
            self.forward_to(inc.source, id, call);
        }
        debug!(game = %self.id(), entity = %id, "Arriving copy discarded");
        self.publish(MigrationEvent::Discarded { id });
    }

    fn forward_to(&mut self, to: GameId, id: EntityId, call: PendingCall) {
        self.dispatcher.send(
            to,
            Frame::Call {
                id,
                method: call.method,
                args: call.args,
                hops: call.hops.saturating_add(1),
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn redirects_expire() {
        let mut m = MigrationCoordinator::new(Duration::from_secs(1));
        let id = IdAllocator::new(GameId(1)).mint();
        m.redirects.insert(
            id,
            Redirect {
                game: GameId(2),
                expires: Instant::now() + Duration::from_secs(1),
            },
        );
        assert_eq!(m.redirect(id), Some(GameId(2)));
        assert_eq!(m.state(id), MigrationState::Done);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(m.redirect(id), None);
        assert_eq!(m.prune_redirects(), 1);
        assert_eq!(m.state(id), MigrationState::Idle);
    }

    #[test]
    fn calls_without_migration_are_not_buffered() {
        let mut m = MigrationCoordinator::new(Duration::from_secs(1));
        let id = IdAllocator::new(GameId(1)).mint();
        m.buffer_call(
            id,
            PendingCall {
                method: "Ping".into(),
                args: vec![],
                hops: 0,
            },
        );
        assert_eq!(m.in_flight(), 0);
    }
}
