//! One game process.
//!
//! A `Game` owns every entity, space and routing table of its process and is
//! only ever touched from its own loop. Entity behaviors run synchronously
//! inside a turn; their side effects are queued as commands and executed in
//! issue order once the behavior returns. Storage and KVDB work runs on tokio
//! tasks and comes back as posted continuations.
//!
//! Determinism notes:
//! - Commands run breadth-first in issue order.
//! - AOI events are produced in sorted ID order.
//! - Nothing here reads the wall clock except ID minting.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use world_shared::kvdb::KvdbClient;
use world_shared::net::{decode_envelope, Frame, Messenger};
use world_shared::prelude::*;
use world_shared::storage::EntityStorage;

use crate::aoi::{AoiEvent, InterestChange};
use crate::behavior::{Command, EntityBehavior, EntityContext, TypeRegistry, SPACE_TYPE};
use crate::dispatcher::{Dispatcher, PendingCall};
use crate::entity::{nil_space_attrs, Entity, EntityRegistry, LoadCallback};
use crate::migration::MigrationCoordinator;
use crate::placement::PlacementPolicy;
use crate::scheduler::{Callback, Scheduler, TimerId, TimerTask};
use crate::service::ServiceRegistry;
use crate::space::{Space, SpaceManager};

/// Work posted back onto a game loop.
pub type Post = Callback;

/// External services a game talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub messenger: Arc<dyn Messenger>,
    pub storage: Arc<dyn EntityStorage>,
    pub kvdb: KvdbClient,
}

/// Bounds a storage round-trip.
pub(crate) async fn bounded<T>(
    timeout: Duration,
    what: String,
    fut: impl Future<Output = WorldResult<T>>,
) -> WorldResult<T> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| WorldError::Timeout(what))?
}

pub struct Game {
    pub(crate) cfg: GameConfig,
    pub(crate) types: Arc<TypeRegistry>,
    pub(crate) ids: IdAllocator,
    pub(crate) entities: EntityRegistry,
    pub(crate) spaces: SpaceManager,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) migrations: MigrationCoordinator,
    pub(crate) services: ServiceRegistry,
    pub(crate) placement: PlacementPolicy,
    pub(crate) scheduler: Scheduler,
    pub(crate) storage: Arc<dyn EntityStorage>,
    pub(crate) loading: HashSet<EntityId>,
    pub(crate) load_waiters: HashMap<u64, LoadCallback>,
    pub(crate) next_load_token: u64,
    kvdb: KvdbClient,
    events: EventBus,
    posts: mpsc::UnboundedSender<Post>,
    commands: VecDeque<Command>,
    flushing: bool,
}

impl Game {
    /// Builds a game with its nil space and housekeeping timers in place.
    ///
    /// Must run inside a tokio runtime.
    pub fn new(
        cfg: GameConfig,
        types: Arc<TypeRegistry>,
        collab: Collaborators,
        posts: mpsc::UnboundedSender<Post>,
    ) -> WorldResult<Self> {
        cfg.validate()?;
        let me = cfg.game_id;
        let mut game = Self {
            ids: IdAllocator::new(me),
            entities: EntityRegistry::new(),
            spaces: SpaceManager::new(me, cfg.default_aoi_radius),
            dispatcher: Dispatcher::new(
                me,
                cfg.games.clone(),
                collab.messenger,
                cfg.max_forward_hops,
            ),
            migrations: MigrationCoordinator::new(cfg.redirect_ttl()),
            services: ServiceRegistry::new(),
            placement: PlacementPolicy::new(),
            scheduler: Scheduler::new(),
            storage: collab.storage,
            loading: HashSet::new(),
            load_waiters: HashMap::new(),
            next_load_token: 0,
            kvdb: collab.kvdb,
            events: EventBus::default(),
            posts,
            commands: VecDeque::new(),
            flushing: false,
            types,
            cfg,
        };

        game.spawn_entity(EntityId::nil_space(me), SPACE_TYPE, nil_space_attrs())?;

        game.add_timer(game.cfg.load_report_interval(), |g| {
            g.report_load();
            Ok(())
        });
        if let Some(every) = game.cfg.save_interval() {
            game.add_timer(every, |g| {
                g.save_all();
                Ok(())
            });
        }
        game.add_timer(game.cfg.redirect_ttl(), |g| {
            let pruned = g.migrations.prune_redirects();
            if pruned > 0 {
                debug!(game = %g.id(), pruned, "Redirects expired");
            }
            Ok(())
        });

        info!(game = %me, games = game.cfg.games.len(), "Game started");
        Ok(game)
    }

    pub fn id(&self) -> GameId {
        self.cfg.game_id
    }

    pub fn config(&self) -> &GameConfig {
        &self.cfg
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn entity(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(id)
    }

    pub fn entity_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.iter()
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn space(&self, id: EntityId) -> Option<&Space> {
        self.spaces.get(id)
    }

    pub fn nil_space_id(&self) -> EntityId {
        self.spaces.nil_space_id()
    }

    pub fn nil_space(&self) -> Option<&Space> {
        self.spaces.get(self.spaces.nil_space_id())
    }

    /// Sets the interest radius of an empty, non-nil space hosted here.
    pub fn enable_aoi(&mut self, space: EntityId, radius: f32) -> WorldResult<()> {
        self.spaces.enable_aoi(space, radius)
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn events_mut(&mut self) -> &mut EventBus {
        &mut self.events
    }

    /// Drains every queued event of type `E`.
    pub fn drain_events<E: 'static + Send>(&mut self) -> Vec<E> {
        self.events.drain::<E>()
    }

    /// Queues a system event when `publish_events` is on.
    pub(crate) fn publish<E: 'static + Send>(&mut self, e: E) {
        if self.cfg.publish_events {
            self.events.push(e);
        }
    }

    // ─── Inbound ───

    /// Decodes and handles one packet from the network.
    pub fn handle_packet(&mut self, packet: &Bytes) {
        match decode_envelope(packet) {
            Ok(env) if env.to == self.id() => self.handle_frame(env.from, env.frame),
            Ok(env) => warn!(game = %self.id(), to = %env.to, "Misaddressed frame dropped"),
            Err(e) => warn!(game = %self.id(), error = %format!("{e:#}"), "Undecodable packet dropped"),
        }
    }

    pub(crate) fn handle_frame(&mut self, from: GameId, frame: Frame) {
        match frame {
            Frame::Call {
                id,
                method,
                args,
                hops,
            } => self.route_call(id, PendingCall { method, args, hops }),
            Frame::Create {
                id,
                type_name,
                attrs,
            } => {
                if let Err(e) = self.spawn_entity(id, &type_name, attrs) {
                    warn!(game = %self.id(), entity = %id, %type_name, %from, error = %e, "Remote create failed");
                    if self.entities.contains(id) {
                        return;
                    }
                    let authority = self.dispatcher.authority_of(id);
                    let me = self.id();
                    self.send(authority, Frame::Gone { id, game: me });
                }
            }
            Frame::LoadRequest {
                type_name,
                id,
                target,
                requester,
                token,
            } => self.handle_load_request(type_name, id, target, requester, token),
            Frame::Load {
                type_name,
                id,
                requester,
                token,
            } => self.handle_load(type_name, id, requester, token),
            Frame::LoadOutcome { id, token, outcome } => {
                self.handle_load_outcome(id, token, outcome)
            }
            Frame::Reserve { id, game } => self.handle_reserve(id, game),
            Frame::Located { id, game } => self.handle_located(id, game),
            Frame::Gone { id, game } => self.handle_gone(id, game),
            Frame::MigrateIn {
                migration,
                source,
                space,
                position,
                snapshot,
                hops,
            } => self.handle_migrate_in(migration, source, space, position, snapshot, hops),
            Frame::MigrateAck {
                id,
                migration,
                dest,
            } => self.handle_migrate_ack(id, migration, dest),
            Frame::MigrateReject {
                id,
                migration,
                reason,
            } => self.handle_migrate_reject(id, migration, reason),
            Frame::MigrateCommit { id, migration } => self.handle_migrate_commit(id, migration),
            Frame::MigrateAbort { id, migration } => self.handle_migrate_abort(id, migration),
            Frame::ServiceQuery { name, requester } => self.handle_service_query(name, requester),
            Frame::ServiceRegistered { name, id } => self.handle_service_registered(name, id),
            Frame::ServiceReleased { name, id } => self.handle_service_released(name, id),
            Frame::LoadReport { game, entities } => self.handle_load_report(game, entities),
        }
    }

    // ─── Behaviors & commands ───

    /// Runs `f` against the behavior of `id` and then executes the commands it
    /// issued. Returns `None` when `id` is not resident or its behavior is
    /// already running.
    pub(crate) fn with_behavior<R>(
        &mut self,
        id: EntityId,
        f: impl FnOnce(&mut dyn EntityBehavior, &mut EntityContext<'_>) -> R,
    ) -> Option<R> {
        let game = self.id();
        let mut commands = Vec::new();
        let entity = self.entities.get_mut(id)?;
        let mut behavior = entity.behavior.take()?;
        let out = {
            let mut ctx = EntityContext {
                id,
                type_name: &entity.type_name,
                game,
                position: entity.position,
                space: entity.space,
                attrs: &mut entity.attrs,
                commands: &mut commands,
            };
            f(behavior.as_mut(), &mut ctx)
        };
        entity.behavior = Some(behavior);
        self.commands.extend(commands);
        self.flush_commands();
        Some(out)
    }

    fn flush_commands(&mut self) {
        if self.flushing {
            return;
        }
        self.flushing = true;
        while let Some(cmd) = self.commands.pop_front() {
            if let Err(e) = self.apply_command(cmd) {
                warn!(game = %self.id(), error = %e, "Entity command failed");
            }
        }
        self.flushing = false;
    }

    fn apply_command(&mut self, cmd: Command) -> WorldResult<()> {
        match cmd {
            Command::Call { id, method, args } => {
                self.call(id, &method, args);
                Ok(())
            }
            Command::CallService { name, method, args } => self.call_service(&name, &method, args),
            Command::CallNilSpaces { method, args } => {
                self.call_nil_spaces(&method, args);
                Ok(())
            }
            Command::Move { id, position } => self.move_entity(id, position),
            Command::EnterSpace {
                id,
                space,
                position,
            } => self.enter_space(id, space, position),
            Command::LeaveSpace { id } => self.leave_space(id),
            Command::MigrateToGame { id, game } => self.migrate_to_game(id, game),
            Command::Destroy { id } => self.destroy_entity(id),
            Command::CallLater {
                delay,
                id,
                method,
                args,
            } => {
                self.add_callback(delay, move |game| {
                    game.call(id, &method, args);
                    Ok(())
                });
                Ok(())
            }
        }
    }

    /// Moves a local entity within its space.
    pub fn move_entity(&mut self, id: EntityId, position: Vec3) -> WorldResult<()> {
        if !position.is_finite() {
            return Err(WorldError::InvalidArgument(format!(
                "non-finite position {position:?}"
            )));
        }
        let entity = self
            .entities
            .get_mut(id)
            .ok_or_else(|| WorldError::not_found(format!("entity {id}")))?;
        if !entity.is_active() {
            return Err(WorldError::MigrationInFlight(id));
        }
        entity.position = position;
        let Some(space) = entity.space else {
            return Ok(());
        };
        let mut events = Vec::new();
        self.spaces.move_entity(space, id, position, &mut events);
        self.dispatch_aoi_events(events);
        Ok(())
    }

    /// Publishes interest changes and runs the observers' AOI hooks. Hooks of
    /// migrating observers wait for the migration to resolve.
    pub(crate) fn dispatch_aoi_events(&mut self, events: Vec<AoiEvent>) {
        for ev in events {
            self.publish(ev);
            if !self.migrations.hold_interest(ev) {
                self.run_interest_hook(ev);
            }
        }
    }

    pub(crate) fn run_interest_hook(&mut self, ev: AoiEvent) {
        match ev.change {
            InterestChange::Enter => {
                self.with_behavior(ev.observer, |b, ctx| b.on_enter_aoi(ctx, ev.subject))
            }
            InterestChange::Leave => {
                self.with_behavior(ev.observer, |b, ctx| b.on_leave_aoi(ctx, ev.subject))
            }
        };
    }

    // ─── Scheduling ───

    /// Runs `cb` on a later turn.
    pub fn post<F>(&self, cb: F)
    where
        F: FnOnce(&mut Game) -> anyhow::Result<()> + Send + 'static,
    {
        if self.posts.send(Box::new(cb)).is_err() {
            debug!(game = %self.id(), "Loop stopped, post dropped");
        }
    }

    pub fn add_callback<F>(&mut self, delay: Duration, cb: F) -> TimerId
    where
        F: FnOnce(&mut Game) -> anyhow::Result<()> + Send + 'static,
    {
        self.scheduler.add_callback(delay, Box::new(cb))
    }

    pub fn add_timer<F>(&mut self, interval: Duration, cb: F) -> TimerId
    where
        F: FnMut(&mut Game) -> anyhow::Result<()> + Send + 'static,
    {
        self.scheduler.add_timer(interval, Box::new(cb))
    }

    pub fn cancel_timer(&mut self, id: TimerId) -> bool {
        self.scheduler.cancel(id)
    }

    pub fn next_timer_deadline(&mut self) -> Option<tokio::time::Instant> {
        self.scheduler.next_deadline()
    }

    /// Runs a callback, logging its error. Errors never leave the loop.
    pub fn run_callback<F>(&mut self, what: &str, cb: F)
    where
        F: FnOnce(&mut Game) -> anyhow::Result<()>,
    {
        if let Err(e) = cb(self) {
            warn!(game = %self.id(), what, error = %format!("{e:#}"), "Callback failed");
        }
    }

    /// Runs every timer due now. Timers armed by these callbacks wait for a
    /// later turn.
    pub fn run_due_timers(&mut self) -> usize {
        let now = tokio::time::Instant::now();
        let due = self.scheduler.take_due(now);
        let mut ran = 0;
        for id in due {
            let Some(task) = self.scheduler.take(id) else {
                continue;
            };
            ran += 1;
            match task {
                TimerTask::Once(cb) => self.run_callback("timer", cb),
                TimerTask::Repeat { interval, mut cb } => {
                    self.run_callback("timer", |game| cb(game));
                    self.scheduler.finish_repeat(id, interval, cb, now);
                }
            }
        }
        ran
    }

    /// Runs `fut` off the loop and posts `cont` with its output.
    pub fn spawn_io<T, Fut, C>(&self, fut: Fut, cont: C)
    where
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        C: FnOnce(&mut Game, T) -> anyhow::Result<()> + Send + 'static,
    {
        let posts = self.posts.clone();
        tokio::spawn(async move {
            let out = fut.await;
            let post: Post = Box::new(move |game: &mut Game| cont(game, out));
            if posts.send(post).is_err() {
                debug!("Loop stopped before io completed");
            }
        });
    }

    // ─── KVDB ───

    pub fn kvdb_get<F>(&self, key: &str, on_done: F)
    where
        F: FnOnce(&mut Game, WorldResult<Option<String>>) -> anyhow::Result<()> + Send + 'static,
    {
        self.spawn_io(self.kvdb.get(key), on_done);
    }

    pub fn kvdb_put<F>(&self, key: &str, val: &str, on_done: F)
    where
        F: FnOnce(&mut Game, WorldResult<()>) -> anyhow::Result<()> + Send + 'static,
    {
        self.spawn_io(self.kvdb.put(key, val), on_done);
    }

    /// Returns the stored value, or stores and returns `default` when the key
    /// is absent or empty. Not atomic across games.
    pub fn kvdb_get_or_put<F>(&self, key: &str, default: &str, on_done: F)
    where
        F: FnOnce(&mut Game, WorldResult<String>) -> anyhow::Result<()> + Send + 'static,
    {
        self.spawn_io(self.kvdb.get_or_put(key, default), on_done);
    }

    pub fn kvdb_get_range<F>(&self, begin: &str, end: &str, on_done: F)
    where
        F: FnOnce(&mut Game, WorldResult<Vec<(String, String)>>) -> anyhow::Result<()>
            + Send
            + 'static,
    {
        self.spawn_io(self.kvdb.get_range(begin, end), on_done);
    }

    // ─── Shutdown ───

    /// Saves every persistent entity and waits for the writes.
    pub async fn shutdown(&mut self) {
        let timeout = self.cfg.storage_timeout();
        let storage = self.storage.clone();
        let pending: Vec<(String, EntityId, Attrs)> = self
            .entities
            .iter()
            .filter(|e| e.is_persistent())
            .map(|e| (e.type_name().to_string(), e.id(), e.attrs().clone()))
            .collect();
        let mut saved = 0usize;
        for (type_name, id, attrs) in pending {
            let what = format!("save {type_name} {id}");
            match bounded(timeout, what, storage.save(&type_name, id, &attrs)).await {
                Ok(()) => saved += 1,
                Err(e) => {
                    warn!(game = %self.id(), entity = %id, error = %e, "Save on shutdown failed")
                }
            }
        }
        info!(game = %self.id(), saved, "Game stopped");
    }
}

impl std::fmt::Debug for Game {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Game")
            .field("id", &self.id())
            .field("entities", &self.entities.len())
            .field("spaces", &self.spaces.len())
            .field("migrations", &self.migrations)
            .finish()
    }
}
