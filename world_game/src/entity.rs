//! Entities, the per-game registry, and the creation, loading and destruction
//! operations that feed it.

use std::collections::HashMap;
use std::fmt;

use tracing::{debug, info, warn};
use world_shared::net::{Frame, LoadOutcome};
use world_shared::prelude::*;
use world_shared::storage::EntitySnapshot;

use crate::behavior::{EntityBehavior, TypeFlags, SPACE_KIND_ATTR, SPACE_TYPE};
use crate::game::{bounded, Game};
use crate::space::NIL_SPACE_KIND;

/// Where an entity stands with respect to migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Owned here, calls execute.
    Active,
    /// Source side of an in-flight migration; calls are buffered.
    Leaving,
    /// Destination side, waiting for the source to commit; calls are buffered.
    Arriving,
}

/// A resident entity.
pub struct Entity {
    id: EntityId,
    pub(crate) type_name: String,
    flags: TypeFlags,
    pub(crate) position: Vec3,
    pub(crate) space: Option<EntityId>,
    pub(crate) attrs: Attrs,
    pub(crate) behavior: Option<Box<dyn EntityBehavior>>,
    pub(crate) residency: Residency,
}

impl Entity {
    pub(crate) fn new(
        id: EntityId,
        type_name: &str,
        flags: TypeFlags,
        attrs: Attrs,
        behavior: Box<dyn EntityBehavior>,
    ) -> Self {
        Self {
            id,
            type_name: type_name.to_string(),
            flags,
            position: Vec3::ZERO,
            space: None,
            attrs,
            behavior: Some(behavior),
            residency: Residency::Active,
        }
    }

    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn flags(&self) -> TypeFlags {
        self.flags
    }

    pub fn position(&self) -> Vec3 {
        self.position
    }

    /// Current space; `None` only for spaces themselves.
    pub fn space(&self) -> Option<EntityId> {
        self.space
    }

    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    pub fn attrs_mut(&mut self) -> &mut Attrs {
        &mut self.attrs
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    pub fn is_active(&self) -> bool {
        self.residency == Residency::Active
    }

    pub fn is_space(&self) -> bool {
        self.flags.contains(TypeFlags::SPACE)
    }

    pub fn is_persistent(&self) -> bool {
        self.flags.contains(TypeFlags::PERSISTENT)
    }

    pub fn snapshot(&self) -> EntitySnapshot {
        EntitySnapshot {
            type_name: self.type_name.clone(),
            id: self.id,
            position: self.position,
            attrs: self.attrs.clone(),
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("id", &self.id)
            .field("type_name", &self.type_name)
            .field("position", &self.position)
            .field("space", &self.space)
            .field("residency", &self.residency)
            .finish()
    }
}

/// Entities resident on one game.
#[derive(Default, Debug)]
pub struct EntityRegistry {
    entities: HashMap<EntityId, Entity>,
}

impl EntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, entity: Entity) -> WorldResult<()> {
        if self.entities.contains_key(&entity.id) {
            return Err(WorldError::misuse(format!(
                "entity {} already registered",
                entity.id
            )));
        }
        self.entities.insert(entity.id, entity);
        Ok(())
    }

    pub fn get(&self, id: EntityId) -> Option<&Entity> {
        self.entities.get(&id)
    }

    pub fn get_mut(&mut self, id: EntityId) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    pub fn remove(&mut self, id: EntityId) -> Option<Entity> {
        self.entities.remove(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.entities.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Resident IDs in ascending order.
    pub fn ids(&self) -> Vec<EntityId> {
        let mut ids: Vec<EntityId> = self.entities.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }
}

/// Completion of a load request, run on the requesting game.
pub type LoadCallback = Box<dyn FnOnce(&mut Game, LoadOutcome) -> anyhow::Result<()> + Send>;

/// Published on the requester's event bus when a load request resolves.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadFinished {
    pub id: EntityId,
    pub outcome: LoadOutcome,
}

/// Published when an entity is removed for good.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntityDestroyed {
    pub id: EntityId,
}

impl Game {
    fn creatable_flags(&self, type_name: &str) -> WorldResult<TypeFlags> {
        if type_name == SPACE_TYPE {
            return Err(WorldError::misuse(
                "spaces are created with create_space_locally/anywhere",
            ));
        }
        let desc = self
            .types
            .get(type_name)
            .ok_or_else(|| WorldError::not_found(format!("entity type {type_name}")))?;
        if desc.flags.contains(TypeFlags::SERVICE) {
            return Err(WorldError::misuse(format!(
                "{type_name} is a service; it is created on first call_service"
            )));
        }
        Ok(desc.flags)
    }

    /// Creates an entity on this game, in the nil space, and runs its `on_init`.
    pub fn create_entity_locally(&mut self, type_name: &str) -> WorldResult<EntityId> {
        self.create_entity_locally_with(type_name, Attrs::new())
    }

    pub fn create_entity_locally_with(
        &mut self,
        type_name: &str,
        attrs: Attrs,
    ) -> WorldResult<EntityId> {
        self.creatable_flags(type_name)?;
        let id = self.ids.mint();
        self.spawn_entity(id, type_name, attrs)?;
        Ok(id)
    }

    /// Creates an entity on the least-loaded game. The ID is usable at once:
    /// calls made before the entity exists wait at its location authority.
    pub fn create_entity_anywhere(&mut self, type_name: &str) -> WorldResult<EntityId> {
        self.creatable_flags(type_name)?;
        let id = self.ids.mint();
        let target = self.choose_game();
        self.place_entity(id, type_name, Attrs::new(), target);
        Ok(id)
    }

    /// Creates a space on this game. Kind 0 belongs to the nil space.
    pub fn create_space_locally(&mut self, kind: i64) -> WorldResult<EntityId> {
        let attrs = space_attrs(kind)?;
        let id = self.ids.mint();
        self.spawn_entity(id, SPACE_TYPE, attrs)?;
        Ok(id)
    }

    pub fn create_space_anywhere(&mut self, kind: i64) -> WorldResult<EntityId> {
        let attrs = space_attrs(kind)?;
        let id = self.ids.mint();
        let target = self.choose_game();
        self.place_entity(id, SPACE_TYPE, attrs, target);
        Ok(id)
    }

    /// Reserves `id` for `target` at its authority and asks `target` to create it.
    pub(crate) fn place_entity(
        &mut self,
        id: EntityId,
        type_name: &str,
        attrs: Attrs,
        target: GameId,
    ) {
        if target == self.id() {
            if let Err(e) = self.spawn_entity(id, type_name, attrs) {
                warn!(game = %self.id(), entity = %id, error = %e, "Local placement failed");
            }
            return;
        }
        let authority = self.dispatcher.authority_of(id);
        self.send(authority, Frame::Reserve { id, game: target });
        self.send(
            target,
            Frame::Create {
                id,
                type_name: type_name.to_string(),
                attrs,
            },
        );
    }

    /// Registers an entity under a known ID and announces it to its authority.
    pub(crate) fn spawn_entity(
        &mut self,
        id: EntityId,
        type_name: &str,
        attrs: Attrs,
    ) -> WorldResult<()> {
        if self.entities.contains(id) {
            return Err(WorldError::misuse(format!("entity {id} already exists")));
        }
        let behavior = self.types.instantiate(type_name)?;
        let flags = self.types.flags(type_name);
        let mut entity = Entity::new(id, type_name, flags, attrs, behavior);

        if flags.contains(TypeFlags::SPACE) {
            let kind = entity
                .attrs
                .get(SPACE_KIND_ATTR)
                .and_then(Value::as_int)
                .ok_or_else(|| WorldError::misuse(format!("space {id} has no kind")))?;
            if id.is_nil_space() {
                if kind != NIL_SPACE_KIND {
                    return Err(WorldError::misuse("nil space ID with non-zero kind"));
                }
            } else {
                self.spaces.create(id, kind)?;
            }
            self.entities.insert(entity)?;
        } else {
            let nil = self.spaces.nil_space_id();
            entity.space = Some(nil);
            self.entities.insert(entity)?;
            self.spaces.enter(None, nil, id, Vec3::ZERO, &mut Vec::new())?;
        }

        debug!(game = %self.id(), entity = %id, type_name, "Entity created");
        if !id.is_nil_space() {
            let authority = self.dispatcher.authority_of(id);
            self.send(
                authority,
                Frame::Located {
                    id,
                    game: self.id(),
                },
            );
        }
        self.with_behavior(id, |b, ctx| b.on_init(ctx));
        Ok(())
    }

    /// Loads `id` from storage onto `game` unless it is already live or being
    /// loaded somewhere. `on_done` runs here exactly once with the outcome.
    pub fn load_entity_on_game<F>(
        &mut self,
        type_name: &str,
        id: EntityId,
        game: GameId,
        on_done: F,
    ) -> WorldResult<()>
    where
        F: FnOnce(&mut Game, LoadOutcome) -> anyhow::Result<()> + Send + 'static,
    {
        let flags = self
            .types
            .get(type_name)
            .map(|d| d.flags)
            .ok_or_else(|| WorldError::not_found(format!("entity type {type_name}")))?;
        if !flags.contains(TypeFlags::PERSISTENT) {
            return Err(WorldError::misuse(format!(
                "{type_name} is not persistent and cannot be loaded"
            )));
        }
        if id.is_nil_space() {
            return Err(WorldError::misuse("nil spaces are never loaded"));
        }
        self.next_load_token += 1;
        let token = self.next_load_token;
        self.load_waiters.insert(token, Box::new(on_done));
        let authority = self.dispatcher.authority_of(id);
        self.send(
            authority,
            Frame::LoadRequest {
                type_name: type_name.to_string(),
                id,
                target: game,
                requester: self.id(),
                token,
            },
        );
        Ok(())
    }

    pub fn load_entity_anywhere<F>(
        &mut self,
        type_name: &str,
        id: EntityId,
        on_done: F,
    ) -> WorldResult<()>
    where
        F: FnOnce(&mut Game, LoadOutcome) -> anyhow::Result<()> + Send + 'static,
    {
        let target = self.choose_game();
        self.load_entity_on_game(type_name, id, target, on_done)
    }

    pub fn load_entity_locally<F>(
        &mut self,
        type_name: &str,
        id: EntityId,
        on_done: F,
    ) -> WorldResult<()>
    where
        F: FnOnce(&mut Game, LoadOutcome) -> anyhow::Result<()> + Send + 'static,
    {
        let me = self.id();
        self.load_entity_on_game(type_name, id, me, on_done)
    }

    /// Authority side of a load: at most one placement per ID.
    pub(crate) fn handle_load_request(
        &mut self,
        type_name: String,
        id: EntityId,
        target: GameId,
        requester: GameId,
        token: u64,
    ) {
        if self.dispatcher.authority.is_known(id) {
            debug!(game = %self.id(), entity = %id, "Load skipped, entity already placed");
            self.send(
                requester,
                Frame::LoadOutcome {
                    id,
                    token,
                    outcome: LoadOutcome::AlreadyPresent,
                },
            );
            return;
        }
        self.dispatcher.authority.reserve(id, target);
        self.send(
            target,
            Frame::Load {
                type_name,
                id,
                requester,
                token,
            },
        );
    }

    /// Target side of a load: read storage off the loop, register on return.
    pub(crate) fn handle_load(
        &mut self,
        type_name: String,
        id: EntityId,
        requester: GameId,
        token: u64,
    ) {
        if self.entities.contains(id) || !self.loading.insert(id) {
            self.send(
                requester,
                Frame::LoadOutcome {
                    id,
                    token,
                    outcome: LoadOutcome::AlreadyPresent,
                },
            );
            return;
        }
        let storage = self.storage.clone();
        let timeout = self.cfg.storage_timeout();
        let key = type_name.clone();
        self.spawn_io(
            async move { bounded(timeout, format!("load {key} {id}"), storage.load(&key, id)).await },
            move |game, res| {
                game.finish_load(&type_name, id, (requester, token), res);
                Ok(())
            },
        );
    }

    fn finish_load(
        &mut self,
        type_name: &str,
        id: EntityId,
        (requester, token): (GameId, u64),
        res: WorldResult<Option<Attrs>>,
    ) {
        self.loading.remove(&id);
        let res = match res {
            Ok(Some(attrs)) => self.spawn_entity(id, type_name, attrs),
            Ok(None) => Err(WorldError::not_found(format!("{type_name} {id} in storage"))),
            Err(e) => Err(e),
        };
        let outcome = match res {
            Ok(()) => {
                info!(game = %self.id(), entity = %id, type_name, "Entity loaded");
                LoadOutcome::Loaded(self.id())
            }
            Err(e) => {
                warn!(game = %self.id(), entity = %id, type_name, error = %e, "Load failed");
                let authority = self.dispatcher.authority_of(id);
                self.send(
                    authority,
                    Frame::Gone {
                        id,
                        game: self.id(),
                    },
                );
                LoadOutcome::Failed(e)
            }
        };
        self.send(requester, Frame::LoadOutcome { id, token, outcome });
    }

    /// Requester side: completes the load that issued `token`.
    pub(crate) fn handle_load_outcome(&mut self, id: EntityId, token: u64, outcome: LoadOutcome) {
        self.publish(LoadFinished {
            id,
            outcome: outcome.clone(),
        });
        match self.load_waiters.remove(&token) {
            Some(cb) => self.run_callback("load", move |game| cb(game, outcome)),
            None => debug!(game = %self.id(), entity = %id, token, "Load outcome without waiter"),
        }
    }

    /// Persisted IDs of `type_name`, delivered to `on_done` on this loop.
    pub fn list_entity_ids<F>(&self, type_name: &str, on_done: F)
    where
        F: FnOnce(&mut Game, WorldResult<Vec<EntityId>>) -> anyhow::Result<()> + Send + 'static,
    {
        let storage = self.storage.clone();
        let timeout = self.cfg.storage_timeout();
        let key = type_name.to_string();
        self.spawn_io(
            async move { bounded(timeout, format!("list {key}"), storage.list_entity_ids(&key)).await },
            on_done,
        );
    }

    /// Whether `(type_name, id)` is persisted, delivered to `on_done`.
    pub fn exists<F>(&self, type_name: &str, id: EntityId, on_done: F)
    where
        F: FnOnce(&mut Game, WorldResult<bool>) -> anyhow::Result<()> + Send + 'static,
    {
        let storage = self.storage.clone();
        let timeout = self.cfg.storage_timeout();
        let key = type_name.to_string();
        self.spawn_io(
            async move {
                bounded(timeout, format!("exists {key} {id}"), storage.exists(&key, id)).await
            },
            on_done,
        );
    }

    /// Writes a persistent entity's attributes in the background.
    pub(crate) fn save_entity(&self, id: EntityId) {
        let Some(entity) = self.entities.get(id).filter(|e| e.is_persistent()) else {
            return;
        };
        let storage = self.storage.clone();
        let timeout = self.cfg.storage_timeout();
        let type_name = entity.type_name().to_string();
        let attrs = entity.attrs.clone();
        self.spawn_io(
            async move {
                let what = format!("save {type_name} {id}");
                bounded(timeout, what, storage.save(&type_name, id, &attrs)).await
            },
            move |game, res: WorldResult<()>| {
                if let Err(e) = res {
                    warn!(game = %game.id(), entity = %id, error = %e, "Save failed");
                }
                Ok(())
            },
        );
    }

    /// Saves every active persistent entity. Returns how many were queued.
    pub fn save_all(&mut self) -> usize {
        let ids: Vec<EntityId> = self
            .entities
            .iter()
            .filter(|e| e.is_persistent() && e.is_active())
            .map(Entity::id)
            .collect();
        for id in &ids {
            self.save_entity(*id);
        }
        if !ids.is_empty() {
            debug!(game = %self.id(), count = ids.len(), "Periodic save");
        }
        ids.len()
    }

    /// Destroys a local entity. Persistent entities are saved first; a space
    /// sends its members back to the nil space.
    pub fn destroy_entity(&mut self, id: EntityId) -> WorldResult<()> {
        let entity = self
            .entities
            .get(id)
            .ok_or_else(|| WorldError::not_found(format!("entity {id}")))?;
        if id.is_nil_space() {
            return Err(WorldError::misuse("the nil space is never destroyed"));
        }
        if !entity.is_active() {
            return Err(WorldError::MigrationInFlight(id));
        }
        let is_space = entity.is_space();
        let is_service = entity.flags().contains(TypeFlags::SERVICE);
        let type_name = entity.type_name().to_string();

        if is_space {
            let members: Vec<EntityId> = self
                .spaces
                .get(id)
                .map(|s| s.members().collect())
                .unwrap_or_default();
            for member in members {
                self.move_to_nil_space(member);
            }
            self.spaces.remove(id)?;
        }

        self.with_behavior(id, |b, ctx| b.on_destroy(ctx));
        self.save_entity(id);

        let mut events = Vec::new();
        if let Some(space) = self.entities.get(id).and_then(Entity::space) {
            self.spaces.leave(space, id, &mut events);
        }
        self.entities.remove(id);
        self.dispatch_aoi_events(events);

        let authority = self.dispatcher.authority_of(id);
        self.send(
            authority,
            Frame::Gone {
                id,
                game: self.id(),
            },
        );
        if is_service {
            let authority = self.dispatcher.authority_of_name(&type_name);
            self.send(
                authority,
                Frame::ServiceReleased {
                    name: type_name.clone(),
                    id,
                },
            );
        }
        self.publish(EntityDestroyed { id });
        info!(game = %self.id(), entity = %id, type_name, "Entity destroyed");
        Ok(())
    }
}

fn space_attrs(kind: i64) -> WorldResult<Attrs> {
    if kind == NIL_SPACE_KIND {
        return Err(WorldError::misuse(
            "kind 0 is reserved for the nil space and cannot be created",
        ));
    }
    let mut attrs = Attrs::new();
    attrs.insert(SPACE_KIND_ATTR.to_string(), Value::Int(kind));
    Ok(attrs)
}

/// Attributes of a game's nil space entity.
pub(crate) fn nil_space_attrs() -> Attrs {
    let mut attrs = Attrs::new();
    attrs.insert(SPACE_KIND_ATTR.to_string(), Value::Int(NIL_SPACE_KIND));
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::behavior::InertBehavior;

    fn entity(id: EntityId) -> Entity {
        Entity::new(
            id,
            "Monster",
            TypeFlags::empty(),
            Attrs::new(),
            Box::new(InertBehavior),
        )
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut alloc = IdAllocator::new(GameId(1));
        let (a, b) = (alloc.mint(), alloc.mint());
        let mut reg = EntityRegistry::new();
        reg.insert(entity(b)).unwrap();
        reg.insert(entity(a)).unwrap();
        assert!(matches!(reg.insert(entity(a)), Err(WorldError::Misuse(_))));
        assert_eq!(reg.ids(), vec![a, b]);
        assert!(reg.remove(a).is_some());
        assert!(!reg.contains(a));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn snapshot_carries_state() {
        let id = IdAllocator::new(GameId(1)).mint();
        let mut e = entity(id);
        e.position = Vec3::new(1.0, 2.0, 3.0);
        e.attrs_mut().insert("hp".into(), Value::Int(7));
        let snap = e.snapshot();
        assert_eq!(snap.id, id);
        assert_eq!(snap.type_name, "Monster");
        assert_eq!(snap.position, Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(snap.attrs.get("hp"), Some(&Value::Int(7)));
    }

    #[test]
    fn kind_zero_has_no_attrs() {
        assert!(matches!(space_attrs(0), Err(WorldError::Misuse(_))));
        assert_eq!(
            space_attrs(4).unwrap().get(SPACE_KIND_ATTR),
            Some(&Value::Int(4))
        );
    }
}
