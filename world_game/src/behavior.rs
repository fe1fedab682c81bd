//! Entity behaviors and the type registry.
//!
//! Game code implements [`EntityBehavior`] per entity type and registers a
//! factory for it. Behaviors never touch the game directly: side effects go
//! through [`EntityContext`] as [`Command`]s, which the game executes in issue
//! order right after the behavior returns, within the same loop turn.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bitflags::bitflags;
use world_shared::prelude::*;

/// Type name under which every space entity is registered.
pub const SPACE_TYPE: &str = "__space__";

/// Attribute holding a space entity's kind.
pub const SPACE_KIND_ATTR: &str = "_space_kind";

bitflags! {
    /// Properties of a registered type.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TypeFlags: u8 {
        /// Saved periodically and before destruction; loadable from storage.
        const PERSISTENT = 1 << 0;
        /// Cluster-wide singleton addressed by its type name.
        const SERVICE = 1 << 1;
        /// Space container.
        const SPACE = 1 << 2;
    }
}

/// Per-type entity logic.
pub trait EntityBehavior: Send {
    /// Runs once when the entity is created or loaded (not on migration).
    fn on_init(&mut self, _ctx: &mut EntityContext<'_>) {}

    /// Handles a method call. An error is logged and dropped by the dispatcher.
    fn on_call(
        &mut self,
        ctx: &mut EntityContext<'_>,
        method: &str,
        args: &[Value],
    ) -> anyhow::Result<()>;

    fn on_enter_space(&mut self, _ctx: &mut EntityContext<'_>, _space: EntityId) {}

    fn on_enter_aoi(&mut self, _ctx: &mut EntityContext<'_>, _other: EntityId) {}

    fn on_leave_aoi(&mut self, _ctx: &mut EntityContext<'_>, _other: EntityId) {}

    /// Source side, before the state snapshot is taken.
    fn on_migrate_out(&mut self, _ctx: &mut EntityContext<'_>) {}

    /// Destination side, once the source committed.
    fn on_migrate_in(&mut self, _ctx: &mut EntityContext<'_>) {}

    /// Source side, after rollback.
    fn on_migrate_failed(&mut self, _ctx: &mut EntityContext<'_>, _reason: &WorldError) {}

    fn on_destroy(&mut self, _ctx: &mut EntityContext<'_>) {}
}

/// Behavior that ignores every call. Default for spaces.
#[derive(Debug, Default)]
pub struct InertBehavior;

impl EntityBehavior for InertBehavior {
    fn on_call(&mut self, ctx: &mut EntityContext<'_>, method: &str, _: &[Value]) -> anyhow::Result<()> {
        anyhow::bail!("{} has no method {method}", ctx.type_name)
    }
}

/// Deferred side effect requested by a behavior.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Call {
        id: EntityId,
        method: String,
        args: Vec<Value>,
    },
    CallService {
        name: String,
        method: String,
        args: Vec<Value>,
    },
    CallNilSpaces {
        method: String,
        args: Vec<Value>,
    },
    Move {
        id: EntityId,
        position: Vec3,
    },
    EnterSpace {
        id: EntityId,
        space: EntityId,
        position: Vec3,
    },
    LeaveSpace {
        id: EntityId,
    },
    MigrateToGame {
        id: EntityId,
        game: GameId,
    },
    Destroy {
        id: EntityId,
    },
    CallLater {
        delay: Duration,
        id: EntityId,
        method: String,
        args: Vec<Value>,
    },
}

/// What a behavior sees of its entity while it runs.
pub struct EntityContext<'a> {
    pub id: EntityId,
    pub type_name: &'a str,
    pub game: GameId,
    pub position: Vec3,
    pub space: Option<EntityId>,
    pub attrs: &'a mut Attrs,
    pub(crate) commands: &'a mut Vec<Command>,
}

impl EntityContext<'_> {
    pub fn call(&mut self, id: EntityId, method: &str, args: Vec<Value>) {
        self.commands.push(Command::Call {
            id,
            method: method.to_string(),
            args,
        });
    }

    pub fn call_service(&mut self, name: &str, method: &str, args: Vec<Value>) {
        self.commands.push(Command::CallService {
            name: name.to_string(),
            method: method.to_string(),
            args,
        });
    }

    pub fn call_nil_spaces(&mut self, method: &str, args: Vec<Value>) {
        self.commands.push(Command::CallNilSpaces {
            method: method.to_string(),
            args,
        });
    }

    pub fn move_to(&mut self, position: Vec3) {
        self.commands.push(Command::Move {
            id: self.id,
            position,
        });
    }

    pub fn enter_space(&mut self, space: EntityId, position: Vec3) {
        self.commands.push(Command::EnterSpace {
            id: self.id,
            space,
            position,
        });
    }

    pub fn leave_space(&mut self) {
        self.commands.push(Command::LeaveSpace { id: self.id });
    }

    pub fn migrate_to_game(&mut self, game: GameId) {
        self.commands.push(Command::MigrateToGame { id: self.id, game });
    }

    pub fn destroy(&mut self) {
        self.commands.push(Command::Destroy { id: self.id });
    }

    /// Calls `method` on this entity after `delay`.
    pub fn call_later(&mut self, delay: Duration, method: &str, args: Vec<Value>) {
        self.commands.push(Command::CallLater {
            delay,
            id: self.id,
            method: method.to_string(),
            args,
        });
    }
}

/// Builds a fresh behavior instance.
pub type BehaviorFactory = Arc<dyn Fn() -> Box<dyn EntityBehavior> + Send + Sync>;

/// A registered entity type.
#[derive(Clone)]
pub struct TypeDesc {
    pub name: String,
    pub flags: TypeFlags,
    factory: BehaviorFactory,
}

impl std::fmt::Debug for TypeDesc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeDesc")
            .field("name", &self.name)
            .field("flags", &self.flags)
            .finish()
    }
}

/// All entity, space and service types known to the cluster.
///
/// Built once at startup and shared by every game of a process.
#[derive(Default, Debug)]
pub struct TypeRegistry {
    types: HashMap<String, TypeDesc>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`. Registering a name twice is misuse.
    pub fn register<F, B>(&mut self, name: &str, flags: TypeFlags, factory: F) -> WorldResult<()>
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: EntityBehavior + 'static,
    {
        if name.is_empty() {
            return Err(WorldError::misuse("empty type name"));
        }
        if self.types.contains_key(name) {
            return Err(WorldError::misuse(format!("type {name} registered twice")));
        }
        let factory: BehaviorFactory =
            Arc::new(move || -> Box<dyn EntityBehavior> { Box::new(factory()) });
        self.types.insert(
            name.to_string(),
            TypeDesc {
                name: name.to_string(),
                flags,
                factory,
            },
        );
        Ok(())
    }

    pub fn register_entity<F, B>(&mut self, name: &str, factory: F) -> WorldResult<()>
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: EntityBehavior + 'static,
    {
        self.register(name, TypeFlags::empty(), factory)
    }

    pub fn register_persistent<F, B>(&mut self, name: &str, factory: F) -> WorldResult<()>
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: EntityBehavior + 'static,
    {
        self.register(name, TypeFlags::PERSISTENT, factory)
    }

    /// Registers the behavior shared by all spaces, nil spaces included.
    pub fn register_space<F, B>(&mut self, factory: F) -> WorldResult<()>
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: EntityBehavior + 'static,
    {
        self.register(SPACE_TYPE, TypeFlags::SPACE, factory)
    }

    /// Registers a service; its type name is also its service name.
    pub fn register_service<F, B>(&mut self, name: &str, factory: F) -> WorldResult<()>
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: EntityBehavior + 'static,
    {
        self.register(name, TypeFlags::SERVICE, factory)
    }

    pub fn get(&self, name: &str) -> Option<&TypeDesc> {
        self.types.get(name)
    }

    pub fn flags(&self, name: &str) -> TypeFlags {
        if name == SPACE_TYPE {
            return TypeFlags::SPACE;
        }
        self.get(name).map_or(TypeFlags::empty(), |d| d.flags)
    }

    pub fn is_service(&self, name: &str) -> bool {
        self.flags(name).contains(TypeFlags::SERVICE)
    }

    pub fn services(&self) -> impl Iterator<Item = &str> {
        self.types
            .values()
            .filter(|d| d.flags.contains(TypeFlags::SERVICE))
            .map(|d| d.name.as_str())
    }

    /// Creates a behavior for `name`. Spaces fall back to [`InertBehavior`].
    pub fn instantiate(&self, name: &str) -> WorldResult<Box<dyn EntityBehavior>> {
        match self.types.get(name) {
            Some(desc) => Ok((desc.factory)()),
            None if name == SPACE_TYPE => Ok(Box::new(InertBehavior)),
            None => Err(WorldError::not_found(format!("entity type {name}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_registration_is_misuse() {
        let mut types = TypeRegistry::new();
        types.register_entity("Monster", || InertBehavior).unwrap();
        assert!(matches!(
            types.register_persistent("Monster", || InertBehavior),
            Err(WorldError::Misuse(_))
        ));
    }

    #[test]
    fn flags_and_fallbacks() {
        let mut types = TypeRegistry::new();
        types.register_service("OnlineService", || InertBehavior).unwrap();
        assert!(types.is_service("OnlineService"));
        assert!(!types.is_service("Nope"));
        assert_eq!(types.flags(SPACE_TYPE), TypeFlags::SPACE);
        assert!(types.instantiate(SPACE_TYPE).is_ok());
        assert!(matches!(
            types.instantiate("Nope"),
            Err(WorldError::NotFound(_))
        ));
        assert_eq!(types.services().collect::<Vec<_>>(), vec!["OnlineService"]);
    }

    #[test]
    fn context_buffers_commands_in_order() {
        let id = EntityId::nil_space(GameId(1));
        let mut attrs = Attrs::new();
        let mut commands = Vec::new();
        let mut ctx = EntityContext {
            id,
            type_name: "Avatar",
            game: GameId(1),
            position: Vec3::ZERO,
            space: None,
            attrs: &mut attrs,
            commands: &mut commands,
        };
        ctx.call(id, "A", vec![]);
        ctx.destroy();
        assert_eq!(commands.len(), 2);
        assert!(matches!(commands[1], Command::Destroy { .. }));
    }
}
