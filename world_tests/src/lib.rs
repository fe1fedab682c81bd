//! Shared fixtures for the multi-game integration tests.
//!
//! [`Npc`] is a behavior that counts everything that happens to it in its
//! own attributes, so tests can assert on hooks and calls by reading the
//! entity back from whichever game hosts it.

use anyhow::bail;
use tracing_subscriber::EnvFilter;
use world_game::{EntityBehavior, EntityContext, Game, LocalCluster, TypeRegistry};
use world_shared::prelude::*;

/// Plain, non-persistent entity type.
pub const NPC: &str = "Npc";
/// Persistent entity type.
pub const HERO: &str = "Hero";
/// Service type.
pub const LEDGER: &str = "Ledger";

/// Installs a test-writer subscriber once per test binary. `RUST_LOG` wins
/// over the default `warn`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

fn bump(attrs: &mut Attrs, key: &str) {
    let n = attrs.get(key).and_then(Value::as_int).unwrap_or(0);
    attrs.insert(key.to_string(), Value::Int(n + 1));
}

/// Counts calls (`calls.<Method>`) and hooks (`aoi.enter`, `migrate.in`, ...)
/// in its attributes.
///
/// Methods:
/// - `Ping`: no-op
/// - `Fail`: returns an error
/// - `Relay(target, method)`: calls `method` on `target`
/// - `Enter(space, x, z)`: enters `space`
/// - `Travel(game)`: migrates to the nil space of `game`
/// - `Ask(service)`: pings a service
/// - `Destroy`: destroys itself
#[derive(Debug, Default)]
pub struct Npc;

impl EntityBehavior for Npc {
    fn on_init(&mut self, ctx: &mut EntityContext<'_>) {
        bump(ctx.attrs, "inits");
    }

    fn on_call(&mut self, ctx: &mut EntityContext<'_>, method: &str, args: &[Value]) -> anyhow::Result<()> {
        bump(ctx.attrs, &format!("calls.{method}"));
        match method {
            "Ping" => {}
            "Fail" => bail!("npc {} asked to fail", ctx.id),
            "Relay" => {
                let target = args.entity(0)?;
                let method = args.str(1)?.to_string();
                ctx.call(target, &method, vec![]);
            }
            "Enter" => {
                let space = args.entity(0)?;
                let position = Vec3::new(args.float(1)? as f32, 0.0, args.float(2)? as f32);
                ctx.enter_space(space, position);
            }
            "Travel" => {
                let game = u16::try_from(args.int(0)?)?;
                ctx.migrate_to_game(GameId(game));
            }
            "Ask" => {
                let service = args.str(0)?.to_string();
                ctx.call_service(&service, "Ping", vec![]);
            }
            "Destroy" => ctx.destroy(),
            other => bail!("Npc has no method {other}"),
        }
        Ok(())
    }

    fn on_enter_space(&mut self, ctx: &mut EntityContext<'_>, _space: EntityId) {
        bump(ctx.attrs, "space.enter");
    }

    fn on_enter_aoi(&mut self, ctx: &mut EntityContext<'_>, _other: EntityId) {
        bump(ctx.attrs, "aoi.enter");
    }

    fn on_leave_aoi(&mut self, ctx: &mut EntityContext<'_>, _other: EntityId) {
        bump(ctx.attrs, "aoi.leave");
    }

    fn on_migrate_out(&mut self, ctx: &mut EntityContext<'_>) {
        bump(ctx.attrs, "migrate.out");
    }

    fn on_migrate_in(&mut self, ctx: &mut EntityContext<'_>) {
        bump(ctx.attrs, "migrate.in");
    }

    fn on_migrate_failed(&mut self, ctx: &mut EntityContext<'_>, _reason: &WorldError) {
        bump(ctx.attrs, "migrate.failed");
    }

    fn on_destroy(&mut self, ctx: &mut EntityContext<'_>) {
        ctx.attrs.insert("destroyed".into(), Value::Bool(true));
    }
}

/// `Npc` as an entity, a persistent entity, a service and the space behavior.
pub fn npc_types() -> anyhow::Result<TypeRegistry> {
    let mut types = TypeRegistry::new();
    types.register_entity(NPC, Npc::default)?;
    types.register_persistent(HERO, Npc::default)?;
    types.register_service(LEDGER, Npc::default)?;
    types.register_space(Npc::default)?;
    Ok(types)
}

/// A cluster of `games` games running [`npc_types`].
pub fn cluster(games: u16) -> anyhow::Result<LocalCluster> {
    cluster_with(games, |_| {})
}

/// Like [`cluster`], with every game's config adjusted by `tweak`. Event
/// publishing is on unless `tweak` turns it off.
pub fn cluster_with(games: u16, tweak: impl Fn(&mut GameConfig)) -> anyhow::Result<LocalCluster> {
    init_tracing();
    LocalCluster::with_config(games, npc_types()?, |cfg| {
        cfg.publish_events = true;
        tweak(cfg);
    })
}

/// Integer attribute `key` of `id` on `game`, 0 when absent.
pub fn counter(game: &Game, id: EntityId, key: &str) -> i64 {
    game.entity(id)
        .and_then(|e| e.attrs().get(key))
        .and_then(Value::as_int)
        .unwrap_or(0)
}

/// Calls of `method` received by `id` on `game`.
pub fn calls(game: &Game, id: EntityId, method: &str) -> i64 {
    counter(game, id, &format!("calls.{method}"))
}

/// Every game holding a copy of `id`, active or not.
pub fn holders(cluster: &LocalCluster, id: EntityId) -> Vec<GameId> {
    cluster
        .game_ids()
        .into_iter()
        .filter(|g| cluster.game(*g).is_ok_and(|game| game.entity(id).is_some()))
        .collect()
}

/// Entities of `type_name` across the whole cluster.
pub fn count_of_type(cluster: &LocalCluster, type_name: &str) -> usize {
    cluster
        .game_ids()
        .into_iter()
        .filter_map(|g| cluster.game(g).ok())
        .map(|game| game.entities().filter(|e| e.type_name() == type_name).count())
        .sum()
}
