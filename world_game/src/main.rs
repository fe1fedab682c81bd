//! Local cluster demo.
//!
//! Usage:
//!   cargo run -p world_game -- [--games 2] [--avatars 8] [--seconds 10] [--config game.json]
//!
//! Starts `--games` games in one process, creates an arena space, and sends
//! avatars walking in circles through it. Interest changes are logged as they
//! happen. Halfway through, every avatar migrates to game 2's nil space when
//! there is more than one game. `--config` is a JSON `GameConfig` used as the
//! template for every game (its `game_id` and `games` are overridden).

use std::env;
use std::f32::consts::TAU;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{debug, info};
use world_game::aoi::{AoiEvent, InterestChange};
use world_game::{EntityBehavior, EntityContext, LocalCluster, TypeRegistry};
use world_shared::prelude::*;

struct DemoArgs {
    games: u16,
    avatars: usize,
    seconds: u64,
    config: Option<GameConfig>,
}

fn parse_args() -> anyhow::Result<DemoArgs> {
    let mut out = DemoArgs {
        games: 2,
        avatars: 8,
        seconds: 10,
        config: None,
    };
    let args: Vec<String> = env::args().collect();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--games" if i + 1 < args.len() => {
                out.games = args[i + 1].parse().unwrap_or(2);
                i += 2;
            }
            "--avatars" if i + 1 < args.len() => {
                out.avatars = args[i + 1].parse().unwrap_or(8);
                i += 2;
            }
            "--seconds" if i + 1 < args.len() => {
                out.seconds = args[i + 1].parse().unwrap_or(10);
                i += 2;
            }
            "--config" if i + 1 < args.len() => {
                let text = std::fs::read_to_string(&args[i + 1])
                    .with_context(|| format!("read {}", args[i + 1]))?;
                out.config = Some(GameConfig::from_json_str(&text).context("parse config")?);
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(out)
}

/// Walks in a circle around the arena center, one step per tick.
#[derive(Default)]
struct Avatar {
    angle: f32,
}

const STEP: Duration = Duration::from_millis(100);

impl EntityBehavior for Avatar {
    fn on_call(&mut self, ctx: &mut EntityContext<'_>, method: &str, args: &[Value]) -> anyhow::Result<()> {
        match method {
            "Join" => {
                let arena = args.entity(0)?;
                let radius = args.float(1)? as f32;
                self.angle = args.float(2)? as f32;
                ctx.attrs.insert("radius".into(), Value::Float(f64::from(radius)));
                ctx.enter_space(arena, self.position(radius));
                ctx.call_later(STEP, "Step", vec![]);
            }
            "Step" => {
                let radius = ctx.attrs.get("radius").and_then(Value::as_float).unwrap_or(50.0) as f32;
                self.angle = (self.angle + 0.1) % TAU;
                ctx.move_to(self.position(radius));
                ctx.call_later(STEP, "Step", vec![]);
            }
            "Travel" => {
                let game = args.int(0)?;
                let game = u16::try_from(game).context("game id out of range")?;
                ctx.migrate_to_game(GameId(game));
            }
            other => anyhow::bail!("Avatar has no method {other}"),
        }
        Ok(())
    }

    fn on_enter_aoi(&mut self, ctx: &mut EntityContext<'_>, other: EntityId) {
        let seen = ctx.attrs.get("seen").and_then(Value::as_int).unwrap_or(0);
        ctx.attrs.insert("seen".into(), Value::Int(seen + 1));
        debug!(entity = %ctx.id, %other, "Avatar sees neighbor");
    }

    fn on_migrate_in(&mut self, ctx: &mut EntityContext<'_>) {
        info!(entity = %ctx.id, game = %ctx.game, "Avatar arrived");
    }
}

impl Avatar {
    fn position(&self, radius: f32) -> Vec3 {
        Vec3::new(radius * self.angle.cos(), 0.0, radius * self.angle.sin())
    }
}

fn demo_types() -> anyhow::Result<TypeRegistry> {
    let mut types = TypeRegistry::new();
    types.register_entity("Avatar", Avatar::default)?;
    Ok(types)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    info!(games = args.games, avatars = args.avatars, seconds = args.seconds, "Starting local cluster");

    let template = args.config.clone();
    let mut cluster = LocalCluster::with_config(args.games, demo_types()?, move |cfg| {
        if let Some(t) = &template {
            let (game_id, games) = (cfg.game_id, cfg.games.clone());
            *cfg = GameConfig {
                game_id,
                games,
                ..t.clone()
            };
        }
        cfg.publish_events = true;
    })?;

    // Interest events are drained once per second so the bus stays small.
    let enters = Arc::new(AtomicUsize::new(0));
    for id in cluster.game_ids() {
        let enters = enters.clone();
        cluster.game_mut(id)?.add_timer(Duration::from_secs(1), move |g| {
            let n = g
                .drain_events::<AoiEvent>()
                .iter()
                .filter(|e| e.change == InterestChange::Enter)
                .count();
            enters.fetch_add(n, Ordering::Relaxed);
            debug!(game = %g.id(), enters = n, "Interest events drained");
            Ok(())
        });
    }

    let first = GameId(1);
    let game = cluster.game_mut(first)?;
    let arena = game.create_space_locally(1)?;
    game.enable_aoi(arena, 30.0)?;
    let mut avatars = Vec::with_capacity(args.avatars);
    for n in 0..args.avatars {
        let avatar = game.create_entity_locally("Avatar")?;
        let radius = 20.0 + 10.0 * (n % 4) as f64;
        let angle = n as f64 * 0.7;
        game.call(avatar, "Join", vec![arena.into(), radius.into(), angle.into()]);
        avatars.push(avatar);
    }
    if args.games > 1 {
        game.add_callback(Duration::from_secs(args.seconds) / 2, move |g| {
            info!(count = avatars.len(), "Sending avatars to game2");
            for avatar in &avatars {
                g.call(*avatar, "Travel", vec![Value::Int(2)]);
            }
            Ok(())
        });
    }
    info!(%arena, "Arena ready");

    let (stop_tx, stop_rx) = watch::channel(false);
    let loops = cluster.into_loops();
    let mut handles = Vec::new();
    for game_loop in loops {
        handles.push(game_loop.spawn(stop_rx.clone()));
    }

    tokio::time::sleep(Duration::from_secs(args.seconds)).await;
    let _ = stop_tx.send(true);

    for handle in handles {
        let mut game = handle.await.context("join game loop")??;
        let rest = game
            .drain_events::<AoiEvent>()
            .iter()
            .filter(|e| e.change == InterestChange::Enter)
            .count();
        enters.fetch_add(rest, Ordering::Relaxed);
        info!(game = %game.id(), entities = game.entity_count(), "Final state");
    }
    info!(enters = enters.load(Ordering::Relaxed), "Demo finished");
    Ok(())
}
