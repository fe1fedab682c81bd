//! In-process cluster of games for demos and tests.
//!
//! All games share one [`LocalNetwork`], one storage and one KVDB backend.
//! The cluster does not spawn the loops; callers drive them with [`LocalCluster::turn`]
//! and [`LocalCluster::settle`], or take them out with [`LocalCluster::into_loops`].

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::warn;
use world_shared::kvdb::{KvdbClient, MemoryKvdb};
use world_shared::net::LocalNetwork;
use world_shared::prelude::*;
use world_shared::storage::MemoryStorage;

use crate::behavior::TypeRegistry;
use crate::game::{Collaborators, Game};
use crate::game_loop::GameLoop;

/// Consecutive idle rounds after which the cluster counts as settled.
const IDLE_ROUNDS: usize = 16;

/// Upper bound on settle rounds, so a chatty behavior cannot hang a test.
const MAX_SETTLE_ROUNDS: usize = 10_000;

pub struct LocalCluster {
    network: LocalNetwork,
    storage: Arc<MemoryStorage>,
    kvdb: Arc<MemoryKvdb>,
    loops: BTreeMap<GameId, GameLoop>,
    frozen: HashSet<GameId>,
}

impl LocalCluster {
    /// Starts games `1..=games` with default configuration.
    ///
    /// Must run inside a tokio runtime.
    pub fn start(games: u16, types: TypeRegistry) -> anyhow::Result<Self> {
        Self::with_config(games, types, |_| {})
    }

    /// Starts games `1..=games`, letting `tweak` adjust each game's config.
    pub fn with_config(
        games: u16,
        types: TypeRegistry,
        tweak: impl Fn(&mut GameConfig),
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(games > 0, "a cluster needs at least one game");
        let ids: Vec<GameId> = (1..=games).map(GameId).collect();
        let types = Arc::new(types);
        let network = LocalNetwork::new();
        let storage = Arc::new(MemoryStorage::new());
        let kvdb = Arc::new(MemoryKvdb::new());

        let mut loops = BTreeMap::new();
        for id in &ids {
            let mut cfg = GameConfig::for_cluster(*id, ids.clone());
            tweak(&mut cfg);
            let collab = Collaborators {
                messenger: Arc::new(network.clone()),
                storage: storage.clone(),
                kvdb: KvdbClient::start(kvdb.clone(), cfg.storage_timeout()),
            };
            let inbox = network.join(*id);
            let game_loop = GameLoop::new(cfg, types.clone(), collab, inbox)
                .with_context(|| format!("start {id}"))?;
            loops.insert(*id, game_loop);
        }
        Ok(Self {
            network,
            storage,
            kvdb,
            loops,
            frozen: HashSet::new(),
        })
    }

    pub fn game_ids(&self) -> Vec<GameId> {
        self.loops.keys().copied().collect()
    }

    pub fn game(&self, id: GameId) -> anyhow::Result<&Game> {
        self.loops
            .get(&id)
            .map(GameLoop::game)
            .with_context(|| format!("no such game {id}"))
    }

    pub fn game_mut(&mut self, id: GameId) -> anyhow::Result<&mut Game> {
        self.loops
            .get_mut(&id)
            .map(GameLoop::game_mut)
            .with_context(|| format!("no such game {id}"))
    }

    /// Game currently hosting `id`, if any.
    pub fn owner_of(&self, id: EntityId) -> Option<GameId> {
        self.loops
            .iter()
            .find(|(_, l)| l.game().entity(id).is_some_and(|e| e.is_active()))
            .map(|(g, _)| *g)
    }

    pub fn storage(&self) -> &Arc<MemoryStorage> {
        &self.storage
    }

    pub fn kvdb(&self) -> &Arc<MemoryKvdb> {
        &self.kvdb
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    /// Stops `id` from processing anything until [`LocalCluster::thaw`].
    /// Frames sent to it queue up meanwhile.
    pub fn freeze(&mut self, id: GameId) {
        self.frozen.insert(id);
    }

    pub fn thaw(&mut self, id: GameId) {
        self.frozen.remove(&id);
    }

    /// One turn on every unfrozen game.
    pub fn turn(&mut self) -> usize {
        self.loops
            .iter_mut()
            .filter(|(id, _)| !self.frozen.contains(*id))
            .map(|(_, l)| l.turn())
            .sum()
    }

    /// Turns every game, yielding to spawned io tasks in between, until
    /// nothing happens for a few rounds.
    pub async fn settle(&mut self) {
        let mut idle = 0;
        for _ in 0..MAX_SETTLE_ROUNDS {
            if self.turn() == 0 {
                idle += 1;
                if idle >= IDLE_ROUNDS {
                    return;
                }
            } else {
                idle = 0;
            }
            tokio::task::yield_now().await;
        }
        warn!(rounds = MAX_SETTLE_ROUNDS, "Cluster did not settle");
    }

    /// Advances the paused tokio clock by `by` and settles. Needs a runtime
    /// with a paused clock.
    pub async fn advance(&mut self, by: Duration) {
        tokio::time::advance(by).await;
        self.settle().await;
    }

    /// Hands out the loops, e.g. to spawn them on the runtime.
    pub fn into_loops(self) -> Vec<GameLoop> {
        self.loops.into_values().collect()
    }
}
