//! The cooperative loop driving one game.
//!
//! Each turn drains the network inbox, then the posted continuations, then
//! the due timers. Between turns the loop sleeps until one of those has work
//! or shutdown is requested.

use std::sync::Arc;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::info;
use world_shared::prelude::*;

use crate::behavior::TypeRegistry;
use crate::game::{Collaborators, Game, Post};

pub struct GameLoop {
    game: Game,
    inbox: mpsc::UnboundedReceiver<Bytes>,
    posts: mpsc::UnboundedReceiver<Post>,
}

impl GameLoop {
    /// Builds the game. Must run inside a tokio runtime.
    pub fn new(
        cfg: GameConfig,
        types: Arc<TypeRegistry>,
        collab: Collaborators,
        inbox: mpsc::UnboundedReceiver<Bytes>,
    ) -> WorldResult<Self> {
        let (post_tx, posts) = mpsc::unbounded_channel();
        let game = Game::new(cfg, types, collab, post_tx)?;
        Ok(Self { game, inbox, posts })
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn game_mut(&mut self) -> &mut Game {
        &mut self.game
    }

    /// Processes everything ready right now. Returns the number of packets,
    /// posts and timers handled.
    pub fn turn(&mut self) -> usize {
        let mut work = 0;
        while let Ok(packet) = self.inbox.try_recv() {
            self.game.handle_packet(&packet);
            work += 1;
        }
        // Posts made by this batch wait for the next turn.
        let batch: Vec<Post> = std::iter::from_fn(|| self.posts.try_recv().ok()).collect();
        for post in batch {
            self.game.run_callback("post", post);
            work += 1;
        }
        work + self.game.run_due_timers()
    }

    /// Runs until `shutdown` turns true or its sender is dropped, then saves
    /// persistent entities and hands the game back.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<Game> {
        info!(game = %self.game.id(), "Loop running");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.turn();
            let deadline = self.game.next_timer_deadline();
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                Some(packet) = self.inbox.recv() => self.game.handle_packet(&packet),
                Some(post) = self.posts.recv() => self.game.run_callback("post", post),
                _ = sleep_until_opt(deadline) => {}
            }
        }
        self.game.shutdown().await;
        Ok(self.game)
    }

    /// Spawns [`GameLoop::run`] on the current runtime.
    pub fn spawn(
        self,
        shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<anyhow::Result<Game>> {
        tokio::spawn(async move { self.run(shutdown).await.context("game loop") })
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
