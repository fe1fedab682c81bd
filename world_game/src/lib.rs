//! `world_game`
//!
//! Game-process systems:
//! - Entity registry and type registry
//! - Spaces with grid-based area of interest
//! - Call dispatch through per-ID location authorities
//! - Cross-game migration with rollback
//! - Cluster-wide singleton services
//! - A cooperative loop per game, plus an in-process cluster harness
//!
//! Execution model:
//! - One loop owns one `Game`; nothing in it is shared across threads.
//! - Behaviors queue side effects as commands, run once they return.
//! - Storage and KVDB run on tokio tasks and resume the loop by posting.

pub mod aoi;
pub mod behavior;
pub mod cluster;
pub mod dispatcher;
pub mod entity;
pub mod game;
pub mod game_loop;
pub mod migration;
pub mod placement;
pub mod scheduler;
pub mod service;
pub mod space;

pub use behavior::{EntityBehavior, EntityContext, TypeFlags, TypeRegistry};
pub use cluster::LocalCluster;
pub use game::{Collaborators, Game};
pub use game_loop::GameLoop;
