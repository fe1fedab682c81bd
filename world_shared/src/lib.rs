//! `world_shared`
//!
//! Primitives shared by every game process.
//!
//! Design goals:
//! - IDs minted without coordination.
//! - One tagged value type for arguments and attributes, checked at the wire.
//! - Collaborators (messaging, storage, KVDB) behind traits, with in-memory
//!   implementations for local clusters and tests.
//! - No `unsafe`.

pub mod config;
pub mod error;
pub mod event;
pub mod id;
pub mod kvdb;
pub mod math;
pub mod net;
pub mod storage;
pub mod value;

pub mod prelude {
    //! Commonly used exports.

    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::event::*;
    pub use crate::id::*;
    pub use crate::math::*;
    pub use crate::value::*;
}
