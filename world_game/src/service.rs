//! Cluster-wide singleton services.
//!
//! A service is addressed by its type name. Each name has a location authority
//! (hash of the name over the games) which creates the singleton on the first
//! query and answers every later one with the same ID. Games cache the mapping
//! and keep it fresh from `ServiceRegistered` / `ServiceReleased` broadcasts.
//! Calls issued while the name is unresolved wait here.

use std::collections::HashMap;

use tracing::{debug, info, warn};
use world_shared::net::Frame;
use world_shared::prelude::*;

use crate::dispatcher::PendingCall;
use crate::game::Game;

/// How many IDs the authority mints looking for one it is also the location
/// authority of.
const OWNED_ID_ATTEMPTS: usize = 1024;

#[derive(Debug, Default)]
pub struct ServiceRegistry {
    cache: HashMap<String, EntityId>,
    waiting: HashMap<String, Vec<PendingCall>>,
    /// Names this game is the authority of.
    owned: HashMap<String, EntityId>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cached(&self, name: &str) -> Option<EntityId> {
        self.cache.get(name).copied()
    }

    pub fn waiting(&self, name: &str) -> usize {
        self.waiting.get(name).map_or(0, Vec::len)
    }
}

impl Game {
    /// Calls `method` on the singleton backing service `name`, creating it on
    /// first use. A name that is not a registered service is a configuration
    /// error.
    pub fn call_service(&mut self, name: &str, method: &str, args: Vec<Value>) -> WorldResult<()> {
        if !self.types.is_service(name) {
            return Err(WorldError::FatalMisconfiguration(format!(
                "{name} is not a registered service"
            )));
        }
        if let Some(id) = self.services.cached(name) {
            self.call(id, method, args);
            return Ok(());
        }
        let queue = self.services.waiting.entry(name.to_string()).or_default();
        let first = queue.is_empty();
        queue.push(PendingCall {
            method: method.to_string(),
            args,
            hops: 0,
        });
        if first {
            let authority = self.dispatcher.authority_of_name(name);
            let requester = self.id();
            debug!(game = %requester, service = name, %authority, "Resolving service");
            self.send(
                authority,
                Frame::ServiceQuery {
                    name: name.to_string(),
                    requester,
                },
            );
        }
        Ok(())
    }

    /// Cached ID of service `name`, if resolved on this game.
    pub fn service_entity_id(&self, name: &str) -> Option<EntityId> {
        self.services.cached(name)
    }

    /// Authority side: answer with the singleton, creating it if needed.
    pub(crate) fn handle_service_query(&mut self, name: String, requester: GameId) {
        if !self.types.is_service(&name) {
            warn!(game = %self.id(), service = %name, %requester, "Query for unknown service ignored");
            return;
        }
        if let Some(id) = self.services.owned.get(&name).copied() {
            self.send(requester, Frame::ServiceRegistered { name, id });
            return;
        }
        let id = self.mint_owned_id();
        let target = self.choose_game();
        self.services.owned.insert(name.clone(), id);
        info!(game = %self.id(), service = %name, entity = %id, %target, "Creating service");
        self.place_entity(id, &name, Attrs::new(), target);
        self.broadcast(Frame::ServiceRegistered { name, id });
    }

    /// Mints an ID this game is the location authority of, so the placement is
    /// reserved before any other game can learn the ID.
    fn mint_owned_id(&mut self) -> EntityId {
        let me = self.id();
        let mut id = self.ids.mint();
        for _ in 1..OWNED_ID_ATTEMPTS {
            if self.dispatcher.authority_of(id) == me {
                break;
            }
            id = self.ids.mint();
        }
        id
    }

    pub(crate) fn handle_service_registered(&mut self, name: String, id: EntityId) {
        let previous = self.services.cache.insert(name.clone(), id);
        if previous.is_some_and(|p| p != id) {
            debug!(game = %self.id(), service = %name, entity = %id, "Service moved");
        }
        if let Some(calls) = self.services.waiting.remove(&name) {
            for call in calls {
                self.route_call(id, call);
            }
        }
    }

    pub(crate) fn handle_service_released(&mut self, name: String, id: EntityId) {
        let me = self.id();
        if self.dispatcher.authority_of_name(&name) == me
            && self.services.owned.get(&name) == Some(&id)
        {
            self.services.owned.remove(&name);
            info!(game = %me, service = %name, entity = %id, "Service released");
            for game in self.dispatcher.live_games() {
                if game != me {
                    self.dispatcher.send(
                        game,
                        Frame::ServiceReleased {
                            name: name.clone(),
                            id,
                        },
                    );
                }
            }
        }
        if self.services.cache.get(&name) == Some(&id) {
            self.services.cache.remove(&name);
        }
    }
}
