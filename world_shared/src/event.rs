//! Typed event bus.
//!
//! Games publish observable outcomes here (interest changes, migration results,
//! load outcomes). Observers such as tools, demos and tests drain them per type.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
};

/// Typed event bus.
#[derive(Default)]
pub struct EventBus {
    queues: HashMap<TypeId, Box<dyn Any + Send>>,
}

impl EventBus {
    /// Pushes an event into the queue.
    pub fn push<E: 'static + Send>(&mut self, e: E) {
        let q = self
            .queues
            .entry(TypeId::of::<E>())
            .or_insert_with(|| Box::new(Vec::<E>::new()));
        let q = q
            .downcast_mut::<Vec<E>>()
            .expect("event queue keyed by its own TypeId");
        q.push(e);
    }

    /// Drains all queued events of a type.
    pub fn drain<E: 'static + Send>(&mut self) -> Vec<E> {
        self.queues
            .remove(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast::<Vec<E>>().ok())
            .map(|boxed| *boxed)
            .unwrap_or_default()
    }

    /// Number of queued events of a type.
    pub fn pending<E: 'static + Send>(&self) -> usize {
        self.queues
            .get(&TypeId::of::<E>())
            .and_then(|boxed| boxed.downcast_ref::<Vec<E>>())
            .map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Ping(u32);

    #[test]
    fn drains_per_type() {
        let mut bus = EventBus::default();
        bus.push(Ping(1));
        bus.push(Ping(2));
        bus.push("other");
        assert_eq!(bus.pending::<Ping>(), 2);
        assert_eq!(bus.drain::<Ping>(), vec![Ping(1), Ping(2)]);
        assert!(bus.drain::<Ping>().is_empty());
        assert_eq!(bus.drain::<&str>(), vec!["other"]);
    }
}
