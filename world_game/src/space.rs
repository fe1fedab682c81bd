//! Spaces and their membership.
//!
//! A space is an entity with a `kind`. Kind 0 is the per-game nil space:
//! created by the game itself, unordered membership, no AOI. Every other space
//! indexes its members in an [`AoiGrid`].
//!
//! Spaces and entities refer to each other by ID only; the game's registry and
//! this manager are the arenas.

use std::collections::{HashMap, HashSet};

use world_shared::prelude::*;

use crate::aoi::{AoiEvent, AoiGrid};

/// Reserved kind of the nil space.
pub const NIL_SPACE_KIND: i64 = 0;

/// One space and its members.
#[derive(Debug)]
pub struct Space {
    id: EntityId,
    kind: i64,
    members: HashSet<EntityId>,
    aoi: Option<AoiGrid>,
}

impl Space {
    pub fn id(&self) -> EntityId {
        self.id
    }

    pub fn kind(&self) -> i64 {
        self.kind
    }

    pub fn is_nil(&self) -> bool {
        self.kind == NIL_SPACE_KIND
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.members.contains(&id)
    }

    pub fn members(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.members.iter().copied()
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn aoi_radius(&self) -> Option<f32> {
        self.aoi.as_ref().map(AoiGrid::radius)
    }

    /// Entities currently visible to `id`; empty in the nil space.
    pub fn interested_in(&self, id: EntityId) -> Vec<EntityId> {
        let mut v: Vec<EntityId> = self
            .aoi
            .as_ref()
            .and_then(|g| g.neighbors(id))
            .map(|n| n.iter().copied().collect())
            .unwrap_or_default();
        v.sort();
        v
    }
}

/// All spaces hosted by one game.
#[derive(Debug)]
pub struct SpaceManager {
    nil: EntityId,
    default_radius: f32,
    spaces: HashMap<EntityId, Space>,
}

impl SpaceManager {
    /// Creates the manager with the game's nil space already in place.
    pub fn new(game: GameId, default_radius: f32) -> Self {
        let nil = EntityId::nil_space(game);
        let mut spaces = HashMap::new();
        spaces.insert(
            nil,
            Space {
                id: nil,
                kind: NIL_SPACE_KIND,
                members: HashSet::new(),
                aoi: None,
            },
        );
        Self {
            nil,
            default_radius,
            spaces,
        }
    }

    pub fn nil_space_id(&self) -> EntityId {
        self.nil
    }

    pub fn get(&self, id: EntityId) -> Option<&Space> {
        self.spaces.get(&id)
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.spaces.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spaces.is_empty()
    }

    /// Registers space `id`. Kind 0 is reserved for the nil space.
    pub fn create(&mut self, id: EntityId, kind: i64) -> WorldResult<()> {
        if kind == NIL_SPACE_KIND {
            return Err(WorldError::misuse(
                "cannot create a space with kind 0; every game owns exactly one nil space",
            ));
        }
        if self.spaces.contains_key(&id) {
            return Err(WorldError::misuse(format!("space {id} already exists")));
        }
        self.spaces.insert(
            id,
            Space {
                id,
                kind,
                members: HashSet::new(),
                aoi: Some(AoiGrid::new(id, self.default_radius)),
            },
        );
        Ok(())
    }

    /// Replaces the interest radius of an empty, non-nil space.
    pub fn enable_aoi(&mut self, id: EntityId, radius: f32) -> WorldResult<()> {
        if !(radius > 0.0 && radius.is_finite()) {
            return Err(WorldError::misuse(format!("invalid AOI radius {radius}")));
        }
        let space = self
            .spaces
            .get_mut(&id)
            .ok_or_else(|| WorldError::not_found(format!("space {id}")))?;
        if space.is_nil() {
            return Err(WorldError::misuse("nil space has no AOI"));
        }
        if !space.members.is_empty() {
            return Err(WorldError::misuse(format!(
                "space {id} must be empty to change its AOI radius"
            )));
        }
        space.aoi = Some(AoiGrid::new(id, radius));
        Ok(())
    }

    /// Removes a space, returning its remaining members.
    ///
    /// The nil space cannot be removed.
    pub fn remove(&mut self, id: EntityId) -> WorldResult<Vec<EntityId>> {
        if id == self.nil {
            return Err(WorldError::misuse("the nil space is never destroyed"));
        }
        let space = self
            .spaces
            .remove(&id)
            .ok_or_else(|| WorldError::not_found(format!("space {id}")))?;
        let mut members: Vec<EntityId> = space.members.into_iter().collect();
        members.sort();
        Ok(members)
    }

    /// Moves `entity` from `prior` (if any) into `space` at `position`.
    pub fn enter(
        &mut self,
        prior: Option<EntityId>,
        space: EntityId,
        entity: EntityId,
        position: Vec3,
        out: &mut Vec<AoiEvent>,
    ) -> WorldResult<()> {
        if !self.spaces.contains_key(&space) {
            return Err(WorldError::not_found(format!("space {space}")));
        }
        if let Some(prior) = prior.filter(|p| *p != space) {
            self.leave(prior, entity, out);
        }
        if let Some(target) = self.spaces.get_mut(&space) {
            target.members.insert(entity);
            if let Some(grid) = target.aoi.as_mut() {
                grid.insert(entity, position, out);
            }
        }
        Ok(())
    }

    /// Drops `entity` from `space`, emitting leave events to its neighbors.
    pub fn leave(&mut self, space: EntityId, entity: EntityId, out: &mut Vec<AoiEvent>) {
        if let Some(s) = self.spaces.get_mut(&space) {
            s.members.remove(&entity);
            if let Some(grid) = s.aoi.as_mut() {
                grid.remove(entity, out);
            }
        }
    }

    /// Updates the position of a member. No-op in the nil space.
    pub fn move_entity(
        &mut self,
        space: EntityId,
        entity: EntityId,
        position: Vec3,
        out: &mut Vec<AoiEvent>,
    ) {
        if let Some(grid) = self.spaces.get_mut(&space).and_then(|s| s.aoi.as_mut()) {
            grid.update(entity, position, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aoi::InterestChange;

    #[test]
    fn kind_zero_cannot_be_created() {
        let mut mgr = SpaceManager::new(GameId(1), 10.0);
        let id = IdAllocator::new(GameId(1)).mint();
        assert!(matches!(mgr.create(id, 0), Err(WorldError::Misuse(_))));
        assert!(mgr.create(id, 3).is_ok());
        assert_eq!(mgr.get(id).unwrap().kind(), 3);
    }

    #[test]
    fn nil_space_ignores_positions() {
        let mut mgr = SpaceManager::new(GameId(1), 10.0);
        let mut alloc = IdAllocator::new(GameId(1));
        let (a, b) = (alloc.mint(), alloc.mint());
        let nil = mgr.nil_space_id();
        let mut ev = Vec::new();
        mgr.enter(None, nil, a, Vec3::ZERO, &mut ev).unwrap();
        mgr.enter(None, nil, b, Vec3::ZERO, &mut ev).unwrap();
        assert!(ev.is_empty());
        assert_eq!(mgr.get(nil).unwrap().member_count(), 2);
        assert!(mgr.get(nil).unwrap().interested_in(a).is_empty());
        assert!(mgr.remove(nil).is_err());
    }

    #[test]
    fn enter_leaves_prior_space_first() {
        let mut mgr = SpaceManager::new(GameId(1), 10.0);
        let mut alloc = IdAllocator::new(GameId(1));
        let (s1, s2, a, b) = (alloc.mint(), alloc.mint(), alloc.mint(), alloc.mint());
        mgr.create(s1, 1).unwrap();
        mgr.create(s2, 1).unwrap();
        let mut ev = Vec::new();
        mgr.enter(None, s1, a, Vec3::ZERO, &mut ev).unwrap();
        mgr.enter(None, s1, b, Vec3::ZERO, &mut ev).unwrap();
        ev.clear();

        mgr.enter(Some(s1), s2, a, Vec3::ZERO, &mut ev).unwrap();
        assert!(!mgr.get(s1).unwrap().contains(a));
        assert!(mgr.get(s2).unwrap().contains(a));
        assert_eq!(
            ev.iter().filter(|e| e.change == InterestChange::Leave).count(),
            2
        );
        assert!(mgr.get(s1).unwrap().interested_in(b).is_empty());
    }

    #[test]
    fn aoi_radius_only_changes_when_empty() {
        let mut mgr = SpaceManager::new(GameId(1), 10.0);
        let mut alloc = IdAllocator::new(GameId(1));
        let (s, a) = (alloc.mint(), alloc.mint());
        mgr.create(s, 2).unwrap();
        mgr.enable_aoi(s, 25.0).unwrap();
        assert_eq!(mgr.get(s).unwrap().aoi_radius(), Some(25.0));
        mgr.enter(None, s, a, Vec3::ZERO, &mut Vec::new()).unwrap();
        assert!(mgr.enable_aoi(s, 5.0).is_err());
        assert!(mgr.enable_aoi(mgr.nil_space_id(), 5.0).is_err());
    }
}
