//! Grid-based area-of-interest index.
//!
//! Cells are squares whose side equals the interest radius, keyed by the X/Z
//! cell coordinates, so every entity within the radius of a point lies in the
//! 3×3 block of cells around it. Each node keeps its current neighbor set;
//! inserts, moves and removals diff the new set against the old one and
//! report only the pairs whose visibility changed, once per side.

use std::collections::{HashMap, HashSet};

use world_shared::prelude::*;

/// Direction of an interest change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterestChange {
    Enter,
    Leave,
}

/// `observer` gained or lost sight of `subject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AoiEvent {
    pub space: EntityId,
    pub observer: EntityId,
    pub subject: EntityId,
    pub change: InterestChange,
}

type Cell = (i32, i32);

#[derive(Debug)]
struct AoiNode {
    position: Vec3,
    cell: Cell,
    neighbors: HashSet<EntityId>,
}

/// Interest index of one space.
#[derive(Debug)]
pub struct AoiGrid {
    space: EntityId,
    radius: f32,
    cells: HashMap<Cell, HashSet<EntityId>>,
    nodes: HashMap<EntityId, AoiNode>,
}

impl AoiGrid {
    pub fn new(space: EntityId, radius: f32) -> Self {
        Self {
            space,
            radius,
            cells: HashMap::new(),
            nodes: HashMap::new(),
        }
    }

    pub fn radius(&self) -> f32 {
        self.radius
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: EntityId) -> bool {
        self.nodes.contains_key(&id)
    }

    pub fn neighbors(&self, id: EntityId) -> Option<&HashSet<EntityId>> {
        self.nodes.get(&id).map(|n| &n.neighbors)
    }

    fn cell_of(&self, p: Vec3) -> Cell {
        (
            (p.x / self.radius).floor() as i32,
            (p.z / self.radius).floor() as i32,
        )
    }

    fn within_radius(&self, id: EntityId, p: Vec3) -> HashSet<EntityId> {
        let (cx, cz) = self.cell_of(p);
        let r2 = self.radius * self.radius;
        let mut found = HashSet::new();
        for dx in -1..=1 {
            for dz in -1..=1 {
                let Some(cell) = self.cells.get(&(cx.saturating_add(dx), cz.saturating_add(dz)))
                else {
                    continue;
                };
                for other in cell {
                    if *other == id {
                        continue;
                    }
                    if let Some(node) = self.nodes.get(other) {
                        if node.position.distance_xz_sq(p) <= r2 {
                            found.insert(*other);
                        }
                    }
                }
            }
        }
        found
    }

    fn emit_pair(&self, a: EntityId, b: EntityId, change: InterestChange, out: &mut Vec<AoiEvent>) {
        out.push(AoiEvent {
            space: self.space,
            observer: a,
            subject: b,
            change,
        });
        out.push(AoiEvent {
            space: self.space,
            observer: b,
            subject: a,
            change,
        });
    }

    /// Inserts `id` at `position`; an existing node is moved instead.
    pub fn insert(&mut self, id: EntityId, position: Vec3, out: &mut Vec<AoiEvent>) {
        if self.nodes.contains_key(&id) {
            self.update(id, position, out);
            return;
        }
        let cell = self.cell_of(position);
        self.cells.entry(cell).or_default().insert(id);
        self.nodes.insert(
            id,
            AoiNode {
                position,
                cell,
                neighbors: HashSet::new(),
            },
        );
        self.update(id, position, out);
    }

    /// Moves `id`, reporting only pairs whose visibility changed.
    pub fn update(&mut self, id: EntityId, position: Vec3, out: &mut Vec<AoiEvent>) {
        let new_cell = self.cell_of(position);
        let Some(node) = self.nodes.get_mut(&id) else {
            return;
        };
        let old_cell = node.cell;
        node.position = position;
        node.cell = new_cell;
        if old_cell != new_cell {
            if let Some(cell) = self.cells.get_mut(&old_cell) {
                cell.remove(&id);
                if cell.is_empty() {
                    self.cells.remove(&old_cell);
                }
            }
            self.cells.entry(new_cell).or_default().insert(id);
        }

        let now = self.within_radius(id, position);
        let before = self
            .nodes
            .get_mut(&id)
            .map(|n| std::mem::take(&mut n.neighbors))
            .unwrap_or_default();

        let mut left: Vec<EntityId> = before.difference(&now).copied().collect();
        let mut entered: Vec<EntityId> = now.difference(&before).copied().collect();
        left.sort();
        entered.sort();

        for other in left {
            if let Some(n) = self.nodes.get_mut(&other) {
                n.neighbors.remove(&id);
            }
            self.emit_pair(id, other, InterestChange::Leave, out);
        }
        for other in entered {
            if let Some(n) = self.nodes.get_mut(&other) {
                n.neighbors.insert(id);
            }
            self.emit_pair(id, other, InterestChange::Enter, out);
        }
        if let Some(n) = self.nodes.get_mut(&id) {
            n.neighbors = now;
        }
    }

    /// Removes `id`; every current neighbor loses it and vice versa.
    pub fn remove(&mut self, id: EntityId, out: &mut Vec<AoiEvent>) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };
        if let Some(cell) = self.cells.get_mut(&node.cell) {
            cell.remove(&id);
            if cell.is_empty() {
                self.cells.remove(&node.cell);
            }
        }
        let mut gone: Vec<EntityId> = node.neighbors.into_iter().collect();
        gone.sort();
        for other in gone {
            if let Some(n) = self.nodes.get_mut(&other) {
                n.neighbors.remove(&id);
            }
            self.emit_pair(id, other, InterestChange::Leave, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<EntityId> {
        let mut alloc = IdAllocator::new(GameId(1));
        (0..n).map(|_| alloc.mint()).collect()
    }

    fn grid() -> AoiGrid {
        AoiGrid::new(EntityId::nil_space(GameId(1)), 10.0)
    }

    fn count(events: &[AoiEvent], observer: EntityId, subject: EntityId, change: InterestChange) -> usize {
        events
            .iter()
            .filter(|e| e.observer == observer && e.subject == subject && e.change == change)
            .count()
    }

    #[test]
    fn enter_sees_only_nearby() {
        let v = ids(3);
        let (a, b, c) = (v[0], v[1], v[2]);
        let mut g = grid();
        let mut ev = Vec::new();
        g.insert(a, Vec3::new(0.0, 0.0, 0.0), &mut ev);
        g.insert(b, Vec3::new(5.0, 0.0, 5.0), &mut ev);
        g.insert(c, Vec3::new(50.0, 0.0, 50.0), &mut ev);

        assert_eq!(ev.len(), 2);
        assert_eq!(count(&ev, a, b, InterestChange::Enter), 1);
        assert_eq!(count(&ev, b, a, InterestChange::Enter), 1);
        assert!(g.neighbors(c).unwrap().is_empty());
    }

    #[test]
    fn crossing_radius_emits_once_per_side() {
        let v = ids(2);
        let (a, b) = (v[0], v[1]);
        let mut g = grid();
        let mut ev = Vec::new();
        g.insert(a, Vec3::ZERO, &mut ev);
        g.insert(b, Vec3::new(8.0, 0.0, 0.0), &mut ev);
        ev.clear();

        // Out of range.
        g.update(b, Vec3::new(15.0, 0.0, 0.0), &mut ev);
        assert_eq!(count(&ev, a, b, InterestChange::Leave), 1);
        assert_eq!(count(&ev, b, a, InterestChange::Leave), 1);
        assert_eq!(ev.len(), 2);

        // Moving further out changes nothing.
        ev.clear();
        g.update(b, Vec3::new(30.0, 0.0, 0.0), &mut ev);
        assert!(ev.is_empty());

        // Back in.
        g.update(b, Vec3::new(9.0, 0.0, 0.0), &mut ev);
        assert_eq!(count(&ev, a, b, InterestChange::Enter), 1);
        assert_eq!(count(&ev, b, a, InterestChange::Enter), 1);
        assert_eq!(ev.len(), 2);
    }

    #[test]
    fn height_is_ignored() {
        let v = ids(2);
        let (a, b) = (v[0], v[1]);
        let mut g = grid();
        let mut ev = Vec::new();
        g.insert(a, Vec3::ZERO, &mut ev);
        g.insert(b, Vec3::new(1.0, 1000.0, 1.0), &mut ev);
        assert!(g.neighbors(a).unwrap().contains(&b));
    }

    #[test]
    fn visibility_is_symmetric_after_random_walk() {
        let all = ids(40);
        let mut g = grid();
        let mut ev = Vec::new();
        for (i, id) in all.iter().enumerate() {
            g.insert(*id, Vec3::new((i * 3) as f32 % 60.0, 0.0, (i * 7) as f32 % 60.0), &mut ev);
        }
        for step in 0..200usize {
            let id = all[step % all.len()];
            let p = Vec3::new(((step * 13) % 70) as f32, 0.0, ((step * 29) % 70) as f32);
            g.update(id, p, &mut ev);
        }
        for a in &all {
            for b in g.neighbors(*a).unwrap() {
                assert!(g.neighbors(*b).unwrap().contains(a));
            }
        }
    }

    #[test]
    fn remove_notifies_neighbors() {
        let v = ids(3);
        let (a, b, c) = (v[0], v[1], v[2]);
        let mut g = grid();
        let mut ev = Vec::new();
        g.insert(a, Vec3::ZERO, &mut ev);
        g.insert(b, Vec3::new(1.0, 0.0, 0.0), &mut ev);
        g.insert(c, Vec3::new(2.0, 0.0, 0.0), &mut ev);
        ev.clear();
        g.remove(a, &mut ev);
        assert_eq!(ev.len(), 4);
        assert_eq!(count(&ev, b, a, InterestChange::Leave), 1);
        assert_eq!(count(&ev, c, a, InterestChange::Leave), 1);
        assert!(!g.neighbors(b).unwrap().contains(&a));
        assert!(!g.contains(a));
    }
}
