//! Least-loaded placement for entities created or loaded "anywhere".

use std::collections::HashMap;

use world_shared::prelude::*;

use crate::game::Game;

/// Entity counts last reported by the other games.
///
/// Each pick bumps the chosen game's estimate so a burst of creations between
/// two reports spreads out instead of piling onto one game.
#[derive(Debug, Default)]
pub struct PlacementPolicy {
    reported: HashMap<GameId, u32>,
}

impl PlacementPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, game: GameId, entities: u32) {
        self.reported.insert(game, entities);
    }

    pub fn estimate(&self, game: GameId) -> u32 {
        self.reported.get(&game).copied().unwrap_or(0)
    }

    /// Picks the live game with the fewest entities; ties go to the lowest ID.
    /// `me` is judged by `my_load`, the others by their last report.
    pub fn choose(&mut self, me: GameId, my_load: u32, live: &[GameId]) -> GameId {
        let load = |g: GameId| if g == me { my_load } else { self.estimate(g) };
        let chosen = live
            .iter()
            .copied()
            .min_by_key(|g| (load(*g), *g))
            .unwrap_or(me);
        if chosen != me {
            *self.reported.entry(chosen).or_insert(0) += 1;
        }
        chosen
    }
}

impl Game {
    pub(crate) fn choose_game(&mut self) -> GameId {
        let me = self.id();
        let my_load = u32::try_from(self.entities.len()).unwrap_or(u32::MAX);
        let live = self.dispatcher.live_games();
        self.placement.choose(me, my_load, &live)
    }

    pub(crate) fn handle_load_report(&mut self, game: GameId, entities: u32) {
        self.placement.report(game, entities);
    }

    /// Tells every other game how many entities live here.
    pub fn report_load(&mut self) {
        let me = self.id();
        let entities = u32::try_from(self.entities.len()).unwrap_or(u32::MAX);
        for game in self.dispatcher.live_games() {
            if game != me {
                self.dispatcher.send(game, world_shared::net::Frame::LoadReport { game: me, entities });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_least_loaded_then_lowest_id() {
        let mut p = PlacementPolicy::new();
        let live = [GameId(1), GameId(2), GameId(3)];
        p.report(GameId(2), 3);
        p.report(GameId(3), 3);
        assert_eq!(p.choose(GameId(1), 5, &live), GameId(2));
        // The pick raised game 2's estimate; game 3 is next.
        assert_eq!(p.choose(GameId(1), 5, &live), GameId(3));
        assert_eq!(p.choose(GameId(1), 1, &live), GameId(1));
    }

    #[test]
    fn unreported_games_count_as_empty() {
        let mut p = PlacementPolicy::new();
        assert_eq!(p.choose(GameId(2), 1, &[GameId(1), GameId(2)]), GameId(1));
        assert_eq!(p.choose(GameId(2), 4, &[]), GameId(2));
    }
}
