//! Game and entity identifiers.
//!
//! Entity IDs are minted without any coordination between games. Each ID packs:
//! - 4 bytes: unix seconds at mint time (never 0 for minted IDs)
//! - 2 bytes: minting game
//! - 2 bytes: random per-process nonce
//! - 4 bytes: counter seeded randomly
//!
//! A zero timestamp is reserved for nil-space IDs, which are derived from the
//! game ID alone so every game can address every other game's nil space.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Number of bytes in an [`EntityId`].
pub const ENTITY_ID_LEN: usize = 12;

/// Identifies one game process in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GameId(pub u16);

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "game{}", self.0)
    }
}

/// Globally unique entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct EntityId([u8; ENTITY_ID_LEN]);

impl EntityId {
    pub fn from_parts(secs: u32, game: GameId, nonce: u16, counter: u32) -> Self {
        let mut b = [0u8; ENTITY_ID_LEN];
        b[0..4].copy_from_slice(&secs.to_be_bytes());
        b[4..6].copy_from_slice(&game.0.to_be_bytes());
        b[6..8].copy_from_slice(&nonce.to_be_bytes());
        b[8..12].copy_from_slice(&counter.to_be_bytes());
        EntityId(b)
    }

    /// The fixed ID of `game`'s nil space.
    pub fn nil_space(game: GameId) -> Self {
        Self::from_parts(0, game, 0, 0)
    }

    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Game that minted this ID (or hosts it, for nil spaces).
    pub fn game(&self) -> GameId {
        GameId(u16::from_be_bytes([self.0[4], self.0[5]]))
    }

    pub fn is_nil_space(&self) -> bool {
        self.timestamp() == 0
    }

    /// Returns the hosting game when this is a nil-space ID.
    pub fn nil_space_game(&self) -> Option<GameId> {
        self.is_nil_space().then(|| self.game())
    }

    pub fn as_bytes(&self) -> &[u8; ENTITY_ID_LEN] {
        &self.0
    }

    /// Lowercase hex rendering, 24 characters.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(ENTITY_ID_LEN * 2);
        for byte in self.0 {
            s.push(HEX[(byte >> 4) as usize] as char);
            s.push(HEX[(byte & 0x0f) as usize] as char);
        }
        s
    }
}

const HEX: &[u8; 16] = b"0123456789abcdef";

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityId({})", self.to_hex())
    }
}

/// Error parsing an [`EntityId`] from its hex form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityIdParseError {
    InvalidLength(usize),
    InvalidDigit(char),
}

impl fmt::Display for EntityIdParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityIdParseError::InvalidLength(n) => {
                write!(f, "entity id must be {} hex chars, got {}", ENTITY_ID_LEN * 2, n)
            }
            EntityIdParseError::InvalidDigit(c) => write!(f, "invalid hex digit {c:?}"),
        }
    }
}

impl std::error::Error for EntityIdParseError {}

impl FromStr for EntityId {
    type Err = EntityIdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ENTITY_ID_LEN * 2 {
            return Err(EntityIdParseError::InvalidLength(s.len()));
        }
        if let Some(c) = s.chars().find(|c| !c.is_ascii_hexdigit()) {
            return Err(EntityIdParseError::InvalidDigit(c));
        }
        let mut b = [0u8; ENTITY_ID_LEN];
        for (i, pair) in s.as_bytes().chunks(2).enumerate() {
            let hi = (pair[0] as char).to_digit(16).unwrap_or(0);
            let lo = (pair[1] as char).to_digit(16).unwrap_or(0);
            b[i] = ((hi << 4) | lo) as u8;
        }
        Ok(EntityId(b))
    }
}

impl From<EntityId> for String {
    fn from(id: EntityId) -> Self {
        id.to_hex()
    }
}

impl TryFrom<String> for EntityId {
    type Error = EntityIdParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Mints entity IDs for one game.
#[derive(Debug)]
pub struct IdAllocator {
    game: GameId,
    nonce: u16,
    counter: u32,
}

impl IdAllocator {
    pub fn new(game: GameId) -> Self {
        let mut rng = rand::thread_rng();
        Self {
            game,
            nonce: rng.gen(),
            counter: rng.gen(),
        }
    }

    pub fn game(&self) -> GameId {
        self.game
    }

    /// Mints a fresh ID. IDs are never handed out twice by one allocator.
    pub fn mint(&mut self) -> EntityId {
        self.counter = self.counter.wrapping_add(1);
        let secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(1)
            .max(1);
        EntityId::from_parts(secs, self.game, self.nonce, self.counter)
    }
}

/// Stable 64-bit hash used to pick location authorities.
pub fn stable_hash(key: &str) -> u64 {
    const_fnv1a_hash::fnv1a_hash_str_64(key)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn minted_ids_are_unique_and_not_nil() {
        let mut alloc = IdAllocator::new(GameId(3));
        let mut seen = HashSet::new();
        for _ in 0..10_000 {
            let id = alloc.mint();
            assert!(!id.is_nil_space());
            assert_eq!(id.game(), GameId(3));
            assert!(seen.insert(id), "id minted twice: {id}");
        }
    }

    #[test]
    fn allocators_on_different_games_never_collide() {
        let mut a = IdAllocator::new(GameId(1));
        let mut b = IdAllocator::new(GameId(2));
        let ids_a: HashSet<_> = (0..1000).map(|_| a.mint()).collect();
        assert!((0..1000).all(|_| !ids_a.contains(&b.mint())));
    }

    #[test]
    fn nil_space_id_encodes_game() {
        let id = EntityId::nil_space(GameId(7));
        assert!(id.is_nil_space());
        assert_eq!(id.nil_space_game(), Some(GameId(7)));
        assert_ne!(id, EntityId::nil_space(GameId(8)));
    }

    #[test]
    fn hex_form_parses_back() {
        let id = IdAllocator::new(GameId(9)).mint();
        let s = id.to_string();
        assert_eq!(s.len(), 24);
        assert_eq!(s.parse::<EntityId>().unwrap(), id);
        assert_eq!(
            "zz".parse::<EntityId>(),
            Err(EntityIdParseError::InvalidLength(2))
        );
    }

    #[test]
    fn serializes_as_string() {
        let id = EntityId::nil_space(GameId(1));
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        assert_eq!(serde_json::from_str::<EntityId>(&json).unwrap(), id);
    }
}
