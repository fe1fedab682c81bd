use std::sync::{Arc, Mutex};

use world_game::entity::LoadFinished;
use world_shared::net::LoadOutcome;
use world_shared::prelude::*;
use world_tests::*;

fn stored_hero(c: &world_game::LocalCluster, gold: i64) -> EntityId {
    let id = IdAllocator::new(GameId(1)).mint();
    let mut attrs = Attrs::new();
    attrs.insert("gold".into(), Value::Int(gold));
    c.storage().insert(HERO, id, attrs);
    id
}

fn outcomes(c: &mut world_game::LocalCluster) -> anyhow::Result<Vec<LoadOutcome>> {
    let mut all = Vec::new();
    for g in c.game_ids() {
        all.extend(
            c.game_mut(g)?
                .drain_events::<LoadFinished>()
                .into_iter()
                .map(|f| f.outcome),
        );
    }
    Ok(all)
}

#[tokio::test(start_paused = true)]
async fn concurrent_loads_read_storage_once() -> anyhow::Result<()> {
    let mut c = cluster(3)?;
    let hero = stored_hero(&c, 30);
    let done = Arc::new(Mutex::new(Vec::new()));

    // The authority sees the requests in issue order, so game 1's wins.
    for (requester, target) in [(1, 2), (3, 3), (2, 1)] {
        let done = done.clone();
        c.game_mut(GameId(requester))?.load_entity_on_game(
            HERO,
            hero,
            GameId(target),
            move |_, outcome| {
                done.lock().unwrap().push((requester, outcome));
                Ok(())
            },
        )?;
    }
    c.settle().await;

    assert_eq!(c.storage().load_count(), 1);
    assert_eq!(holders(&c, hero).len(), 1);
    let mut done = done.lock().unwrap().clone();
    done.sort_by_key(|(requester, _)| *requester);
    assert_eq!(
        done,
        vec![
            (1, LoadOutcome::Loaded(GameId(2))),
            (2, LoadOutcome::AlreadyPresent),
            (3, LoadOutcome::AlreadyPresent),
        ]
    );

    let outcomes = outcomes(&mut c)?;
    let loaded: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            LoadOutcome::Loaded(g) => Some(*g),
            _ => None,
        })
        .collect();
    assert_eq!(loaded.len(), 1);
    assert_eq!(c.owner_of(hero), Some(loaded[0]));
    let present = outcomes
        .iter()
        .filter(|o| **o == LoadOutcome::AlreadyPresent)
        .count();
    assert_eq!(present, 2);

    let owner = c.game(loaded[0])?;
    assert_eq!(counter(owner, hero, "gold"), 30);
    assert_eq!(counter(owner, hero, "inits"), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn each_load_completes_with_its_own_outcome() -> anyhow::Result<()> {
    let mut c = cluster(1)?;
    let hero = IdAllocator::new(GameId(1)).mint();

    #[derive(Debug)]
    struct Tagged(u8, LoadOutcome);

    // The second request is answered while the first still reads storage.
    for tag in [1, 2] {
        c.game_mut(GameId(1))?.load_entity_locally(HERO, hero, move |g, outcome| {
            g.events_mut().push(Tagged(tag, outcome));
            Ok(())
        })?;
    }
    c.settle().await;

    let mut seen = c.game_mut(GameId(1))?.drain_events::<Tagged>();
    seen.sort_by_key(|t| t.0);
    assert!(
        matches!(
            seen.as_slice(),
            [
                Tagged(1, LoadOutcome::Failed(WorldError::NotFound(_))),
                Tagged(2, LoadOutcome::AlreadyPresent),
            ]
        ),
        "{seen:?}"
    );
    assert_eq!(c.storage().load_count(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn loading_a_live_entity_is_a_no_op() -> anyhow::Result<()> {
    let mut c = cluster(2)?;
    let hero = c.game_mut(GameId(1))?.create_entity_locally(HERO)?;
    c.settle().await;

    c.game_mut(GameId(2))?
        .load_entity_locally(HERO, hero, |_, _| Ok(()))?;
    c.settle().await;

    assert_eq!(c.storage().load_count(), 0);
    assert_eq!(holders(&c, hero), vec![GameId(1)]);
    assert_eq!(outcomes(&mut c)?, vec![LoadOutcome::AlreadyPresent]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn missing_record_fails_once_and_can_be_retried() -> anyhow::Result<()> {
    let mut c = cluster(2)?;
    let hero = IdAllocator::new(GameId(2)).mint();

    #[derive(Debug)]
    struct Seen(LoadOutcome);

    c.game_mut(GameId(1))?.load_entity_anywhere(HERO, hero, |g, outcome| {
        g.events_mut().push(Seen(outcome));
        Ok(())
    })?;
    c.settle().await;

    let seen = c.game_mut(GameId(1))?.drain_events::<Seen>();
    assert!(matches!(
        seen.as_slice(),
        [Seen(LoadOutcome::Failed(WorldError::NotFound(_)))]
    ));
    assert!(holders(&c, hero).is_empty());

    // The failed attempt left no placement behind.
    let mut attrs = Attrs::new();
    attrs.insert("gold".into(), Value::Int(5));
    c.storage().insert(HERO, hero, attrs);
    c.game_mut(GameId(1))?
        .load_entity_on_game(HERO, hero, GameId(2), |_, _| Ok(()))?;
    c.settle().await;
    assert_eq!(c.owner_of(hero), Some(GameId(2)));
    assert_eq!(c.storage().load_count(), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn only_persistent_types_load() -> anyhow::Result<()> {
    let mut c = cluster(1)?;
    let game = c.game_mut(GameId(1))?;
    let id = IdAllocator::new(GameId(1)).mint();
    assert!(matches!(
        game.load_entity_locally(NPC, id, |_, _| Ok(())),
        Err(WorldError::Misuse(_))
    ));
    assert!(matches!(
        game.load_entity_locally("Nope", id, |_, _| Ok(())),
        Err(WorldError::NotFound(_))
    ));
    let nil = game.nil_space_id();
    assert!(matches!(
        game.load_entity_locally(HERO, nil, |_, _| Ok(())),
        Err(WorldError::Misuse(_))
    ));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn periodic_save_writes_persistent_entities() -> anyhow::Result<()> {
    let mut c = cluster_with(1, |cfg| cfg.save_interval_ms = 200)?;
    let game = c.game_mut(GameId(1))?;
    let hero = game.create_entity_locally(HERO)?;
    let npc = game.create_entity_locally(NPC)?;
    game.entity_mut(hero)
        .expect("hero")
        .attrs_mut()
        .insert("gold".into(), Value::Int(9));

    c.advance(std::time::Duration::from_millis(250)).await;
    assert_eq!(c.storage().save_count(), 1);
    assert_eq!(
        c.storage().get(HERO, hero).and_then(|a| a.get("gold").cloned()),
        Some(Value::Int(9))
    );
    assert!(c.storage().get(NPC, npc).is_none());
    Ok(())
}
