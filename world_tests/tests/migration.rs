use std::time::Duration;

use world_game::migration::{MigrationEvent, MigrationState};
use world_shared::prelude::*;
use world_tests::*;

const G1: GameId = GameId(1);
const G2: GameId = GameId(2);

/// A space on game 2 and an NPC on game 1, both announced to their authorities.
async fn arena(c: &mut world_game::LocalCluster) -> anyhow::Result<(EntityId, EntityId)> {
    let space = c.game_mut(G2)?.create_space_locally(1)?;
    let npc = c.game_mut(G1)?.create_entity_locally(NPC)?;
    c.settle().await;
    Ok((space, npc))
}

#[tokio::test(start_paused = true)]
async fn entering_a_remote_space_migrates() -> anyhow::Result<()> {
    let mut c = cluster(2)?;
    let (space, npc) = arena(&mut c).await?;

    let g1 = c.game_mut(G1)?;
    g1.entity_mut(npc)
        .expect("npc")
        .attrs_mut()
        .insert("hp".into(), Value::Int(42));
    g1.enter_space(npc, space, Vec3::new(3.0, 0.0, 4.0))?;
    assert_eq!(g1.migration_state(npc), MigrationState::Leaving);
    // Issued while in flight: delivered once, on the new owner.
    g1.call(npc, "Ping", vec![]);
    c.game_mut(G2)?.call(npc, "Ping", vec![]);
    c.settle().await;

    assert_eq!(holders(&c, npc), vec![G2]);
    assert_eq!(c.owner_of(npc), Some(G2));
    let g2 = c.game(G2)?;
    let entity = g2.entity(npc).expect("arrived");
    assert_eq!(entity.space(), Some(space));
    assert_eq!(entity.position(), Vec3::new(3.0, 0.0, 4.0));
    assert_eq!(entity.attrs().get("hp"), Some(&Value::Int(42)));
    assert_eq!(counter(g2, npc, "migrate.out"), 1);
    assert_eq!(counter(g2, npc, "migrate.in"), 1);
    assert_eq!(counter(g2, npc, "inits"), 1);
    assert_eq!(calls(g2, npc, "Ping"), 2);
    assert!(g2.space(space).expect("space").contains(npc));

    let g1 = c.game_mut(G1)?;
    assert!(g1.entity(npc).is_none());
    assert_eq!(g1.migration_state(npc), MigrationState::Done);
    assert_eq!(
        g1.drain_events::<MigrationEvent>(),
        vec![MigrationEvent::Committed { id: npc, dest: G2 }]
    );
    assert_eq!(
        c.game_mut(G2)?.drain_events::<MigrationEvent>(),
        vec![MigrationEvent::Arrived { id: npc, source: G1 }]
    );

    // Later calls from the old owner follow the redirect.
    c.game_mut(G1)?.call(npc, "Ping", vec![]);
    c.settle().await;
    assert_eq!(calls(c.game(G2)?, npc, "Ping"), 3);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn calls_follow_after_the_redirect_expires() -> anyhow::Result<()> {
    let mut c = cluster_with(3, |cfg| cfg.redirect_ttl_ms = 500)?;
    let (space, npc) = arena(&mut c).await?;
    c.game_mut(G1)?.enter_space(npc, space, Vec3::ZERO)?;
    c.settle().await;

    c.advance(Duration::from_millis(1_100)).await;
    assert_eq!(c.game(G1)?.migration_state(npc), MigrationState::Idle);
    c.game_mut(G1)?.call(npc, "Ping", vec![]);
    c.game_mut(GameId(3))?.call(npc, "Ping", vec![]);
    c.settle().await;
    assert_eq!(calls(c.game(G2)?, npc, "Ping"), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn travel_to_another_game_lands_in_its_nil_space() -> anyhow::Result<()> {
    let mut c = cluster(2)?;
    let npc = c.game_mut(G1)?.create_entity_locally(NPC)?;
    c.settle().await;

    c.game_mut(G1)?.call(npc, "Travel", vec![Value::Int(2)]);
    c.settle().await;

    let g2 = c.game(G2)?;
    let nil = g2.nil_space_id();
    assert_eq!(c.owner_of(npc), Some(G2));
    assert_eq!(g2.entity(npc).and_then(|e| e.space()), Some(nil));
    assert!(g2.nil_space().expect("nil").contains(npc));

    // Travelling home again.
    c.game_mut(G2)?.migrate_to_game(npc, G1)?;
    c.settle().await;
    assert_eq!(c.owner_of(npc), Some(G1));
    assert_eq!(counter(c.game(G1)?, npc, "migrate.in"), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn a_second_move_while_in_flight_is_refused() -> anyhow::Result<()> {
    let mut c = cluster(2)?;
    let (space, npc) = arena(&mut c).await?;
    let g1 = c.game_mut(G1)?;
    g1.enter_space(npc, space, Vec3::ZERO)?;
    assert!(matches!(
        g1.enter_space(npc, space, Vec3::ZERO),
        Err(WorldError::MigrationInFlight(id)) if id == npc
    ));
    assert!(matches!(
        g1.destroy_entity(npc),
        Err(WorldError::MigrationInFlight(_))
    ));
    assert!(matches!(
        g1.move_entity(npc, Vec3::ZERO),
        Err(WorldError::MigrationInFlight(_))
    ));
    c.settle().await;
    assert_eq!(c.owner_of(npc), Some(G2));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn unknown_space_is_rejected_and_rolled_back() -> anyhow::Result<()> {
    let mut c = cluster(2)?;
    let npc = c.game_mut(G1)?.create_entity_locally(NPC)?;
    c.settle().await;

    let nowhere = IdAllocator::new(GameId(7)).mint();
    c.game_mut(G1)?.enter_space(npc, nowhere, Vec3::ZERO)?;
    c.game_mut(G1)?.call(npc, "Ping", vec![]);
    c.settle().await;

    let g1 = c.game_mut(G1)?;
    let entity = g1.entity(npc).expect("still here");
    assert!(entity.is_active());
    assert_eq!(entity.space(), Some(g1.nil_space_id()));
    assert_eq!(counter(g1, npc, "migrate.failed"), 1);
    assert_eq!(calls(g1, npc, "Ping"), 1);
    let events = g1.drain_events::<MigrationEvent>();
    assert!(matches!(
        events.as_slice(),
        [MigrationEvent::Failed { id, reason: WorldError::NotFound(_) }] if *id == npc
    ));
    assert_eq!(holders(&c, npc), vec![G1]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn timeout_rolls_back_and_late_ack_is_aborted() -> anyhow::Result<()> {
    let mut c = cluster_with(2, |cfg| cfg.migrate_timeout_ms = 100)?;
    let (space, npc) = arena(&mut c).await?;

    c.freeze(G2);
    c.game_mut(G1)?.enter_space(npc, space, Vec3::ZERO)?;
    c.game_mut(G1)?.call(npc, "Ping", vec![]);
    c.settle().await;
    assert_eq!(c.game(G1)?.migration_state(npc), MigrationState::Leaving);

    c.advance(Duration::from_millis(150)).await;
    let g1 = c.game_mut(G1)?;
    assert!(g1.entity(npc).is_some_and(|e| e.is_active()));
    assert_eq!(g1.migration_state(npc), MigrationState::Idle);
    assert_eq!(counter(g1, npc, "migrate.failed"), 1);
    // The buffered call ran once the entity was back.
    assert_eq!(calls(g1, npc, "Ping"), 1);
    assert!(matches!(
        g1.drain_events::<MigrationEvent>().as_slice(),
        [MigrationEvent::Failed { reason: WorldError::Timeout(_), .. }]
    ));

    // Game 2 wakes up, accepts the stale request and is told to drop it.
    c.thaw(G2);
    c.settle().await;
    assert_eq!(holders(&c, npc), vec![G1]);
    assert!(!c.game(G2)?.space(space).expect("space").contains(npc));
    assert_eq!(
        c.game_mut(G2)?.drain_events::<MigrationEvent>(),
        vec![MigrationEvent::Discarded { id: npc }]
    );

    c.game_mut(G2)?.call(npc, "Ping", vec![]);
    c.settle().await;
    assert_eq!(calls(c.game(G1)?, npc, "Ping"), 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn uncommitted_arrival_is_discarded_and_calls_go_back() -> anyhow::Result<()> {
    let mut c = cluster_with(2, |cfg| cfg.migrate_timeout_ms = 100)?;
    let (space, npc) = arena(&mut c).await?;

    // Game 1 sends the request, then stops reading: the ack waits unread.
    c.game_mut(G1)?.enter_space(npc, space, Vec3::ZERO)?;
    c.freeze(G1);
    c.settle().await;
    let g2 = c.game_mut(G2)?;
    assert_eq!(g2.migration_state(npc), MigrationState::Arriving);
    g2.call(npc, "Ping", vec![]);

    c.advance(Duration::from_millis(250)).await;
    let g2 = c.game_mut(G2)?;
    assert!(g2.entity(npc).is_none());
    assert!(!g2.space(space).expect("space").contains(npc));
    assert_eq!(
        g2.drain_events::<MigrationEvent>(),
        vec![MigrationEvent::Discarded { id: npc }]
    );

    // The ack is read after the source deadline, so the source keeps the
    // entity and runs the call the destination sent back.
    c.thaw(G1);
    c.settle().await;
    let g1 = c.game_mut(G1)?;
    assert!(g1.entity(npc).is_some_and(|e| e.is_active()));
    assert_eq!(calls(g1, npc, "Ping"), 1);
    assert_eq!(counter(g1, npc, "migrate.failed"), 1);
    assert!(matches!(
        g1.drain_events::<MigrationEvent>().as_slice(),
        [MigrationEvent::Failed { reason: WorldError::Timeout(_), .. }]
    ));
    assert_eq!(holders(&c, npc), vec![G1]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn interest_hooks_wait_while_leaving() -> anyhow::Result<()> {
    let mut c = cluster_with(2, |cfg| cfg.migrate_timeout_ms = 100)?;
    let (remote, a) = arena(&mut c).await?;
    let g1 = c.game_mut(G1)?;
    let local = g1.create_space_locally(3)?;
    g1.enable_aoi(local, 10.0)?;
    let b = g1.create_entity_locally(NPC)?;
    g1.enter_space(a, local, Vec3::ZERO)?;
    g1.enter_space(b, local, Vec3::new(50.0, 0.0, 0.0))?;

    c.freeze(G2);
    let g1 = c.game_mut(G1)?;
    g1.enter_space(a, remote, Vec3::ZERO)?;
    g1.move_entity(b, Vec3::new(1.0, 0.0, 0.0))?;
    assert_eq!(counter(g1, b, "aoi.enter"), 1);
    assert_eq!(counter(g1, a, "aoi.enter"), 0);

    // Rolled back: the held hook runs on the entity that stays.
    c.advance(Duration::from_millis(150)).await;
    let g1 = c.game(G1)?;
    assert_eq!(counter(g1, a, "migrate.failed"), 1);
    assert_eq!(counter(g1, a, "aoi.enter"), 1);
    assert_eq!(g1.space(local).expect("space").interested_in(a), vec![b]);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn interest_hooks_wait_while_arriving() -> anyhow::Result<()> {
    let mut c = cluster(2)?;
    let (space, a) = arena(&mut c).await?;
    let g2 = c.game_mut(G2)?;
    g2.enable_aoi(space, 10.0)?;
    let neighbor = g2.create_entity_locally(NPC)?;
    g2.enter_space(neighbor, space, Vec3::ZERO)?;

    c.game_mut(G1)?.enter_space(a, space, Vec3::new(1.0, 0.0, 0.0))?;
    c.freeze(G1);
    c.settle().await;
    let g2 = c.game(G2)?;
    assert_eq!(g2.migration_state(a), MigrationState::Arriving);
    assert_eq!(counter(g2, neighbor, "aoi.enter"), 1);
    assert_eq!(counter(g2, a, "aoi.enter"), 0);

    c.thaw(G1);
    c.settle().await;
    assert_eq!(c.owner_of(a), Some(G2));
    assert_eq!(counter(c.game(G2)?, a, "aoi.enter"), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn destroyed_space_parks_an_arriving_member_until_commit() -> anyhow::Result<()> {
    let mut c = cluster(2)?;
    let (space, npc) = arena(&mut c).await?;

    c.game_mut(G1)?.enter_space(npc, space, Vec3::ZERO)?;
    c.freeze(G1);
    c.settle().await;
    let g2 = c.game_mut(G2)?;
    let entered = counter(g2, npc, "space.enter");
    g2.destroy_entity(space)?;

    let nil = g2.nil_space_id();
    let entity = g2.entity(npc).expect("still arriving");
    assert!(!entity.is_active());
    assert_eq!(entity.space(), Some(nil));
    assert_eq!(counter(g2, npc, "space.enter"), entered);

    c.thaw(G1);
    c.settle().await;
    assert_eq!(c.owner_of(npc), Some(G2));
    let g2 = c.game(G2)?;
    assert!(g2.nil_space().expect("nil").contains(npc));
    assert_eq!(counter(g2, npc, "space.enter"), entered + 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn destroyed_space_parks_a_leaving_member_until_rollback() -> anyhow::Result<()> {
    let mut c = cluster_with(2, |cfg| cfg.migrate_timeout_ms = 100)?;
    let (remote, npc) = arena(&mut c).await?;
    let g1 = c.game_mut(G1)?;
    let local = g1.create_space_locally(4)?;
    g1.enter_space(npc, local, Vec3::ZERO)?;

    c.freeze(G2);
    let g1 = c.game_mut(G1)?;
    g1.enter_space(npc, remote, Vec3::ZERO)?;
    let entered = counter(g1, npc, "space.enter");
    g1.destroy_entity(local)?;
    assert_eq!(counter(g1, npc, "space.enter"), entered);

    c.advance(Duration::from_millis(150)).await;
    let g1 = c.game(G1)?;
    let entity = g1.entity(npc).expect("rolled back");
    assert!(entity.is_active());
    assert_eq!(entity.space(), Some(g1.nil_space_id()));
    assert_eq!(counter(g1, npc, "space.enter"), entered + 1);
    Ok(())
}
