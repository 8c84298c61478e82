// vim: tw=80
//! Checkpoint replication between the controllers

use std::time::Duration;

use duplex_core::{
    checkpoint::{CheckpointStore, Role},
    types::*,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::Ordering;

use super::*;

const INTERVAL: Duration = Duration::from_secs(5);

/// Checkpoint advances between pushes stay local; state changes and the
/// push interval force full peer-replicated writes.
#[test_log::test(tokio::test(start_paused = true))]
async fn push_policy() {
    let store = Arc::new(MemNonpagedStore::default());
    let mut active = CheckpointStore::create(Role::Active, store.clone(),
        INTERVAL);
    active.occupy(0, Checkpoint::At(0)).await.unwrap();
    assert_eq!(store.sets.load(Ordering::Relaxed), 1);

    // Ordinary advances inside the interval are local-only
    active.advance(0x1, 0, 16, 16).await.unwrap();
    active.advance(0x1, 16, 32, 16).await.unwrap();
    assert_eq!(store.sets.load(Ordering::Relaxed), 1);
    assert_eq!(store.increments.load(Ordering::Relaxed), 2);

    // The interval elapsing upgrades the next advance to a full push
    tokio::time::advance(INTERVAL).await;
    active.advance(0x1, 32, 48, 16).await.unwrap();
    assert_eq!(store.sets.load(Ordering::Relaxed), 2);

    // Completion always takes the full-push path, interval or not
    active.complete(0).await.unwrap();
    assert_eq!(store.sets.load(Ordering::Relaxed), 3);
    assert_eq!(store.increments.load(Ordering::Relaxed), 2);
}

/// The passive controller applies replicated records verbatim and refuses
/// to originate its own writes.
#[test_log::test(tokio::test)]
async fn passive_apply() {
    let active_store = Arc::new(MemNonpagedStore::default());
    let mut active = CheckpointStore::create(Role::Active,
        active_store.clone(), INTERVAL);
    active.occupy(1, Checkpoint::At(0)).await.unwrap();
    active.advance(0x2, 0, 24, 24).await.unwrap();
    active.set_logging(1, true).await.unwrap();

    // set_logging forces a full push, so the replicated bytes carry the
    // whole record over to the passive side
    let passive_store = Arc::new(MemNonpagedStore::default());
    let mut passive = CheckpointStore::create(Role::Passive, passive_store,
        INTERVAL);
    passive.apply_peer_update(&active_store.bytes()).unwrap();
    assert_eq!(passive.checkpoint(1), Checkpoint::At(24));
    assert_eq!(passive.blocks_rebuilt(1), 24);
    assert!(passive.is_logging(1));

    // An active store must never accept a peer's record
    let bytes = passive.to_bytes().unwrap();
    assert_eq!(active.apply_peer_update(&bytes), Err(Error::EPERM));

    // Failover: the surviving controller reopens the replicated record as
    // the new active side
    let reopened = CheckpointStore::open(Role::Active, active_store,
        INTERVAL).await.unwrap();
    assert_eq!(reopened.checkpoint(1), Checkpoint::At(24));
    assert!(reopened.is_logging(1));
}
