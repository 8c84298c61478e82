// vim: tw=80

use duplex_core::{
    group::{Health, RaidGroup, RebuildParams},
    types::*,
};
use pretty_assertions::assert_eq;
use uuid::Uuid;

use super::*;

fn params() -> RebuildParams {
    RebuildParams {
        cycle_chunks: 4,
        ..Default::default()
    }
}

fn group(services: Services) -> RaidGroup {
    RaidGroup::create(Uuid::new_v4(), 3, CHUNK, USER_CAP, META_CHUNKS,
        params(), services)
}

/// One position, fully consumed disk: the metadata region rebuilds first,
/// then the user region sweeps from 0 with progress notifications, and the
/// checkpoint collapses to the end-marker.
#[test_log::test(tokio::test)]
async fn full_rebuild() {
    let obj = ObjectId(1);
    let (harness, services) = Harness::new(vec![(0, USER_CAP, obj)]);
    let gr = group(services);
    gr.degrade(1).await.unwrap();
    gr.rebuild_all().await.unwrap();

    assert_eq!(gr.checkpoint(1).await, Checkpoint::Complete);
    let calls = harness.blockio.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![
        (USER_CAP, META_END - USER_CAP, 0x2),   // metadata region first
        (0, 16, 0x2),
        (16, 16, 0x2),
        (32, 16, 0x2),
        (48, 16, 0x2),
    ]);
    for chunk in 0..(USER_CAP / CHUNK) {
        assert!(!harness.paged.record(chunk).needs_rebuild(0x2));
    }
    assert_eq!(harness.notifier.events(), vec![
        Event::Started(obj, 1),
        Event::Progress(obj, 1, 25),
        Event::Progress(obj, 1, 50),
        Event::Progress(obj, 1, 75),
        Event::Progress(obj, 1, 100),
        Event::Ended(obj, 1),
    ]);
}

/// Unconsumed ranges advance without reconstruction I/O; only the one
/// consumed extent is actually rebuilt, yet progress still reaches 100%.
#[test_log::test(tokio::test)]
async fn sparse_consumption() {
    let obj = ObjectId(2);
    let (harness, services) = Harness::new(vec![(16, 32, obj)]);
    let gr = group(services);
    gr.degrade(0).await.unwrap();
    gr.rebuild_all().await.unwrap();

    assert_eq!(gr.checkpoint(0).await, Checkpoint::Complete);
    let calls = harness.blockio.calls.lock().unwrap().clone();
    assert_eq!(calls, vec![
        (USER_CAP, META_END - USER_CAP, 0x1),
        (16, 16, 0x1),
    ]);
    // The skipped spans still had their rebuild bits cleared
    for chunk in 0..(USER_CAP / CHUNK) {
        assert!(!harness.paged.record(chunk).needs_rebuild(0x1));
    }
    assert_eq!(harness.notifier.events(), vec![
        Event::Started(obj, 0),
        Event::Progress(obj, 0, 50),
        Event::Progress(obj, 0, 75),
        Event::Progress(obj, 0, 100),
        Event::Ended(obj, 0),
    ]);
}

/// Two positions degraded together share every pass of reconstruction I/O
/// and both reach the end-marker.
#[test_log::test(tokio::test)]
async fn two_positions_batched() {
    let obj = ObjectId(3);
    let (harness, services) = Harness::new(vec![(0, USER_CAP, obj)]);
    let gr = group(services);
    gr.degrade(0).await.unwrap();
    gr.degrade(1).await.unwrap();
    gr.rebuild_all().await.unwrap();

    assert_eq!(gr.checkpoint(0).await, Checkpoint::Complete);
    assert_eq!(gr.checkpoint(1).await, Checkpoint::Complete);
    let calls = harness.blockio.calls.lock().unwrap().clone();
    // Every pass served both positions at once
    assert!(calls.iter().all(|&(_, _, mask)| mask == 0x3));
    assert_eq!(calls.len(), 5);     // 1 metadata + 4 user cycles
    let events = harness.notifier.events();
    for position in 0..2u8 {
        let mine = events.iter()
            .filter(|ev| match ev {
                Event::Started(_, p) |
                Event::Progress(_, p, _) |
                Event::Ended(_, p) => *p == position,
            })
            .cloned()
            .collect::<Vec<_>>();
        assert_eq!(mine, vec![
            Event::Started(obj, position),
            Event::Progress(obj, position, 25),
            Event::Progress(obj, position, 50),
            Event::Progress(obj, position, 75),
            Event::Progress(obj, position, 100),
            Event::Ended(obj, position),
        ]);
    }
}

/// A rebuild-logging position is left alone until logging ends.
#[test_log::test(tokio::test)]
async fn rebuild_logging_freezes() {
    let obj = ObjectId(4);
    let (harness, services) = Harness::new(vec![(0, USER_CAP, obj)]);
    let gr = group(services);
    gr.degrade(0).await.unwrap();
    gr.set_rebuild_logging(0, true).await.unwrap();

    gr.rebuild_all().await.unwrap();
    assert_eq!(gr.checkpoint(0).await, Checkpoint::At(USER_CAP));
    assert!(harness.blockio.calls.lock().unwrap().is_empty());
    assert_eq!(gr.status().await.positions[0].health,
        Health::RebuildLogging);

    gr.set_rebuild_logging(0, false).await.unwrap();
    gr.rebuild_all().await.unwrap();
    assert_eq!(gr.checkpoint(0).await, Checkpoint::Complete);
}

/// A controller reboot mid-rebuild: the reopened group resumes from the
/// persisted checkpoint and never repeats the STARTED notification.
#[test_log::test(tokio::test)]
async fn reboot_resumes() {
    let obj = ObjectId(5);
    let (harness, services) = Harness::new(vec![(0, USER_CAP, obj)]);
    let gr = group(services.clone());
    gr.degrade(0).await.unwrap();
    // Metadata cycle, checkpoint reset, then one user cycle
    assert!(gr.run_cycle().await.unwrap());
    assert!(gr.run_cycle().await.unwrap());
    assert!(gr.run_cycle().await.unwrap());
    assert_eq!(gr.checkpoint(0).await, Checkpoint::At(16));
    assert!(!harness.ckpt_store.bytes().is_empty());
    drop(gr);

    let gr = RaidGroup::open(Uuid::new_v4(), 3, CHUNK, USER_CAP, META_CHUNKS,
        params(), services).await.unwrap();
    assert_eq!(gr.checkpoint(0).await, Checkpoint::At(16));
    assert_eq!(gr.percent_rebuilt(0).await, 25);
    gr.rebuild_all().await.unwrap();
    assert_eq!(gr.checkpoint(0).await, Checkpoint::Complete);

    let events = harness.notifier.events();
    let starts = events.iter()
        .filter(|ev| matches!(ev, Event::Started(..)))
        .count();
    assert_eq!(starts, 1);
    assert_eq!(events.last(), Some(&Event::Ended(obj, 0)));
}

/// Denied credits defer the cycle without touching any state.
#[test_log::test(tokio::test(start_paused = true))]
async fn credits_denied() {
    let (harness, mut services) = Harness::new(vec![]);
    services.gate = Arc::new(FixedGate(false));
    let gr = group(services);
    gr.degrade(0).await.unwrap();

    assert!(gr.run_cycle().await.unwrap());
    assert_eq!(gr.checkpoint(0).await, Checkpoint::At(USER_CAP));
    assert!(harness.blockio.calls.lock().unwrap().is_empty());
}
