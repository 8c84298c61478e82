// vim: tw=80
//! End-to-end rebuild scenarios over in-memory service fakes

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
    Mutex,
};

use divbuf::DivBufShared;
use futures::{future, FutureExt};

use duplex_core::{
    blockio::BlockIo,
    chunk::{ChunkInfo, RECORD_SIZE},
    credit::{CreditGate, Priority},
    group::Services,
    metadata::{NonpagedStore, PagedStore},
    notify::Notifier,
    permit::{ConsumptionOracle, PermitReply},
    types::*,
};

pub const CHUNK: LbaT = 4;
pub const USER_CAP: LbaT = 64;
pub const META_CHUNKS: ChunkT = 2;
pub const META_END: LbaT = USER_CAP + META_CHUNKS * CHUNK;

/// In-memory paged chunk-record storage for the user region.
#[derive(Default)]
pub struct MemPagedStore {
    records: Mutex<Vec<ChunkInfo>>,
}

impl MemPagedStore {
    pub fn new(user_chunks: ChunkT) -> Self {
        MemPagedStore {
            records: Mutex::new(
                vec![ChunkInfo::default(); user_chunks as usize]),
        }
    }

    pub fn record(&self, chunk: ChunkT) -> ChunkInfo {
        self.records.lock().unwrap()[chunk as usize]
    }
}

impl PagedStore for MemPagedStore {
    fn read_chunks(&self, chunk: ChunkT, count: ChunkT)
        -> BoxRebuildFut<IoVec>
    {
        let records = self.records.lock().unwrap();
        let mut v = Vec::with_capacity(count as usize * RECORD_SIZE);
        for ci in &records[chunk as usize..(chunk + count) as usize] {
            v.extend_from_slice(&ci.to_bytes());
        }
        future::ok(DivBufShared::from(v).try_const().unwrap()).boxed()
    }

    fn clear_if_marked(&self, chunk: ChunkT, count: ChunkT, mask: PosMask)
        -> BoxRebuildFut<()>
    {
        let mut records = self.records.lock().unwrap();
        for ci in &mut records[chunk as usize..(chunk + count) as usize] {
            if ci.needs_rebuild(mask) {
                ci.clear(mask);
            }
        }
        future::ok(()).boxed()
    }

    fn mark_range(&self, chunk: ChunkT, count: ChunkT, mask: PosMask)
        -> BoxRebuildFut<()>
    {
        let mut records = self.records.lock().unwrap();
        for ci in &mut records[chunk as usize..(chunk + count) as usize] {
            ci.set_rebuild(mask);
        }
        future::ok(()).boxed()
    }

    fn any_marked(&self, mask: PosMask) -> BoxRebuildFut<bool> {
        let records = self.records.lock().unwrap();
        future::ok(records.iter().any(|ci| ci.needs_rebuild(mask))).boxed()
    }
}

/// In-memory non-paged record storage, with counters distinguishing full
/// peer-replicated pushes from local-only increments.
#[derive(Default)]
pub struct MemNonpagedStore {
    record: Mutex<Vec<u8>>,
    pub sets: AtomicUsize,
    pub increments: AtomicUsize,
}

impl MemNonpagedStore {
    pub fn bytes(&self) -> Vec<u8> {
        self.record.lock().unwrap().clone()
    }
}

impl NonpagedStore for MemNonpagedStore {
    fn read(&self) -> BoxRebuildFut<IoVec> {
        let v = self.record.lock().unwrap().clone();
        future::ok(DivBufShared::from(v).try_const().unwrap()).boxed()
    }

    fn set(&self, record: Vec<u8>) -> BoxRebuildFut<()> {
        *self.record.lock().unwrap() = record;
        self.sets.fetch_add(1, Ordering::Relaxed);
        future::ok(()).boxed()
    }

    fn increment(&self, record: Vec<u8>) -> BoxRebuildFut<()> {
        *self.record.lock().unwrap() = record;
        self.increments.fetch_add(1, Ordering::Relaxed);
        future::ok(()).boxed()
    }
}

/// Records every reconstruction request.
#[derive(Default)]
pub struct MemBlockIo {
    pub calls: Mutex<Vec<(LbaT, LbaT, PosMask)>>,
}

impl BlockIo for MemBlockIo {
    fn rebuild(&self, lba: LbaT, blocks: LbaT, targets: PosMask)
        -> BoxRebuildFut<()>
    {
        self.calls.lock().unwrap().push((lba, blocks, targets));
        future::ok(()).boxed()
    }
}

/// Answers permit requests from a fixed table of consumed extents.
pub struct ExtentOracle {
    /// Non-overlapping, sorted `(start, end, consumer)` extents
    extents: Vec<(LbaT, LbaT, ObjectId)>,
}

impl ExtentOracle {
    pub fn new(extents: Vec<(LbaT, LbaT, ObjectId)>) -> Self {
        ExtentOracle { extents }
    }
}

impl ConsumptionOracle for ExtentOracle {
    fn request(&self, lba: LbaT, blocks: LbaT) -> BoxRebuildFut<PermitReply> {
        let reply = match self.extents.iter()
            .find(|&&(s, e, _)| s <= lba && lba < e)
        {
            Some(&(_, end, object)) => {
                let mut r = PermitReply::consumed(object);
                r.unconsumed_blocks = (lba + blocks).saturating_sub(end);
                r
            },
            None => {
                let span = self.extents.iter()
                    .filter(|&&(s, _, _)| s > lba)
                    .map(|&(s, _, _)| s - lba)
                    .min()
                    .unwrap_or(blocks)
                    .min(blocks);
                PermitReply::unconsumed(span)
            }
        };
        future::ok(reply).boxed()
    }
}

/// Grants or denies every credit request.
pub struct FixedGate(pub bool);

impl CreditGate for FixedGate {
    fn request(&self, _priority: Priority, _io_credits: u32)
        -> BoxRebuildFut<bool>
    {
        future::ok(self.0).boxed()
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Event {
    Started(ObjectId, PositionT),
    Progress(ObjectId, PositionT, u8),
    Ended(ObjectId, PositionT),
}

/// Records every notification in order.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<Event>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn started(&self, object: ObjectId, position: PositionT) {
        self.events.lock().unwrap().push(Event::Started(object, position));
    }

    fn progress(&self, object: ObjectId, position: PositionT, percent: u8) {
        self.events.lock().unwrap()
            .push(Event::Progress(object, position, percent));
    }

    fn ended(&self, object: ObjectId, position: PositionT) {
        self.events.lock().unwrap().push(Event::Ended(object, position));
    }
}

/// Every fake, individually reachable after the Services handoff.
pub struct Harness {
    pub paged: Arc<MemPagedStore>,
    pub ckpt_store: Arc<MemNonpagedStore>,
    pub blockio: Arc<MemBlockIo>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    /// Fakes wired for a group with `extents` consumed.
    pub fn new(extents: Vec<(LbaT, LbaT, ObjectId)>) -> (Self, Services) {
        let paged = Arc::new(MemPagedStore::new(
            (USER_CAP / CHUNK) as ChunkT));
        let ckpt_store = Arc::new(MemNonpagedStore::default());
        let mom_store = Arc::new(MemNonpagedStore::default());
        let blockio = Arc::new(MemBlockIo::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let services = Services {
            blockio: blockio.clone(),
            oracle: Arc::new(ExtentOracle::new(extents)),
            gate: Arc::new(FixedGate(true)),
            notifier: notifier.clone(),
            paged: paged.clone(),
            checkpoint_store: ckpt_store.clone(),
            mom_store,
        };
        let harness = Harness {
            paged,
            ckpt_store,
            blockio,
            notifier,
        };
        (harness, services)
    }
}

mod peer;
mod rebuild;
