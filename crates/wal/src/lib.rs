//! Write-ahead logging for atomic multi-block updates.
//!
//! A file-system operation may dirty several blocks (data, bitmap, inode,
//! directory); after a crash the disk must show either all of them or
//! none. The log is a contiguous disk region — a header block followed by
//! scratch blocks — plus in-memory state tracking which cached blocks the
//! open transactions have dirtied.
//!
//! Operations bracket themselves with [`Wal::begin_op`] / [`Wal::end_op`];
//! each dirty block goes through [`Wal::write`] instead of a direct disk
//! write. Nothing reaches the disk until the last outstanding operation
//! ends; then the group commits:
//!
//! 1. copy each dirtied cache buffer to its log scratch block,
//! 2. write the header (count + home block numbers) — the commit point,
//! 3. copy each scratch block to its home location,
//! 4. write an empty header.
//!
//! A crash before (2) leaves the file system untouched; between (2) and
//! (4), [`Wal::recover`] replays (3)–(4) on the next boot, and replaying
//! is idempotent. Repeated writes to one block inside a transaction
//! absorb into a single log slot, which also keeps the conservative
//! capacity reservation in `begin_op` honest.
//!
//! The log pins every dirtied buffer in the cache until the commit has
//! installed it, so the cache cannot evict the only copy of uncommitted
//! data.
#![cfg_attr(not(test), no_std)]

use core::convert::Infallible;

use block_io::{BlockData, BlockDevice, BufCache, CacheState};
use fv6_fs_types::{BLOCK_SIZE, BlockNo, LOG_HEADER_SLOTS, LogHeader};
use mutex_api::{Condvar, Mutex};

/// In-memory log state, guarded by the log mutex.
pub struct LogState {
    /// File-system operations currently inside `begin_op`..`end_op`.
    outstanding: usize,
    /// A commit is running; new operations must wait.
    committing: bool,
    /// Number of logged blocks.
    len: usize,
    /// Home block number of each logged block.
    targets: [u32; LOG_HEADER_SLOTS],
}

/// The write-ahead log over a buffer cache.
pub struct Wal<'c, Device, ListMutex, DataMutex, StateMutex, Cv, const N: usize>
where
    ListMutex: Mutex<Data = CacheState<N>>,
    DataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
    StateMutex: Mutex<Data = LogState>,
{
    cache: &'c BufCache<'c, Device, ListMutex, DataMutex, N, BLOCK_SIZE>,
    state: StateMutex,
    cond: Cv,
    /// Header block number; scratch blocks follow it.
    start: usize,
    /// Scratch blocks available (log region size minus the header).
    capacity: usize,
    /// Worst-case blocks a single operation may dirty.
    max_op_blocks: usize,
}

impl<'c, Device, ListMutex, DataMutex, StateMutex, Cv, const N: usize>
    Wal<'c, Device, ListMutex, DataMutex, StateMutex, Cv, N>
where
    Device: BlockDevice<BLOCK_SIZE, Error = Infallible>,
    ListMutex: Mutex<Data = CacheState<N>>,
    DataMutex: Mutex<Data = BlockData<BLOCK_SIZE>>,
    StateMutex: Mutex<Data = LogState>,
    Cv: Condvar<StateMutex>,
{
    /// Creates a log over `cache` whose on-disk region is `nlog` blocks
    /// starting at `start`. Call [`Wal::recover`] before the first
    /// transaction.
    pub fn new(
        cache: &'c BufCache<'c, Device, ListMutex, DataMutex, N, BLOCK_SIZE>,
        start: usize,
        nlog: usize,
        max_op_blocks: usize,
    ) -> Self {
        let capacity = nlog - 1;
        assert!(capacity <= LOG_HEADER_SLOTS);
        assert!(max_op_blocks <= capacity);
        Self {
            cache,
            state: StateMutex::new(LogState {
                outstanding: 0,
                committing: false,
                len: 0,
                targets: [0; LOG_HEADER_SLOTS],
            }),
            cond: Cv::new(),
            start,
            capacity,
            max_op_blocks,
        }
    }

    /// Replays a committed-but-not-installed transaction left behind by a
    /// crash, then clears the header. Idempotent; run once at mount.
    pub fn recover(&self) {
        let (len, targets) = self.read_head();
        self.install(len, &targets, true);
        self.write_head(0, &targets);
    }

    /// Marks the start of a file-system operation.
    ///
    /// Waits while a commit is in progress, or while this operation's
    /// worst-case reservation (`max_op_blocks` per outstanding operation)
    /// might overflow the log.
    pub fn begin_op(&self) {
        let mut state = self.state.lock();
        loop {
            if state.committing {
                state = self.cond.wait(state);
                continue;
            }
            if state.len + (state.outstanding + 1) * self.max_op_blocks > self.capacity {
                // This op might exhaust log space; wait for the commit.
                state = self.cond.wait(state);
                continue;
            }
            state.outstanding += 1;
            return;
        }
    }

    /// Marks the end of a file-system operation; commits the group if
    /// this was the last outstanding one.
    pub fn end_op(&self) {
        let do_commit = {
            let mut state = self.state.lock();
            assert!(!state.committing);
            state.outstanding -= 1;
            if state.outstanding == 0 {
                state.committing = true;
                true
            } else {
                // begin_op may be waiting for log space, and decrementing
                // outstanding has shrunk the reservation.
                self.cond.notify_all();
                false
            }
        };

        if do_commit {
            // Commit runs without the log mutex: the committing flag keeps
            // every other writer out, and sleeping under a held mutex is
            // not allowed in the kernel instantiation.
            self.commit();
            let mut state = self.state.lock();
            state.committing = false;
            self.cond.notify_all();
        }
    }

    /// Records `guard`'s block as part of the current transaction in
    /// place of writing it to disk.
    ///
    /// The caller must be inside `begin_op`..`end_op`. Re-logging a block
    /// the transaction already holds absorbs into the existing slot.
    pub fn write<'r>(
        &self,
        guard: &mut block_io::BufGuard<'c, 'r, Device, ListMutex, DataMutex, N, BLOCK_SIZE, true>,
    ) {
        let index = u32::try_from(guard.index()).unwrap();
        let mut state = self.state.lock();
        assert!(state.len < self.capacity, "transaction too big");
        assert!(state.outstanding > 0, "log write outside of transaction");

        let len = state.len;
        let slot = state.targets[..len]
            .iter()
            .position(|&t| t == index) // absorption
            .unwrap_or(len);
        state.targets[slot] = index;
        if slot == len {
            // A new block joins the transaction; keep it cached until the
            // commit installs it.
            guard.pin();
            state.len += 1;
        }
    }

    /// Number of blocks the open transactions have logged so far.
    pub fn pending_blocks(&self) -> usize {
        self.state.lock().len
    }

    fn commit(&self) {
        let (len, targets) = {
            let state = self.state.lock();
            (state.len, state.targets)
        };
        if len == 0 {
            return;
        }

        self.write_body(len, &targets); // dirty cache blocks -> log scratch
        self.write_head(len, &targets); // header write: the commit point
        self.install(len, &targets, false); // scratch -> home locations
        self.state.lock().len = 0;
        self.write_head(0, &targets); // transaction installed
    }

    /// Copies each logged block's cached bytes to its scratch block.
    fn write_body(&self, len: usize, targets: &[u32; LOG_HEADER_SLOTS]) {
        for (i, &target) in targets.iter().take(len).enumerate() {
            let mut home = self.cache.get(target as usize);
            let Ok(home_g) = home.lock().read();
            let mut scratch = self.cache.get(self.start + 1 + i);
            let mut scratch_g = scratch.lock().set_bytes(home_g.bytes());
            let Ok(()) = scratch_g.write();
        }
    }

    /// Copies each scratch block to its home location; on the commit path
    /// (not recovery) also unpins the cached home block.
    fn install(&self, len: usize, targets: &[u32; LOG_HEADER_SLOTS], recovering: bool) {
        for (i, &target) in targets.iter().take(len).enumerate() {
            let mut scratch = self.cache.get(self.start + 1 + i);
            let Ok(scratch_g) = scratch.lock().read();
            let mut home = self.cache.get(target as usize);
            let mut home_g = home.lock().set_bytes(scratch_g.bytes());
            let Ok(()) = home_g.write();
            if !recovering {
                assert!(home_g.ref_count() >= 2);
                unsafe { home_g.unpin() };
            }
        }
    }

    fn read_head(&self) -> (usize, [u32; LOG_HEADER_SLOTS]) {
        let mut buf = self.cache.get(self.start);
        let Ok(guard) = buf.lock().read();
        let header: &LogHeader = guard.data();
        let mut targets = [0; LOG_HEADER_SLOTS];
        for (slot, &home) in targets.iter_mut().zip(header.targets()) {
            *slot = home;
        }
        (header.len(), targets)
    }

    fn write_head(&self, len: usize, targets: &[u32; LOG_HEADER_SLOTS]) {
        let mut buf = self.cache.get(self.start);
        let mut guard = buf.lock().zeroed();
        let header: &mut LogHeader = guard.data_mut();
        header.set_len(len);
        for (i, &target) in targets.iter().take(len).enumerate() {
            header.set_target(i, BlockNo::new(target));
        }
        let Ok(()) = guard.write();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc, Mutex as StdSyncMutex,
        atomic::{AtomicIsize, Ordering},
        mpsc,
    };
    use std::time::Duration;

    use block_io::Slot;
    use mutex_api::host::{StdCondvar, StdMutex};

    use super::*;

    const NSLOT: usize = 12;
    /// Log region: header at 2, scratch 3..=12.
    const LOG_START: usize = 2;
    const NLOG: usize = 11;
    const MAX_OP: usize = 3;
    /// First home block used by the tests.
    const DATA0: usize = 100;

    /// Backing store shared across "reboots".
    #[derive(Clone, Default)]
    struct Disk(Arc<StdSyncMutex<std::collections::HashMap<usize, [u8; BLOCK_SIZE]>>>);

    impl Disk {
        fn block(&self, index: usize) -> [u8; BLOCK_SIZE] {
            self.0.lock().unwrap().get(&index).copied().unwrap_or([0; BLOCK_SIZE])
        }

        fn snapshot(&self) -> std::collections::HashMap<usize, [u8; BLOCK_SIZE]> {
            self.0.lock().unwrap().clone()
        }
    }

    /// A disk whose power can be cut: after `budget` more writes, further
    /// writes are silently lost, like a crash mid-sequence.
    #[derive(Clone)]
    struct CutDevice {
        disk: Disk,
        budget: Arc<AtomicIsize>,
    }

    impl CutDevice {
        fn new(disk: Disk) -> Self {
            Self {
                disk,
                budget: Arc::new(AtomicIsize::new(isize::MAX)),
            }
        }

        fn cut_after(&self, writes: isize) {
            self.budget.store(writes, Ordering::SeqCst);
        }
    }

    impl BlockDevice<BLOCK_SIZE> for CutDevice {
        type Error = Infallible;

        fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
            *data = self.disk.block(index);
            Ok(())
        }

        fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
            if self.budget.fetch_sub(1, Ordering::SeqCst) > 0 {
                self.disk.0.lock().unwrap().insert(index, *data);
            }
            Ok(())
        }
    }

    type TestCache<'s> = BufCache<
        's,
        CutDevice,
        StdMutex<CacheState<NSLOT>>,
        StdMutex<BlockData<BLOCK_SIZE>>,
        NSLOT,
        BLOCK_SIZE,
    >;
    type TestWal<'c> = Wal<
        'c,
        CutDevice,
        StdMutex<CacheState<NSLOT>>,
        StdMutex<BlockData<BLOCK_SIZE>>,
        StdMutex<LogState>,
        StdCondvar,
        NSLOT,
    >;

    fn new_slots() -> [Slot<StdMutex<BlockData<BLOCK_SIZE>>>; NSLOT] {
        core::array::from_fn(|_| Slot::new(StdMutex::new(BlockData::zeroed())))
    }

    fn log_len_on_disk(disk: &Disk) -> usize {
        u32::from_le_bytes(disk.block(LOG_START)[..4].try_into().unwrap()) as usize
    }

    /// Writes `fill` into home block `index` through the log.
    fn tx_write(cache: &TestCache, wal: &TestWal, index: usize, fill: u8) {
        let mut buf = cache.get(index);
        let mut guard = buf.lock().read().unwrap();
        guard.bytes_mut().fill(fill);
        wal.write(&mut guard);
    }

    #[test]
    fn commit_installs_all_blocks() {
        let disk = Disk::default();
        let device = CutDevice::new(disk.clone());
        let slots = new_slots();
        let cache: TestCache = BufCache::new(device, &slots);
        let wal: TestWal = Wal::new(&cache, LOG_START, NLOG, MAX_OP);
        wal.recover();

        wal.begin_op();
        for (i, fill) in [(0, 0xa1), (1, 0xa2), (2, 0xa3)] {
            tx_write(&cache, &wal, DATA0 + i, fill);
        }
        // Nothing on disk before the transaction ends.
        assert_eq!(disk.block(DATA0), [0; BLOCK_SIZE]);
        wal.end_op();

        assert_eq!(disk.block(DATA0), [0xa1; BLOCK_SIZE]);
        assert_eq!(disk.block(DATA0 + 1), [0xa2; BLOCK_SIZE]);
        assert_eq!(disk.block(DATA0 + 2), [0xa3; BLOCK_SIZE]);
        // Header cleared after install.
        assert_eq!(log_len_on_disk(&disk), 0);
    }

    #[test]
    fn crash_before_commit_point_is_a_rollback() {
        let disk = Disk::default();
        let device = CutDevice::new(disk.clone());
        let slots = new_slots();
        let cache: TestCache = BufCache::new(device.clone(), &slots);
        let wal: TestWal = Wal::new(&cache, LOG_START, NLOG, MAX_OP);
        wal.recover();

        wal.begin_op();
        tx_write(&cache, &wal, DATA0, 0xbb);
        tx_write(&cache, &wal, DATA0 + 1, 0xbc);
        // Power fails after the scratch copies, before the header write.
        device.cut_after(2);
        wal.end_op();
        assert_eq!(log_len_on_disk(&disk), 0);

        // Reboot: fresh cache and log over the surviving disk state.
        let slots2 = new_slots();
        let cache2: TestCache = BufCache::new(CutDevice::new(disk.clone()), &slots2);
        let wal2: TestWal = Wal::new(&cache2, LOG_START, NLOG, MAX_OP);
        wal2.recover();

        // The transaction never happened.
        assert_eq!(disk.block(DATA0), [0; BLOCK_SIZE]);
        assert_eq!(disk.block(DATA0 + 1), [0; BLOCK_SIZE]);
    }

    #[test]
    fn crash_after_commit_point_replays_all_blocks() {
        let disk = Disk::default();
        let device = CutDevice::new(disk.clone());
        let slots = new_slots();
        let cache: TestCache = BufCache::new(device.clone(), &slots);
        let wal: TestWal = Wal::new(&cache, LOG_START, NLOG, MAX_OP);
        wal.recover();

        // A transaction dirtying four blocks; power fails right after the
        // header write (4 scratch copies + 1 header), before any home
        // write lands.
        wal.begin_op();
        for i in 0..4 {
            tx_write(&cache, &wal, DATA0 + i, 0xc0 + i as u8);
        }
        device.cut_after(5);
        wal.end_op();

        // The homes are untouched but the commit point was reached.
        for i in 0..4 {
            assert_eq!(disk.block(DATA0 + i), [0; BLOCK_SIZE]);
        }
        assert_eq!(log_len_on_disk(&disk), 4);

        // Reboot + recovery replays the whole group.
        let slots2 = new_slots();
        let cache2: TestCache = BufCache::new(CutDevice::new(disk.clone()), &slots2);
        let wal2: TestWal = Wal::new(&cache2, LOG_START, NLOG, MAX_OP);
        wal2.recover();

        for i in 0..4 {
            assert_eq!(disk.block(DATA0 + i), [0xc0 + i as u8; BLOCK_SIZE]);
        }
        assert_eq!(log_len_on_disk(&disk), 0);
    }

    #[test]
    fn replaying_twice_equals_replaying_once() {
        let disk = Disk::default();
        let device = CutDevice::new(disk.clone());
        let slots = new_slots();
        let cache: TestCache = BufCache::new(device.clone(), &slots);
        let wal: TestWal = Wal::new(&cache, LOG_START, NLOG, MAX_OP);
        wal.recover();

        wal.begin_op();
        tx_write(&cache, &wal, DATA0, 0xd1);
        tx_write(&cache, &wal, DATA0 + 1, 0xd2);
        device.cut_after(3); // scratch x2 + header; homes lost
        wal.end_op();

        // Reference: one clean recovery.
        let reference = {
            let disk = Disk(Arc::new(StdSyncMutex::new(disk.snapshot())));
            let slots = new_slots();
            let cache: TestCache = BufCache::new(CutDevice::new(disk.clone()), &slots);
            let wal: TestWal = Wal::new(&cache, LOG_START, NLOG, MAX_OP);
            wal.recover();
            disk.snapshot()
        };

        // Crash again in the middle of recovery (homes installed, header
        // clear lost), then recover a second time.
        let twice = {
            let disk = Disk(Arc::new(StdSyncMutex::new(disk.snapshot())));
            let device = CutDevice::new(disk.clone());
            let slots = new_slots();
            let cache: TestCache = BufCache::new(device.clone(), &slots);
            let wal: TestWal = Wal::new(&cache, LOG_START, NLOG, MAX_OP);
            device.cut_after(2); // both home installs land, header clear lost
            wal.recover();
            assert_eq!(log_len_on_disk(&disk), 2, "header survived the cut");

            let slots2 = new_slots();
            let cache2: TestCache = BufCache::new(CutDevice::new(disk.clone()), &slots2);
            let wal2: TestWal = Wal::new(&cache2, LOG_START, NLOG, MAX_OP);
            wal2.recover();
            disk.snapshot()
        };

        assert_eq!(reference, twice);
    }

    #[test]
    fn absorption_consumes_one_slot() {
        let disk = Disk::default();
        let device = CutDevice::new(disk.clone());
        let slots = new_slots();
        let cache: TestCache = BufCache::new(device, &slots);
        let wal: TestWal = Wal::new(&cache, LOG_START, NLOG, MAX_OP);
        wal.recover();

        wal.begin_op();
        tx_write(&cache, &wal, DATA0, 1);
        tx_write(&cache, &wal, DATA0, 2);
        tx_write(&cache, &wal, DATA0, 3);
        assert_eq!(wal.pending_blocks(), 1);
        wal.end_op();

        // The last value wins.
        assert_eq!(disk.block(DATA0), [3; BLOCK_SIZE]);
        // Only scratch slot 0 was used.
        assert_eq!(disk.block(LOG_START + 1), [3; BLOCK_SIZE]);
        assert_eq!(disk.block(LOG_START + 2), [0; BLOCK_SIZE]);
    }

    #[test]
    fn group_commit_waits_for_all_outstanding_ops() {
        let disk = Disk::default();
        let device = CutDevice::new(disk.clone());
        let slots = new_slots();
        let cache: TestCache = BufCache::new(device, &slots);
        let wal: TestWal = Wal::new(&cache, LOG_START, NLOG, MAX_OP);
        wal.recover();

        wal.begin_op();
        wal.begin_op();
        tx_write(&cache, &wal, DATA0, 0xe1);
        wal.end_op();
        // First end_op must not commit while the second op is open.
        assert_eq!(disk.block(DATA0), [0; BLOCK_SIZE]);

        tx_write(&cache, &wal, DATA0 + 1, 0xe2);
        wal.end_op();
        assert_eq!(disk.block(DATA0), [0xe1; BLOCK_SIZE]);
        assert_eq!(disk.block(DATA0 + 1), [0xe2; BLOCK_SIZE]);
    }

    #[test]
    fn begin_op_blocks_while_log_reservation_is_full() {
        let disk = Disk::default();
        let device = CutDevice::new(disk.clone());
        let slots = new_slots();
        let cache: TestCache = BufCache::new(device, &slots);
        let wal: TestWal = Wal::new(&cache, LOG_START, NLOG, MAX_OP);
        wal.recover();

        // Three ops reserve 9 of 10 scratch blocks; a fourth would need 12.
        wal.begin_op();
        wal.begin_op();
        wal.begin_op();

        let (started_tx, started_rx) = mpsc::channel();
        std::thread::scope(|scope| {
            let wal = &wal;
            scope.spawn(move || {
                wal.begin_op();
                started_tx.send(()).unwrap();
                wal.end_op();
            });

            // The fourth op stays parked until an outstanding op ends.
            assert!(started_rx.recv_timeout(Duration::from_millis(100)).is_err());
            wal.end_op();
            started_rx
                .recv_timeout(Duration::from_secs(10))
                .expect("fourth begin_op should proceed after end_op");

            wal.end_op();
            wal.end_op();
        });
    }
}
