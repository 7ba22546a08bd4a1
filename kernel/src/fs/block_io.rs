//! The buffer cache, bound to the virtio disk.

use core::convert::Infallible;

use block_io::{BlockData, BlockDevice, BufCache, CacheState, Slot};
use fv6_fs_types::BlockNo;

use crate::{
    param::NBUF,
    sync::{Once, SleepLock, SpinLock},
};

use super::{DeviceNo, virtio_disk};

pub use fv6_fs_types::BLOCK_SIZE;

pub struct VirtioDisk;

impl BlockDevice<BLOCK_SIZE> for VirtioDisk {
    type Error = Infallible;

    fn read(&self, index: usize, data: &mut [u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        virtio_disk::read(index * BLOCK_SIZE, data);
        Ok(())
    }

    fn write(&self, index: usize, data: &[u8; BLOCK_SIZE]) -> Result<(), Self::Error> {
        virtio_disk::write(index * BLOCK_SIZE, data);
        Ok(())
    }
}

pub type CacheMutex = SpinLock<CacheState<NBUF>>;
pub type DataMutex = SleepLock<BlockData<BLOCK_SIZE>>;

pub type Cache = BufCache<'static, VirtioDisk, CacheMutex, DataMutex, NBUF, BLOCK_SIZE>;
pub type BufRef = block_io::BufRef<'static, VirtioDisk, CacheMutex, DataMutex, NBUF, BLOCK_SIZE>;
pub type BufGuard<'r, const VALID: bool> =
    block_io::BufGuard<'static, 'r, VirtioDisk, CacheMutex, DataMutex, NBUF, BLOCK_SIZE, VALID>;

/// Buffer payloads, statically allocated; identity and LRU state live
/// inside the cache's spin lock.
static SLOTS: [Slot<DataMutex>; NBUF] =
    [const { Slot::new(SleepLock::new(BlockData::zeroed())) }; NBUF];

static CACHE: Once<Cache> = Once::new();

pub fn init() {
    CACHE.init(BufCache::new(VirtioDisk, &SLOTS));
}

pub(super) fn cache() -> &'static Cache {
    CACHE.get()
}

/// A referenced (unlocked) buffer holding `block_no` of device `dev`.
pub fn get(dev: DeviceNo, block_no: BlockNo) -> BufRef {
    match dev {
        DeviceNo::ROOT => cache().get(block_no.as_index()),
        _ => panic!("unknown device: dev={}", dev.value()),
    }
}
