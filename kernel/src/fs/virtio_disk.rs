//! Driver for qemu's virtio disk device (legacy MMIO interface).
//!
//! The buffer cache calls [`read`]/[`write`], which are synchronous
//! from the caller's point of view: they queue a three-descriptor
//! chain (request header, data, one-byte status) and sleep until the
//! completion interrupt marks the request done.

use core::{
    array, ptr,
    ptr::NonNull,
    sync::atomic::Ordering,
};

use crate::{
    memory::layout::VIRTIO0,
    sync::{Once, SpinLock, SpinLockCondVar},
};

use super::virtio::{
    BLK_SECTOR_SIZE, ConfigStatus, DeviceFeatures, MmioRegister, VirtioBlkReq, VirtioBlkReqType,
    VirtqAvail, VirtqDesc, VirtqDescFlags, VirtqUsed,
};

use fv6_fs_types::BLOCK_SIZE;

/// Number of virtio descriptors; must be a power of two.
const NUM: usize = 8;

/// Signalled when descriptors are freed.
static DESC_FREED: SpinLockCondVar = SpinLockCondVar::new();
/// Signalled when the request whose chain starts at the indexed
/// descriptor completes.
static REQ_DONE: [SpinLockCondVar; NUM] = [const { SpinLockCondVar::new() }; NUM];

struct TrackInfo {
    /// Device-written completion status; 0 is success.
    status: u8,
    in_progress: bool,
}

struct Disk {
    /// DMA descriptors, by which the driver tells the device where to
    /// read and write. Most commands are a chain of a few of these.
    desc: NonNull<[VirtqDesc; NUM]>,
    /// Ring of descriptor numbers (chain heads) the driver wants
    /// processed.
    avail: NonNull<VirtqAvail<NUM>>,
    /// Ring of descriptor numbers (chain heads) the device has finished.
    used: NonNull<VirtqUsed<NUM>>,

    free: [bool; NUM],
    used_idx: u16,

    /// In-flight request state, indexed by the chain's first descriptor.
    info: [TrackInfo; NUM],
    /// Request headers, one-for-one with descriptors for convenience.
    ops: [VirtioBlkReq; NUM],
}

unsafe impl Send for Disk {}

static DISK: Once<SpinLock<Disk>> = Once::new();

fn read_reg(reg: MmioRegister) -> u32 {
    unsafe { ptr::with_exposed_provenance::<u32>(VIRTIO0 + reg as usize).read_volatile() }
}

fn write_reg(reg: MmioRegister, value: u32) {
    unsafe {
        ptr::with_exposed_provenance_mut::<u32>(VIRTIO0 + reg as usize).write_volatile(value);
    }
}

fn addr_low<T>(p: NonNull<T>) -> u32 {
    (p.addr().get() & 0xffff_ffff) as u32
}

fn addr_high<T>(p: NonNull<T>) -> u32 {
    ((p.addr().get() >> 32) & 0xffff_ffff) as u32
}

pub fn init() {
    assert_eq!(read_reg(MmioRegister::MagicValue), 0x7472_6976);
    assert_eq!(read_reg(MmioRegister::Version), 2);
    assert_eq!(read_reg(MmioRegister::DeviceId), 2);
    assert_eq!(read_reg(MmioRegister::VendorId), 0x554d_4551);

    let mut status = ConfigStatus::empty();

    // reset device.
    write_reg(MmioRegister::Status, status.bits());

    status |= ConfigStatus::ACKNOWLEDGE;
    write_reg(MmioRegister::Status, status.bits());

    status |= ConfigStatus::DRIVER;
    write_reg(MmioRegister::Status, status.bits());

    // negotiate features.
    let mut features = DeviceFeatures::from_bits_retain(read_reg(MmioRegister::DeviceFeatures));
    features.remove(DeviceFeatures::BLK_RO);
    features.remove(DeviceFeatures::BLK_SCSI);
    features.remove(DeviceFeatures::BLK_CONFIG_WCE);
    features.remove(DeviceFeatures::BLK_MQ);
    features.remove(DeviceFeatures::ANY_LAYOUT);
    features.remove(DeviceFeatures::RING_EVENT_IDX);
    features.remove(DeviceFeatures::RING_INDIRECT_DESC);
    write_reg(MmioRegister::DriverFeatures, features.bits());

    // feature negotiation complete.
    status |= ConfigStatus::FEATURES_OK;
    write_reg(MmioRegister::Status, status.bits());

    // re-read to ensure FEATURES_OK stuck.
    status = ConfigStatus::from_bits_retain(read_reg(MmioRegister::Status));
    assert!(status.contains(ConfigStatus::FEATURES_OK));

    // initialise queue 0.
    write_reg(MmioRegister::QueueSel, 0);
    assert_eq!(read_reg(MmioRegister::QueueReady), 0, "queue in use");
    let max = read_reg(MmioRegister::QueueNumMax);
    assert!(max != 0, "no virtio queue 0");
    assert!(max as usize >= NUM, "virtio queue too short");
    write_reg(MmioRegister::QueueNum, NUM as u32);

    // one zeroed page for each shared structure.
    let desc: NonNull<[VirtqDesc; NUM]> =
        crate::memory::page::alloc_zeroed_page().unwrap().cast();
    let avail: NonNull<VirtqAvail<NUM>> =
        crate::memory::page::alloc_zeroed_page().unwrap().cast();
    let used: NonNull<VirtqUsed<NUM>> =
        crate::memory::page::alloc_zeroed_page().unwrap().cast();

    write_reg(MmioRegister::QueueDescLow, addr_low(desc));
    write_reg(MmioRegister::QueueDescHigh, addr_high(desc));
    write_reg(MmioRegister::DriverDescLow, addr_low(avail));
    write_reg(MmioRegister::DriverDescHigh, addr_high(avail));
    write_reg(MmioRegister::DeviceDescLow, addr_low(used));
    write_reg(MmioRegister::DeviceDescHigh, addr_high(used));

    write_reg(MmioRegister::QueueReady, 1);

    // tell the device we are completely ready.
    status |= ConfigStatus::DRIVER_OK;
    write_reg(MmioRegister::Status, status.bits());

    DISK.init(SpinLock::new(Disk {
        desc,
        avail,
        used,
        free: [true; NUM],
        used_idx: 0,
        info: array::from_fn(|_| TrackInfo {
            status: 0,
            in_progress: false,
        }),
        ops: array::from_fn(|_| VirtioBlkReq {
            ty: VirtioBlkReqType::In,
            reserved: 0,
            sector: 0,
        }),
    }));
}

impl Disk {
    fn desc_mut(&mut self, i: usize) -> &mut VirtqDesc {
        unsafe { &mut self.desc.as_mut()[i] }
    }

    /// Finds a free descriptor, marks it taken.
    fn alloc_desc(&mut self) -> Option<usize> {
        let idx = self.free.iter().position(|free| *free)?;
        self.free[idx] = false;
        Some(idx)
    }

    fn free_desc(&mut self, i: usize) {
        assert!(i < NUM);
        assert!(!self.free[i], "freeing free descriptor");
        *self.desc_mut(i) = VirtqDesc {
            addr: 0,
            len: 0,
            flags: VirtqDescFlags::empty(),
            next: 0,
        };
        self.free[i] = true;
        DESC_FREED.notify();
    }

    fn free_chain(&mut self, mut i: usize) {
        loop {
            let desc = self.desc_mut(i);
            let flags = desc.flags;
            let next = desc.next;
            self.free_desc(i);
            if !flags.contains(VirtqDescFlags::NEXT) {
                break;
            }
            i = next.into();
        }
    }

    /// Allocates the three descriptors every disk transfer uses (they
    /// need not be contiguous).
    fn alloc3_desc(&mut self) -> Option<[usize; 3]> {
        let mut idx = [0; 3];
        for i in 0..3 {
            match self.alloc_desc() {
                Some(x) => idx[i] = x,
                None => {
                    for &j in &idx[..i] {
                        self.free_desc(j);
                    }
                    return None;
                }
            }
        }
        Some(idx)
    }

    fn send_request(&mut self, offset: usize, data: &[u8], write: bool, idx: [usize; 3]) {
        assert_eq!(offset % BLK_SECTOR_SIZE, 0);
        assert_eq!(data.len(), BLOCK_SIZE);
        let sector = (offset / BLK_SECTOR_SIZE) as u64;

        self.ops[idx[0]] = VirtioBlkReq {
            ty: if write {
                VirtioBlkReqType::Out
            } else {
                VirtioBlkReqType::In
            },
            reserved: 0,
            sector,
        };
        let req_addr = ptr::from_ref(&self.ops[idx[0]]).addr();

        *self.desc_mut(idx[0]) = VirtqDesc {
            addr: req_addr as u64,
            len: size_of::<VirtioBlkReq>() as u32,
            flags: VirtqDescFlags::NEXT,
            next: idx[1] as u16,
        };

        *self.desc_mut(idx[1]) = VirtqDesc {
            addr: data.as_ptr().addr() as u64,
            len: BLOCK_SIZE as u32,
            // The device reads the buffer on a write and writes it on a
            // read.
            flags: if write {
                VirtqDescFlags::NEXT
            } else {
                VirtqDescFlags::NEXT | VirtqDescFlags::WRITE
            },
            next: idx[2] as u16,
        };

        // device writes 0 on success.
        self.info[idx[0]].status = 0xff;
        let status_addr = ptr::from_ref(&self.info[idx[0]].status).addr();
        *self.desc_mut(idx[2]) = VirtqDesc {
            addr: status_addr as u64,
            len: 1,
            flags: VirtqDescFlags::WRITE,
            next: 0,
        };

        self.info[idx[0]].in_progress = true;

        // publish the chain head in the available ring.
        let avail = unsafe { self.avail.as_mut() };
        let slot = avail.idx.load(Ordering::Relaxed) as usize % NUM;
        avail.ring[slot] = idx[0] as u16;
        avail.idx.fetch_add(1, Ordering::AcqRel);

        write_reg(MmioRegister::QueueNotify, 0); // queue number
    }
}

fn read_or_write(offset: usize, data: &[u8], write: bool) {
    let mut disk = DISK.get().lock();

    // Block operations use three descriptors: one for the
    // type/reserved/sector header, one for the data, one for the
    // one-byte status result.
    let idx = loop {
        match disk.alloc3_desc() {
            Some(idx) => break idx,
            None => disk = DESC_FREED.wait(disk),
        }
    };

    // Queue the request, then sleep until handle_interrupt() says it
    // has finished.
    disk.send_request(offset, data, write, idx);
    while disk.info[idx[0]].in_progress {
        disk = REQ_DONE[idx[0]].wait(disk);
    }
    assert_eq!(disk.info[idx[0]].status, 0, "disk request failed");

    disk.free_chain(idx[0]);
}

/// Reads one file-system block from byte `offset` on the disk.
pub fn read(offset: usize, data: &mut [u8]) {
    read_or_write(offset, data, false);
}

/// Writes one file-system block at byte `offset` on the disk.
pub fn write(offset: usize, data: &[u8]) {
    read_or_write(offset, data, true);
}

/// Completion interrupt: walk the used ring and wake the sleepers.
pub fn handle_interrupt() {
    let mut disk = DISK.get().lock();

    // Telling the device we've seen this interrupt may race with the
    // device adding new used-ring entries; processing them in this call
    // and having nothing to do in the next one is harmless.
    write_reg(
        MmioRegister::InterruptAck,
        read_reg(MmioRegister::InterruptStatus) & 0x3,
    );

    // The device increments used.idx as it finishes chains.
    let used = disk.used;
    while disk.used_idx != unsafe { used.as_ref() }.idx.load(Ordering::Acquire) {
        let id = unsafe { used.as_ref() }.ring[disk.used_idx as usize % NUM].id as usize;

        let info = &mut disk.info[id];
        info.in_progress = false; // the device is done with the buffer
        REQ_DONE[id].notify();

        disk.used_idx += 1;
    }
}
