//! On-the-wire structures of the legacy virtio MMIO block device.

use core::sync::atomic::AtomicU16;

use bitflags::bitflags;

/// Disk sector size; the file system's blocks are a multiple of this.
pub(super) const BLK_SECTOR_SIZE: usize = 512;

/// MMIO control register offsets from the device base.
#[derive(Debug, Clone, Copy)]
#[repr(usize)]
pub(super) enum MmioRegister {
    /// 0x74726976
    MagicValue = 0x000,
    /// version; should be 2
    Version = 0x004,
    /// device type; 2 is disk
    DeviceId = 0x008,
    VendorId = 0x00c,
    DeviceFeatures = 0x010,
    DriverFeatures = 0x020,
    /// select queue, write-only
    QueueSel = 0x030,
    /// max size of current queue, read-only
    QueueNumMax = 0x034,
    /// size of current queue, write-only
    QueueNum = 0x038,
    /// ready bit
    QueueReady = 0x044,
    /// write-only
    QueueNotify = 0x050,
    /// read-only
    InterruptStatus = 0x060,
    /// write-only
    InterruptAck = 0x064,
    /// read/write
    Status = 0x070,
    /// physical address for the descriptor table, write-only
    QueueDescLow = 0x080,
    QueueDescHigh = 0x084,
    /// physical address for the available ring, write-only
    DriverDescLow = 0x090,
    DriverDescHigh = 0x094,
    /// physical address for the used ring, write-only
    DeviceDescLow = 0x0a0,
    DeviceDescHigh = 0x0a4,
}

bitflags! {
    /// Device status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) struct ConfigStatus: u32 {
        const ACKNOWLEDGE = 1;
        const DRIVER = 2;
        const DRIVER_OK = 4;
        const FEATURES_OK = 8;
    }
}

bitflags! {
    /// Device feature bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) struct DeviceFeatures: u32 {
        /// Disk is read-only.
        const BLK_RO = 1 << 5;
        /// Supports the SCSI command passthrough.
        const BLK_SCSI = 1 << 7;
        /// Writeback mode available in config.
        const BLK_CONFIG_WCE = 1 << 11;
        /// Supports more than one virtqueue.
        const BLK_MQ = 1 << 12;
        const ANY_LAYOUT = 1 << 27;
        const RING_INDIRECT_DESC = 1 << 28;
        const RING_EVENT_IDX = 1 << 29;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(super) struct VirtqDescFlags: u16 {
        /// Chained with another descriptor.
        const NEXT = 1;
        /// Device writes (vs reads) this buffer.
        const WRITE = 2;
    }
}

/// One DMA descriptor.
#[repr(C)]
pub(super) struct VirtqDesc {
    pub addr: u64,
    pub len: u32,
    pub flags: VirtqDescFlags,
    pub next: u16,
}

/// The ring in which the driver publishes descriptor chains it wants
/// the device to process.
#[repr(C)]
pub(super) struct VirtqAvail<const N: usize> {
    /// Always zero.
    pub flags: u16,
    /// Driver increments when it adds a ring entry.
    pub idx: AtomicU16,
    pub ring: [u16; N],
    pub unused: u16,
}

#[repr(C)]
pub(super) struct VirtqUsedElem {
    /// Index of the start of the completed chain.
    pub id: u32,
    pub len: u32,
}

/// The ring in which the device reports completed chains.
#[repr(C)]
pub(super) struct VirtqUsed<const N: usize> {
    /// Always zero.
    pub flags: u16,
    /// Device increments when it adds a ring entry.
    pub idx: AtomicU16,
    pub ring: [VirtqUsedElem; N],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(super) enum VirtioBlkReqType {
    /// Read the disk.
    In = 0,
    /// Write the disk.
    Out = 1,
}

/// The first descriptor of every block request chain.
#[repr(C)]
pub(super) struct VirtioBlkReq {
    pub ty: VirtioBlkReqType,
    pub reserved: u32,
    pub sector: u64,
}
