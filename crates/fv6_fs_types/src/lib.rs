//! On-disk data types of the fv6 file system.
//!
//! Disk layout, in `BLOCK_SIZE` units:
//!
//! | block no.       | # of blocks     | content      | type            |
//! |-----------------|-----------------|--------------|-----------------|
//! | 0               | 1               | boot block   | (unused)        |
//! | 1               | 1               | super block  | [`SuperBlock`]  |
//! | `sb.logstart`   | `sb.nlog`       | log          | [`LogHeader`] + scratch blocks |
//! | `sb.inodestart` | `ninodes / IPB` | inode table  | [`InodeBlock`]  |
//! | `sb.bmapstart`  | `size / BPB`    | free bitmap  | [`BitmapBlock`] |
//! | ...             | `sb.nblocks`    | data blocks  | raw bytes       |
//!
//! Everything here is plain-old-data viewed in place over cached block
//! bytes; the kernel and mkfs share these definitions so the format has a
//! single source of truth.
#![cfg_attr(not(test), no_std)]

use dataview::{Pod, PodMethods as _};

/// Disk block size in bytes.
pub const BLOCK_SIZE: usize = 1024;

/// Number of data blocks referenced directly from an inode.
pub const NDIRECT: usize = 12;

/// Number of data blocks referenced through the indirect block.
pub const NINDIRECT: usize = BLOCK_SIZE / size_of::<u32>();

/// Maximum file length in blocks.
pub const MAX_FILE_BLOCKS: usize = NDIRECT + NINDIRECT;

/// Inodes per inode-table block.
pub const IPB: usize = BLOCK_SIZE / size_of::<Dinode>();

/// Bitmap bits per bitmap block.
pub const BPB: usize = BLOCK_SIZE * 8;

/// Maximum length of a directory-entry name.
pub const NAME_LEN: usize = 14;

/// File type values stored in [`Dinode::ty`]. Zero means the inode is free.
pub const T_DIR: i16 = 1;
pub const T_FILE: i16 = 2;
pub const T_DEVICE: i16 = 3;

/// A disk block number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Pod)]
#[repr(transparent)]
pub struct BlockNo(u32);

impl BlockNo {
    pub const SUPER_BLOCK: Self = Self(1);

    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// An inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Pod)]
#[repr(transparent)]
pub struct InodeNo(u32);

impl InodeNo {
    /// The root directory. Inode 0 is reserved.
    pub const ROOT: Self = Self(1);

    pub const fn new(n: u32) -> Self {
        Self(n)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// The super block, stored at block 1 and checked at mount time.
#[derive(Debug, Clone, Pod)]
#[repr(C)]
pub struct SuperBlock {
    /// Must be [`SuperBlock::MAGIC`].
    pub magic: u32,
    /// Size of the file-system image in blocks.
    pub size: u32,
    /// Number of data blocks.
    pub nblocks: u32,
    /// Number of inodes.
    pub ninodes: u32,
    /// Number of log blocks (header included).
    pub nlog: u32,
    /// First log block.
    pub logstart: u32,
    /// First inode-table block.
    pub inodestart: u32,
    /// First free-bitmap block.
    pub bmapstart: u32,
}

impl SuperBlock {
    pub const MAGIC: u32 = 0x6676_3601;

    /// Block that holds inode `ino`.
    pub fn inode_block(&self, ino: InodeNo) -> BlockNo {
        BlockNo::new(self.inodestart + (ino.as_index() / IPB) as u32)
    }

    /// Bitmap block that holds the bit for data block index `bn`.
    pub fn bitmap_block(&self, bn: usize) -> BlockNo {
        BlockNo::new(self.bmapstart + (bn / BPB) as u32)
    }

    /// The log header block.
    pub fn log_header_block(&self) -> BlockNo {
        BlockNo::new(self.logstart)
    }

    /// The `i`th log scratch block (`i` counts from zero).
    pub fn log_scratch_block(&self, i: usize) -> BlockNo {
        BlockNo::new(self.logstart + 1 + u32::try_from(i).unwrap())
    }
}

/// Log slots available in one header block.
pub const LOG_HEADER_SLOTS: usize = BLOCK_SIZE / size_of::<u32>() - 1;

/// The log header block: a count followed by the home block number of each
/// logged block. Used both on disk and as the in-memory mirror the log
/// keeps before commit. A non-zero count on disk is a committed,
/// not-yet-installed transaction.
#[derive(Pod)]
#[repr(C)]
pub struct LogHeader {
    len: u32,
    targets: [u32; LOG_HEADER_SLOTS],
}
const _: () = assert!(size_of::<LogHeader>() == BLOCK_SIZE);

impl LogHeader {
    pub fn len(&self) -> usize {
        self.len as usize
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn set_len(&mut self, len: usize) {
        assert!(len <= LOG_HEADER_SLOTS);
        self.len = u32::try_from(len).unwrap();
    }

    /// Home block numbers of the logged blocks.
    pub fn targets(&self) -> &[u32] {
        &self.targets[..self.len()]
    }

    pub fn set_target(&mut self, i: usize, home: BlockNo) {
        self.targets[i] = home.value();
    }
}

/// An on-disk inode. `ty == 0` means the slot is free.
#[derive(Debug, Clone, Pod)]
#[repr(C)]
pub struct Dinode {
    /// File type ([`T_DIR`], [`T_FILE`], [`T_DEVICE`], or 0 = free).
    pub ty: i16,
    /// Major device number (`T_DEVICE` only).
    pub major: i16,
    /// Minor device number (`T_DEVICE` only).
    pub minor: i16,
    /// Number of directory entries referring to this inode.
    pub nlink: i16,
    /// File size in bytes.
    pub size: u32,
    /// `NDIRECT` direct block numbers, then one indirect block number.
    /// Zero marks an unallocated slot.
    addrs: [u32; NDIRECT + 1],
}
const _: () = assert!(BLOCK_SIZE % size_of::<Dinode>() == 0);

impl Dinode {
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.ty == 0
    }

    /// Claims a free on-disk inode with type `ty`.
    pub fn allocate(&mut self, ty: i16) {
        assert_eq!(self.ty, 0, "allocating in-use inode");
        *self = Self::zeroed();
        self.ty = ty;
    }

    /// The `i`th block slot; `i == NDIRECT` is the indirect slot.
    pub fn addr(&self, i: usize) -> Option<BlockNo> {
        match self.addrs[i] {
            0 => None,
            n => Some(BlockNo::new(n)),
        }
    }

    pub fn set_addr(&mut self, i: usize, bn: Option<BlockNo>) {
        self.addrs[i] = match bn {
            Some(bn) => {
                assert_ne!(bn.value(), 0);
                bn.value()
            }
            None => 0,
        };
    }
}

/// One block of the inode table.
#[derive(Pod)]
#[repr(transparent)]
pub struct InodeBlock([Dinode; IPB]);
const _: () = assert!(size_of::<InodeBlock>() == BLOCK_SIZE);

impl InodeBlock {
    pub fn inode(&self, ino: InodeNo) -> &Dinode {
        &self.0[ino.as_index() % IPB]
    }

    pub fn inode_mut(&mut self, ino: InodeNo) -> &mut Dinode {
        &mut self.0[ino.as_index() % IPB]
    }
}

/// One block of the free bitmap, one bit per data block.
#[derive(Pod)]
#[repr(transparent)]
pub struct BitmapBlock([u8; BLOCK_SIZE]);
const _: () = assert!(size_of::<BitmapBlock>() == BLOCK_SIZE);

impl BitmapBlock {
    /// Whether block index `n` (relative to this bitmap block) is in use.
    #[must_use]
    pub fn bit(&self, n: usize) -> bool {
        assert!(n < BPB);
        self.0[n / 8] & (1 << (n % 8)) != 0
    }

    pub fn set_bit(&mut self, n: usize) {
        assert!(n < BPB);
        self.0[n / 8] |= 1 << (n % 8);
    }

    pub fn clear_bit(&mut self, n: usize) {
        assert!(n < BPB);
        self.0[n / 8] &= !(1 << (n % 8));
    }
}

/// The payload of an indirect block: further data block numbers.
#[derive(Pod)]
#[repr(transparent)]
pub struct IndirectBlock([u32; NINDIRECT]);
const _: () = assert!(size_of::<IndirectBlock>() == BLOCK_SIZE);

impl IndirectBlock {
    pub fn get(&self, i: usize) -> Option<BlockNo> {
        match self.0[i] {
            0 => None,
            n => Some(BlockNo::new(n)),
        }
    }

    pub fn set(&mut self, i: usize, bn: Option<BlockNo>) {
        self.0[i] = bn.map_or(0, |bn| {
            assert_ne!(bn.value(), 0);
            bn.value()
        });
    }

    /// Takes every allocated entry, leaving the block empty.
    pub fn take_all(&mut self) -> impl Iterator<Item = BlockNo> + '_ {
        self.0.iter_mut().filter_map(|slot| {
            match core::mem::take(slot) {
                0 => None,
                n => Some(BlockNo::new(n)),
            }
        })
    }
}

/// A directory entry. `ino == 0` marks a free slot.
#[derive(Debug, Clone, Pod)]
#[repr(C)]
pub struct DirEntry {
    ino: u16,
    name: [u8; NAME_LEN],
}
const _: () = assert!(BLOCK_SIZE % size_of::<DirEntry>() == 0);

impl DirEntry {
    #[must_use]
    pub fn ino(&self) -> Option<InodeNo> {
        match self.ino {
            0 => None,
            n => Some(InodeNo::new(n.into())),
        }
    }

    pub fn set_ino(&mut self, ino: Option<InodeNo>) {
        self.ino = match ino {
            Some(ino) => {
                assert_ne!(ino.value(), 0);
                u16::try_from(ino.value()).unwrap()
            }
            None => 0,
        };
    }

    /// The name, without zero padding.
    #[must_use]
    pub fn name(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&c| c == 0)
            .unwrap_or(NAME_LEN);
        &self.name[..len]
    }

    /// Compares against `name`, honoring the `NAME_LEN` truncation the
    /// format imposes.
    #[must_use]
    pub fn name_matches(&self, name: &[u8]) -> bool {
        let len = usize::min(name.len(), NAME_LEN);
        self.name() == &name[..len]
    }

    /// Stores `name`, truncated to `NAME_LEN` and zero padded.
    pub fn set_name(&mut self, name: &[u8]) {
        let len = usize::min(name.len(), NAME_LEN);
        self.name[..len].copy_from_slice(&name[..len]);
        self.name[len..].fill(0);
    }
}

#[cfg(test)]
mod tests {
    use dataview::PodMethods as _;

    use super::*;

    fn test_superblock() -> SuperBlock {
        // 2000-block image with 30 log blocks and 200 inodes.
        SuperBlock {
            magic: SuperBlock::MAGIC,
            size: 2000,
            nblocks: 1954,
            ninodes: 200,
            nlog: 30,
            logstart: 2,
            inodestart: 32,
            bmapstart: 45,
        }
    }

    #[test]
    fn superblock_geometry() {
        let sb = test_superblock();
        assert_eq!(sb.inode_block(InodeNo::ROOT), BlockNo::new(32));
        assert_eq!(sb.inode_block(InodeNo::new(IPB as u32)), BlockNo::new(33));
        assert_eq!(sb.bitmap_block(0), BlockNo::new(45));
        assert_eq!(sb.bitmap_block(BPB - 1), BlockNo::new(45));
        assert_eq!(sb.bitmap_block(BPB), BlockNo::new(46));
        assert_eq!(sb.log_header_block(), BlockNo::new(2));
        assert_eq!(sb.log_scratch_block(0), BlockNo::new(3));
    }

    #[test]
    fn inode_packing() {
        assert_eq!(size_of::<Dinode>(), 64);
        assert_eq!(IPB, 16);

        let mut blk = InodeBlock::zeroed();
        blk.inode_mut(InodeNo::new(IPB as u32 + 3)).allocate(T_FILE);
        assert_eq!(blk.inode(InodeNo::new(3)).ty, T_FILE);
        assert!(blk.inode(InodeNo::new(4)).is_free());
    }

    #[test]
    fn dinode_addrs() {
        let mut di = Dinode::zeroed();
        assert_eq!(di.addr(0), None);
        di.set_addr(0, Some(BlockNo::new(77)));
        di.set_addr(NDIRECT, Some(BlockNo::new(78)));
        assert_eq!(di.addr(0), Some(BlockNo::new(77)));
        assert_eq!(di.addr(NDIRECT), Some(BlockNo::new(78)));
        di.set_addr(0, None);
        assert_eq!(di.addr(0), None);
    }

    #[test]
    fn dirent_names() {
        let mut de = DirEntry::zeroed();
        de.set_name(b"hello");
        de.set_ino(Some(InodeNo::new(7)));
        assert_eq!(de.name(), b"hello");
        assert!(de.name_matches(b"hello"));
        assert!(!de.name_matches(b"hell"));
        assert!(!de.name_matches(b"hello!"));

        // Names at exactly NAME_LEN bytes carry no terminator.
        de.set_name(b"abcdefghijklmn");
        assert_eq!(de.name(), b"abcdefghijklmn");
        assert!(de.name_matches(b"abcdefghijklmn"));
        // ... and longer names compare equal after truncation.
        assert!(de.name_matches(b"abcdefghijklmnop"));
    }

    #[test]
    fn dirent_free_slot() {
        let mut de = DirEntry::zeroed();
        assert_eq!(de.ino(), None);
        de.set_ino(Some(InodeNo::new(9)));
        de.set_ino(None);
        assert_eq!(de.ino(), None);
    }

    #[test]
    fn log_header_round_trip() {
        let mut lh = LogHeader::zeroed();
        lh.set_len(3);
        lh.set_target(0, BlockNo::new(100));
        lh.set_target(1, BlockNo::new(200));
        lh.set_target(2, BlockNo::new(300));

        // Through raw block bytes, as the log writes and re-reads it.
        let mut block = [0u8; BLOCK_SIZE];
        block.copy_from_slice(lh.as_bytes());
        let lh2: &LogHeader = block.as_data_view().get(0);
        assert_eq!(lh2.len(), 3);
        assert_eq!(lh2.targets(), &[100, 200, 300]);
    }

    #[test]
    fn indirect_take_all() {
        let mut ind = IndirectBlock::zeroed();
        ind.set(0, Some(BlockNo::new(5)));
        ind.set(9, Some(BlockNo::new(6)));
        let taken: Vec<_> = ind.take_all().collect();
        assert_eq!(taken, [BlockNo::new(5), BlockNo::new(6)]);
        assert_eq!(ind.get(0), None);
        assert_eq!(ind.get(9), None);
    }

    #[test]
    fn bitmap_bits() {
        let mut bm = BitmapBlock::zeroed();
        assert!(!bm.bit(123));
        bm.set_bit(123);
        assert!(bm.bit(123));
        assert!(!bm.bit(122));
        bm.clear_bit(123);
        assert!(!bm.bit(123));
    }
}
