//! Data-block allocation: the on-disk free bitmap.

use fv6_fs_types::{BPB, BitmapBlock, BlockNo};

use crate::{error::KernelError, println};

use super::{DeviceNo, Tx, super_block};

/// Zeroes a block.
fn zero(tx: &Tx<false>, dev: DeviceNo, block_no: BlockNo) {
    let mut buf = tx.get_block(dev, block_no);
    let mut guard = buf.lock().zeroed();
    tx.write(&mut guard);
}

/// Allocates a zeroed data block.
pub(super) fn alloc(tx: &Tx<false>, dev: DeviceNo) -> Result<BlockNo, KernelError> {
    let sb = super_block();
    let size = sb.size as usize;
    for bn0 in (0..size).step_by(BPB) {
        let mut buf = tx.get_block(dev, sb.bitmap_block(bn0));
        let mut guard = buf.lock().read().unwrap();
        let found = (0..BPB)
            .take_while(|bi| bn0 + bi < size)
            .find(|&bi| !guard.data::<BitmapBlock>().bit(bi));
        let Some(bi) = found else {
            continue;
        };

        // Mark the block in use.
        guard.data_mut::<BitmapBlock>().set_bit(bi);
        tx.write(&mut guard);
        drop(guard);

        let bn = BlockNo::new((bn0 + bi) as u32);
        zero(tx, dev, bn);
        return Ok(bn);
    }
    println!("out of blocks");
    Err(KernelError::OutOfBlocks)
}

/// Frees a disk block.
pub(super) fn free(tx: &Tx<false>, dev: DeviceNo, bn: BlockNo) {
    let sb = super_block();
    let mut buf = tx.get_block(dev, sb.bitmap_block(bn.as_index()));
    let mut guard = buf.lock().read().unwrap();
    let bi = bn.as_index() % BPB;
    assert!(guard.data::<BitmapBlock>().bit(bi), "freeing free block");
    guard.data_mut::<BitmapBlock>().clear_bit(bi);
    tx.write(&mut guard);
}
