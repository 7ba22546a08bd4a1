//! Inode content: byte-granular reads and writes over the block map.

use dataview::{Pod, PodMethods as _};
use fv6_fs_types::{BLOCK_SIZE, BlockNo, IndirectBlock, MAX_FILE_BLOCKS, NDIRECT};

use crate::{
    error::KernelError,
    fs::data_block,
    memory::vm_user::{DstBuf, SrcBuf},
};

use super::LockedTxInode;

impl<const READ_ONLY: bool> LockedTxInode<'_, '_, READ_ONLY> {
    /// The disk block backing file block `fbn`, if allocated.
    fn addr_of(&mut self, fbn: usize) -> Option<BlockNo> {
        assert!(fbn < MAX_FILE_BLOCKS, "file block out of range");
        if fbn < NDIRECT {
            return self.data().addrs[fbn];
        }

        let ind_bn = self.data().addrs[NDIRECT]?;
        let mut buf = self.tx.get_block(self.dev(), ind_bn);
        let guard = buf.lock().read().unwrap();
        guard.data::<IndirectBlock>().get(fbn - NDIRECT)
    }

    /// Reads up to `n` bytes at byte offset `off` into `dst`. Returns
    /// the number of bytes read; short only at end of file.
    pub fn read(
        &mut self,
        dst: &mut DstBuf<'_>,
        off: usize,
        mut n: usize,
    ) -> Result<usize, KernelError> {
        assert!(n <= dst.len());
        let size = self.size() as usize;
        if off > size || off.checked_add(n).is_none() {
            return Ok(0);
        }
        if off + n > size {
            n = size - off;
        }

        let mut done = 0;
        while done < n {
            let off = off + done;
            // Holes cannot occur below `size`, but stop short rather
            // than fabricate bytes if one does.
            let Some(bn) = self.addr_of(off / BLOCK_SIZE) else {
                break;
            };
            let mut buf = self.tx.get_block(self.dev(), bn);
            let guard = buf.lock().read().unwrap();
            let m = usize::min(n - done, BLOCK_SIZE - off % BLOCK_SIZE);
            dst.copy_from(done, &guard.bytes()[off % BLOCK_SIZE..][..m])?;
            done += m;
        }
        Ok(done)
    }

    /// Reads a structure at byte offset `off`.
    pub fn read_as<T: Pod>(&mut self, off: usize) -> Result<T, KernelError> {
        let mut value = T::zeroed();
        let read = self.read(
            &mut DstBuf::Kernel(value.as_bytes_mut()),
            off,
            size_of::<T>(),
        )?;
        if read != size_of::<T>() {
            return Err(KernelError::NoSuchEntry);
        }
        Ok(value)
    }
}

impl LockedTxInode<'_, '_, false> {
    /// The disk block backing file block `fbn`, allocating data and
    /// indirect blocks as needed.
    fn block_map(&mut self, fbn: usize) -> Result<BlockNo, KernelError> {
        assert!(fbn < MAX_FILE_BLOCKS, "file block out of range");

        if fbn < NDIRECT {
            if let Some(bn) = self.data().addrs[fbn] {
                return Ok(bn);
            }
            let bn = data_block::alloc(self.tx, self.dev())?;
            self.data_mut().addrs[fbn] = Some(bn);
            return Ok(bn);
        }

        // Load the indirect block, allocating it if necessary.
        let ind_bn = match self.data().addrs[NDIRECT] {
            Some(bn) => bn,
            None => {
                let bn = data_block::alloc(self.tx, self.dev())?;
                self.data_mut().addrs[NDIRECT] = Some(bn);
                bn
            }
        };

        let mut buf = self.tx.get_block(self.dev(), ind_bn);
        let mut guard = buf.lock().read().unwrap();
        if let Some(bn) = guard.data::<IndirectBlock>().get(fbn - NDIRECT) {
            return Ok(bn);
        }
        let bn = data_block::alloc(self.tx, self.dev())?;
        guard.data_mut::<IndirectBlock>().set(fbn - NDIRECT, Some(bn));
        self.tx.write(&mut guard);
        Ok(bn)
    }

    /// Writes `n` bytes from `src` at byte offset `off`, growing the
    /// file as needed. A short count means an allocation or copy failed
    /// part-way; what was written stays written.
    pub fn write(
        &mut self,
        src: &SrcBuf<'_>,
        off: usize,
        n: usize,
    ) -> Result<usize, KernelError> {
        assert!(n <= src.len());
        let size = self.size() as usize;
        if off > size || off.checked_add(n).is_none() {
            return Err(KernelError::InvalidArgument);
        }
        if off + n > MAX_FILE_BLOCKS * BLOCK_SIZE {
            return Err(KernelError::FileTooLarge);
        }

        let mut done = 0;
        while done < n {
            let off = off + done;
            let Ok(bn) = self.block_map(off / BLOCK_SIZE) else {
                break;
            };
            let mut buf = self.tx.get_block(self.dev(), bn);
            let mut guard = buf.lock().read().unwrap();
            let m = usize::min(n - done, BLOCK_SIZE - off % BLOCK_SIZE);
            if src
                .copy_to(done, &mut guard.bytes_mut()[off % BLOCK_SIZE..][..m])
                .is_err()
            {
                break;
            }
            self.tx.write(&mut guard);
            done += m;
        }

        if off + done > size {
            self.data_mut().size = (off + done) as u32;
        }
        // Write the inode back even if the size is unchanged: block_map
        // may have added block addresses.
        self.update();

        Ok(done)
    }

    /// Writes a structure at byte offset `off`.
    pub fn write_as<T: Pod>(&mut self, off: usize, value: &T) -> Result<(), KernelError> {
        let written = self.write(&SrcBuf::Kernel(value.as_bytes()), off, size_of::<T>())?;
        if written != size_of::<T>() {
            return Err(KernelError::OutOfBlocks);
        }
        Ok(())
    }

    /// Discards the file's content: frees every data block (direct and
    /// indirect) and resets the size to zero.
    pub fn truncate(&mut self) {
        for i in 0..NDIRECT {
            if let Some(bn) = self.data_mut().addrs[i].take() {
                data_block::free(self.tx, self.dev(), bn);
            }
        }

        if let Some(ind_bn) = self.data_mut().addrs[NDIRECT].take() {
            {
                let mut buf = self.tx.get_block(self.dev(), ind_bn);
                let guard = buf.lock().read().unwrap();
                // The indirect block itself is freed below; its contents
                // need not be cleared or logged.
                for i in 0..fv6_fs_types::NINDIRECT {
                    if let Some(bn) = guard.data::<IndirectBlock>().get(i) {
                        data_block::free(self.tx, self.dev(), bn);
                    }
                }
            }
            data_block::free(self.tx, self.dev(), ind_bn);
        }

        self.data_mut().size = 0;
        self.update();
    }
}
