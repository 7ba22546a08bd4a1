//! exec: replace the calling process's image with a program from disk.

use core::{ptr::NonNull, slice};

use crate::{
    error::KernelError,
    fs,
    memory::{
        PAGE_SIZE, VirtAddr,
        addr::page_roundup,
        page_table::{PageTable, PtEntryFlags},
        vm_user::{self, DstBuf},
    },
    param::MAX_ARG,
    proc::{Proc, ProcPrivateData},
};

use super::elf::{ELF_MAGIC, ELF_PROG_LOAD, ElfHeader, PF_W, PF_X, ProgramHeader};

fn flags2perm(flags: u32) -> PtEntryFlags {
    let mut perm = PtEntryFlags::empty();
    if flags & PF_X != 0 {
        perm.insert(PtEntryFlags::X);
    }
    if flags & PF_W != 0 {
        perm.insert(PtEntryFlags::W);
    }
    perm
}

/// Loads the program at `path` into a fresh address space, builds its
/// argument stack from the NUL-terminated strings in `argv`, and
/// commits. Returns argc (the new program's a0); a1 is set to the argv
/// array on the new stack. On error the old image is untouched.
pub fn exec(
    p: &'static Proc,
    private: &mut ProcPrivateData,
    path: &[u8],
    argv: &[Option<NonNull<u8>>; MAX_ARG],
) -> Result<usize, KernelError> {
    // A fresh page table with only trampoline and trapframe mapped.
    let mut pt_ptr = super::create_user_pagetable(private.trapframe.unwrap())?;
    let mut size = 0;

    let res = (|| {
        let tx = fs::begin_tx();
        let mut ip = fs::path::resolve(&tx, private.cwd(), path)?;
        let mut locked = ip.lock();
        let pt = unsafe { pt_ptr.as_mut() };

        let elf: ElfHeader = locked
            .read_as(0)
            .map_err(|_| KernelError::InvalidExecutable)?;
        if elf.magic != ELF_MAGIC {
            return Err(KernelError::InvalidExecutable);
        }

        // Load each program segment.
        for i in 0..elf.phnum as usize {
            let off = elf.phoff as usize + i * size_of::<ProgramHeader>();
            let ph: ProgramHeader = locked
                .read_as(off)
                .map_err(|_| KernelError::InvalidExecutable)?;
            if ph.ty != ELF_PROG_LOAD {
                continue;
            }
            if ph.memsz < ph.filesz || ph.vaddr.checked_add(ph.memsz).is_none() {
                return Err(KernelError::InvalidExecutable);
            }
            let va = usize::try_from(ph.vaddr).unwrap();
            let end = usize::try_from(ph.vaddr + ph.memsz).unwrap();
            if va % PAGE_SIZE != 0 || VirtAddr::checked(end).is_none() {
                return Err(KernelError::InvalidExecutable);
            }

            size = vm_user::alloc(pt, size, end, flags2perm(ph.flags))?;
            load_segment(
                pt,
                VirtAddr::new(va),
                &mut locked,
                ph.off as usize,
                ph.filesz as usize,
            )?;
        }
        drop(locked);
        ip.put();
        tx.end();

        let pt = unsafe { pt_ptr.as_mut() };

        // Pages at the next boundary: an inaccessible stack guard, then
        // a two-page user stack.
        const USER_STACK_PAGES: usize = 2;
        size = page_roundup(size);
        size = vm_user::alloc(
            pt,
            size,
            size + (USER_STACK_PAGES + 1) * PAGE_SIZE,
            PtEntryFlags::W,
        )?;
        pt.forbid_user(VirtAddr::new(size - (USER_STACK_PAGES + 1) * PAGE_SIZE));
        let stack_base = size - USER_STACK_PAGES * PAGE_SIZE;
        let mut sp = size;

        // Push the argument strings.
        let mut ustack = [0usize; MAX_ARG + 1];
        let mut argc = 0;
        for arg in argv.iter().take_while(|arg| arg.is_some()) {
            let arg = arg.unwrap();
            let s = c_str(arg);
            sp -= s.len() + 1;
            sp -= sp % 16; // risc-v sp must be 16-byte aligned
            if sp < stack_base {
                return Err(KernelError::ArgumentListTooLong);
            }
            vm_user::copy_out_bytes(pt, sp, s)?;
            vm_user::copy_out_bytes(pt, sp + s.len(), &[0])?;
            ustack[argc] = sp;
            argc += 1;
        }
        ustack[argc] = 0;

        // Push the argv[] pointer array.
        sp -= (argc + 1) * size_of::<usize>();
        sp -= sp % 16;
        if sp < stack_base {
            return Err(KernelError::ArgumentListTooLong);
        }
        let bytes = unsafe {
            slice::from_raw_parts(
                ustack.as_ptr().cast::<u8>(),
                (argc + 1) * size_of::<usize>(),
            )
        };
        vm_user::copy_out_bytes(pt, sp, bytes)?;

        Ok((argc, sp, elf.entry))
    })();

    let (argc, sp, entry) = match res {
        Ok(ok) => ok,
        Err(err) => {
            unsafe {
                vm_user::free(pt_ptr, size);
            }
            return Err(err);
        }
    };

    // Save the program name for debugging.
    let name = path
        .rsplit(|&b| b == b'/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or(path);
    p.shared().lock().set_name(name);

    // Commit to the new image.
    private.update_pagetable(pt_ptr, size);
    let tf = private.trapframe_mut();
    tf.epc = entry; // initial program counter = main
    tf.sp = sp as u64; // initial stack pointer
    tf.a1 = sp as u64; // argv
    Ok(argc)
}

/// The bytes of a NUL-terminated string in a kernel page.
fn c_str<'a>(p: NonNull<u8>) -> &'a [u8] {
    let full = unsafe { slice::from_raw_parts(p.as_ptr(), PAGE_SIZE) };
    let len = full.iter().position(|&b| b == 0).unwrap_or(PAGE_SIZE - 1);
    &full[..len]
}

/// Copies a segment's file contents into the new page table at `va`
/// (page-aligned); the rest of the segment stays zero.
fn load_segment<const READ_ONLY: bool>(
    pt: &PageTable,
    va: VirtAddr,
    locked: &mut fs::LockedTxInode<'_, '_, READ_ONLY>,
    file_off: usize,
    file_size: usize,
) -> Result<(), KernelError> {
    assert!(va.is_page_aligned());

    for off in (0..file_size).step_by(PAGE_SIZE) {
        let pa = pt.translate(va.byte_add(off), PtEntryFlags::U)?;
        let n = usize::min(file_size - off, PAGE_SIZE);
        let dst = unsafe { slice::from_raw_parts_mut(pa.as_ptr::<u8>().as_ptr(), n) };
        let read = locked.read(&mut DstBuf::Kernel(dst), file_off + off, n)?;
        if read != n {
            return Err(KernelError::InvalidExecutable);
        }
    }
    Ok(())
}
