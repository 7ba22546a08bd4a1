//! Processes: the slot table, lifecycle, and the sleep/wakeup
//! rendezvous.

use core::{
    cell::UnsafeCell,
    cmp, fmt, ptr,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, Ordering},
};

use arrayvec::ArrayString;

use crate::{
    cpu::Cpu,
    error::KernelError,
    file::File,
    fs::{self, Inode},
    interrupt::{self, trap},
    memory::{
        PAGE_SIZE, VirtAddr,
        layout::{TRAMPOLINE, TRAPFRAME, kstack},
        page,
        page_table::{PageTable, PtEntryFlags},
        vm_user,
    },
    param::{NOFILE, NPROC},
    println,
    sync::{SpinLock, SpinLockGuard},
};

use self::{
    scheduler::Context,
    wait_lock::{Parent, WaitLock},
};

mod elf;
pub mod exec;
pub mod scheduler;
mod switch;
mod wait_lock;

static PROC: [Proc; NPROC] = [const { Proc::new() }; NPROC];
static INIT_PROC: AtomicPtr<Proc> = AtomicPtr::new(ptr::null_mut());

/// A wait/wakeup channel: an opaque token compared only for equality,
/// conventionally the address of the thing being waited on.
pub type Chan = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct ProcId(i32);

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl ProcId {
    pub const INVALID: Self = ProcId(-1);

    pub const fn new(pid: i32) -> Self {
        Self(pid)
    }

    pub fn get(self) -> i32 {
        self.0
    }
}

/// Registers saved for the trampoline on a trap from user space, plus
/// the fields the trampoline needs to reach the kernel again (kernel
/// page table, kernel stack top, trap handler address, hart id).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TrapFrame {
    /// Kernel page table satp value.
    pub kernel_satp: u64, // 0
    /// Top of this process's kernel stack.
    pub kernel_sp: u64, // 8
    /// Address of trap_user().
    pub kernel_trap: u64, // 16
    /// Saved user program counter.
    pub epc: u64, // 24
    /// Saved kernel tp (hart id).
    pub kernel_hartid: u64, // 32
    pub ra: u64,  // 40
    pub sp: u64,  // 48
    pub gp: u64,  // 56
    pub tp: u64,  // 64
    pub t0: u64,  // 72
    pub t1: u64,  // 80
    pub t2: u64,  // 88
    pub s0: u64,  // 96
    pub s1: u64,  // 104
    pub a0: u64,  // 112
    pub a1: u64,  // 120
    pub a2: u64,  // 128
    pub a3: u64,  // 136
    pub a4: u64,  // 144
    pub a5: u64,  // 152
    pub a6: u64,  // 160
    pub a7: u64,  // 168
    pub s2: u64,  // 176
    pub s3: u64,  // 184
    pub s4: u64,  // 192
    pub s5: u64,  // 200
    pub s6: u64,  // 208
    pub s7: u64,  // 216
    pub s8: u64,  // 224
    pub s9: u64,  // 232
    pub s10: u64, // 240
    pub s11: u64, // 248
    pub t3: u64,  // 256
    pub t4: u64,  // 264
    pub t5: u64,  // 272
    pub t6: u64,  // 280
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    Unused,
    Used,
    Sleeping { chan: Chan },
    Runnable,
    Running,
    Zombie { exit_status: i32 },
}

/// Per-process state other processes may look at; all of it behind the
/// slot lock.
pub struct ProcSharedData {
    pid: ProcId,
    /// Process name, for debugging.
    name: ArrayString<16>,
    pub(crate) state: ProcState,
    killed: bool,
    /// switch() here to run the process.
    pub(crate) context: Context,
}

impl ProcSharedData {
    pub fn pid(&self) -> ProcId {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_name(&mut self, name: &[u8]) {
        self.name.clear();
        for chunk in name.utf8_chunks() {
            for ch in chunk.valid().chars() {
                if self.name.try_push(ch).is_err() {
                    return;
                }
            }
            if !chunk.invalid().is_empty() {
                let _ = self.name.try_push(char::REPLACEMENT_CHARACTER);
            }
        }
    }

    pub fn kill(&mut self) {
        self.killed = true;
    }

    pub fn killed(&self) -> bool {
        self.killed
    }
}

pub struct ProcShared(SpinLock<ProcSharedData>);

impl ProcShared {
    const fn new() -> Self {
        Self(SpinLock::new(ProcSharedData {
            pid: ProcId::INVALID,
            name: ArrayString::new_const(),
            state: ProcState::Unused,
            killed: false,
            context: Context::zeroed(),
        }))
    }

    pub fn lock(&self) -> SpinLockGuard<'_, ProcSharedData> {
        self.0.lock()
    }
}

/// Per-process state touched only by the process itself (or by `wait`
/// once the process is a zombie): address space, open files, cwd.
pub struct ProcPrivateData {
    /// Bottom of this process's kernel stack.
    kstack: VirtAddr,
    /// Size of user memory in bytes.
    sz: usize,
    pagetable: Option<NonNull<PageTable>>,
    trapframe: Option<NonNull<TrapFrame>>,
    ofile: [Option<File>; NOFILE],
    cwd: Option<Inode>,
}

impl ProcPrivateData {
    const fn new() -> Self {
        Self {
            kstack: VirtAddr::new(0),
            sz: 0,
            pagetable: None,
            trapframe: None,
            ofile: [const { None }; NOFILE],
            cwd: None,
        }
    }

    pub fn kstack(&self) -> VirtAddr {
        self.kstack
    }

    pub fn size(&self) -> usize {
        self.sz
    }

    pub fn pagetable(&self) -> &PageTable {
        unsafe { self.pagetable.unwrap().as_ref() }
    }

    pub fn pagetable_mut(&mut self) -> &mut PageTable {
        unsafe { self.pagetable.unwrap().as_mut() }
    }

    pub fn trapframe(&self) -> &TrapFrame {
        unsafe { self.trapframe.unwrap().as_ref() }
    }

    pub fn trapframe_mut(&mut self) -> &mut TrapFrame {
        unsafe { self.trapframe.unwrap().as_mut() }
    }

    /// Replaces the address space, freeing the old one. Used by exec
    /// once the new image is fully built.
    pub fn update_pagetable(&mut self, pagetable: NonNull<PageTable>, sz: usize) {
        let old_pt = self.pagetable.replace(pagetable);
        let old_sz = core::mem::replace(&mut self.sz, sz);
        if let Some(old) = old_pt {
            unsafe {
                vm_user::free(old, old_sz);
            }
        }
    }

    pub fn ofile(&self, fd: usize) -> Result<&File, KernelError> {
        self.ofile
            .get(fd)
            .and_then(Option::as_ref)
            .ok_or(KernelError::BadFileDescriptor)
    }

    pub fn add_ofile(&mut self, file: File) -> Result<usize, KernelError> {
        let (fd, slot) = self
            .ofile
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
            .ok_or(KernelError::TooManyOpenFiles)?;
        *slot = Some(file);
        Ok(fd)
    }

    pub fn take_ofile(&mut self, fd: usize) -> Result<File, KernelError> {
        self.ofile
            .get_mut(fd)
            .and_then(Option::take)
            .ok_or(KernelError::BadFileDescriptor)
    }

    pub fn cwd(&self) -> &Inode {
        self.cwd.as_ref().unwrap()
    }

    /// Swaps the working directory, returning the old one for the
    /// caller to put inside its transaction.
    pub fn update_cwd(&mut self, cwd: Inode) -> Inode {
        self.cwd.replace(cwd).unwrap()
    }
}

/// One process slot.
pub struct Proc {
    shared: ProcShared,
    /// Parent process; serialised by the wait lock.
    parent: Parent,
    private: UnsafeCell<ProcPrivateData>,
}

unsafe impl Sync for Proc {}

impl Proc {
    const fn new() -> Self {
        Self {
            shared: ProcShared::new(),
            parent: Parent::new(),
            private: UnsafeCell::new(ProcPrivateData::new()),
        }
    }

    /// The process running on this CPU.
    pub fn current() -> &'static Self {
        Self::try_current().unwrap()
    }

    pub fn try_current() -> Option<&'static Self> {
        let p = interrupt::with_push_disabled(|| Cpu::current().proc())?;
        Some(unsafe { p.as_ref() })
    }

    pub fn shared(&self) -> &ProcShared {
        &self.shared
    }

    /// The process's private data.
    ///
    /// # Safety
    ///
    /// Only the process itself may use this while Running; `wait` may
    /// use it on a Zombie child; setup code may use it on a slot whose
    /// lock it holds in the Used state. Callers must not overlap
    /// borrows.
    #[expect(clippy::mut_from_ref)]
    pub unsafe fn private_mut(&self) -> &mut ProcPrivateData {
        unsafe { &mut *self.private.get() }
    }

    fn is_child_of(&self, parent: &Self, wait_lock: &mut SpinLockGuard<'_, WaitLock>) -> bool {
        self.parent
            .get(wait_lock)
            .is_some_and(|pp| ptr::eq(pp, parent))
    }

    fn allocate_pid() -> ProcId {
        static NEXT_PID: AtomicI32 = AtomicI32::new(1);
        ProcId(NEXT_PID.fetch_add(1, Ordering::Relaxed))
    }

    /// Finds an UNUSED slot and initialises it enough to run in the
    /// kernel: pid, trapframe page, empty user page table, and a context
    /// that starts at `forkret`. Returns with the slot lock held.
    fn allocate() -> Result<
        (
            &'static Self,
            SpinLockGuard<'static, ProcSharedData>,
            &'static mut ProcPrivateData,
        ),
        KernelError,
    > {
        let (p, mut shared) = 'found: {
            for p in &PROC {
                let shared = p.shared.lock();
                if shared.state == ProcState::Unused {
                    break 'found (p, shared);
                }
            }
            return Err(KernelError::NoFreeProcess);
        };

        shared.pid = Self::allocate_pid();
        shared.state = ProcState::Used;
        // Safety: the slot was Unused and we hold its lock.
        let private = unsafe { p.private_mut() };

        let res = (|| {
            // Allocate a trapframe page.
            let tf = page::alloc_page().ok_or(KernelError::OutOfMemory)?;
            private.trapframe = Some(tf.cast());
            // An empty user page table, with trampoline and trapframe
            // mapped at the top.
            private.pagetable = Some(create_user_pagetable(private.trapframe.unwrap())?);
            Ok(())
        })();

        if let Err(err) = res {
            p.free(private, &mut shared);
            drop(shared);
            return Err(err);
        }

        // The new thread's first dispatch lands in forkret, on a fresh
        // kernel stack.
        shared.context.clear();
        shared.context.ra = forkret as usize as u64;
        shared.context.sp = (private.kstack.addr() + PAGE_SIZE) as u64;

        Ok((p, shared, private))
    }

    /// Resets a slot to Unused, freeing everything hanging off it.
    ///
    /// The slot lock must be held.
    fn free(&self, private: &mut ProcPrivateData, shared: &mut SpinLockGuard<'_, ProcSharedData>) {
        if let Some(tf) = private.trapframe.take() {
            unsafe {
                page::free_page(tf.cast());
            }
        }
        if let Some(pt) = private.pagetable.take() {
            unsafe {
                vm_user::free(pt, private.sz);
            }
        }
        private.sz = 0;
        unsafe {
            self.parent.reset();
        }
        shared.pid = ProcId::INVALID;
        shared.name.clear();
        shared.killed = false;
        shared.state = ProcState::Unused;
    }
}

/// Allocates a kernel stack page for every slot, high in the kernel
/// address space with an unmapped guard page below each.
pub fn map_stacks(kpgtbl: &mut PageTable) {
    for (i, _p) in PROC.iter().enumerate() {
        let pa = page::alloc_page().unwrap();
        kpgtbl
            .map_page(
                kstack(i),
                crate::memory::PhysAddr::from_ptr(pa),
                PtEntryFlags::RW,
            )
            .unwrap();
    }
}

/// Records each slot's kernel stack address.
pub fn init() {
    for (i, p) in PROC.iter().enumerate() {
        unsafe { p.private_mut() }.kstack = kstack(i);
    }
}

/// An empty user page table with the trampoline and `trapframe` mapped
/// at the top. No user memory yet.
fn create_user_pagetable(
    trapframe: NonNull<TrapFrame>,
) -> Result<NonNull<PageTable>, KernelError> {
    let mut pt_ptr = vm_user::create()?;
    let pt = unsafe { pt_ptr.as_mut() };

    // The trampoline, for syscall entry/return. Not user-accessible;
    // only the supervisor uses it on the way to and from user space.
    if let Err(err) = pt.map_page(
        TRAMPOLINE,
        crate::memory::PhysAddr::new(crate::interrupt::trampoline::base_addr()),
        PtEntryFlags::RX,
    ) {
        unsafe {
            vm_user::free_empty(pt_ptr);
        }
        return Err(err);
    }

    // The trapframe page, just below.
    if let Err(err) = pt.map_page(
        TRAPFRAME,
        crate::memory::PhysAddr::from_ptr(trapframe),
        PtEntryFlags::RW,
    ) {
        pt.unmap_pages(TRAMPOLINE, 1, false);
        unsafe {
            vm_user::free_empty(pt_ptr);
        }
        return Err(err);
    }

    Ok(pt_ptr)
}

/// A user program that calls `exec("/init")`, then loops on `exit`.
/// Assembled from the classic initcode.S; keep in sync with the syscall
/// numbers.
static INIT_CODE: &[u8] = &[
    0x17, 0x05, 0x00, 0x00, 0x13, 0x05, 0x45, 0x02, // auipc a0, 0; addi a0, a0, 36  (la a0, init)
    0x97, 0x05, 0x00, 0x00, 0x93, 0x85, 0x35, 0x02, // auipc a1, 0; addi a1, a1, 35  (la a1, argv)
    0x93, 0x08, 0x70, 0x00, 0x73, 0x00, 0x00, 0x00, // li a7, SYS_exec; ecall
    0x93, 0x08, 0x20, 0x00, 0x73, 0x00, 0x00, 0x00, // li a7, SYS_exit; ecall
    0xef, 0xf0, 0x9f, 0xff, // jal ra, <exit loop>
    0x2f, 0x69, 0x6e, 0x69, 0x74, 0x00, 0x00, 0x24, // "/init\0" + argv
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Sets up the first user process.
pub fn user_init() {
    let (p, mut shared, private) = Proc::allocate().expect("user_init: no process slot");
    INIT_PROC.store(ptr::from_ref(p).cast_mut(), Ordering::Release);

    // One page holding initcode's instructions and data.
    vm_user::first_load(private.pagetable_mut(), INIT_CODE);
    private.sz = PAGE_SIZE;

    // Prepare for the very first "return" from kernel to user.
    let tf = private.trapframe_mut();
    tf.epc = 0; // user program counter
    tf.sp = PAGE_SIZE as u64; // user stack pointer

    private.cwd = Some(fs::root_inode());
    shared.name = ArrayString::from("initcode").unwrap();
    shared.state = ProcState::Runnable;

    drop(shared);
}

/// Grows or shrinks user memory by `n` bytes.
pub fn grow(private: &mut ProcPrivateData, n: isize) -> Result<(), KernelError> {
    let old_sz = private.sz;
    let new_sz = old_sz.saturating_add_signed(n);

    private.sz = match new_sz.cmp(&old_sz) {
        cmp::Ordering::Equal => old_sz,
        cmp::Ordering::Less => vm_user::dealloc(private.pagetable_mut(), old_sz, new_sz),
        cmp::Ordering::Greater => {
            vm_user::alloc(private.pagetable_mut(), old_sz, new_sz, PtEntryFlags::W)?
        }
    };
    Ok(())
}

/// Creates a new process copying the parent; the child returns from the
/// fork() system call with value 0.
pub fn fork(p: &'static Proc, p_private: &ProcPrivateData) -> Result<ProcId, KernelError> {
    let parent_name = p.shared.lock().name;

    let (np, mut np_shared, np_private) = Proc::allocate()?;

    // Copy user memory from parent to child.
    if let Err(err) = vm_user::copy(
        p_private.pagetable(),
        np_private.pagetable_mut(),
        p_private.sz,
    ) {
        np.free(np_private, &mut np_shared);
        drop(np_shared);
        return Err(err);
    }
    np_private.sz = p_private.sz;

    // Copy saved user registers; fork returns 0 in the child.
    *np_private.trapframe_mut() = *p_private.trapframe();
    np_private.trapframe_mut().a0 = 0;

    // Share open files and the working directory.
    for (of, nof) in p_private.ofile.iter().zip(&mut np_private.ofile) {
        *nof = of.as_ref().map(File::dup);
    }
    np_private.cwd = Some(p_private.cwd().dup());
    np_shared.name = parent_name;

    let pid = np_shared.pid;
    drop(np_shared);

    let mut wait_lock = wait_lock::lock();
    np.parent.set(Some(p), &mut wait_lock);
    drop(wait_lock);

    np.shared.lock().state = ProcState::Runnable;

    Ok(pid)
}

/// Passes p's abandoned children to init. Caller must hold the wait
/// lock.
fn reparent(p: &Proc, wait_lock: &mut SpinLockGuard<'_, WaitLock>) {
    let init = INIT_PROC.load(Ordering::Relaxed);
    for pp in &PROC {
        if pp.is_child_of(p, wait_lock) {
            pp.parent
                .set(Some(unsafe { init.cast_const().as_ref() }.unwrap()), wait_lock);
            wakeup(init.addr());
        }
    }
}

/// Exits the current process with `status`; does not return. The
/// process stays a zombie until its parent calls wait().
pub fn exit(p: &'static Proc, p_private: &mut ProcPrivateData, status: i32) -> ! {
    assert!(
        !ptr::eq(p, INIT_PROC.load(Ordering::Relaxed)),
        "init exiting"
    );

    // Close all open files.
    for of in &mut p_private.ofile {
        if let Some(of) = of.take() {
            of.close();
        }
    }

    // Drop the working-directory reference inside a transaction.
    let tx = fs::begin_tx();
    p_private.cwd.take().unwrap().into_tx(&tx).put();
    tx.end();

    let mut wait_lock = wait_lock::lock();

    // Give any children to init.
    reparent(p, &mut wait_lock);

    // The parent might be sleeping in wait().
    if let Some(parent) = p.parent.get(&mut wait_lock) {
        wakeup(ptr::from_ref(parent).addr());
    }

    let mut shared = p.shared.lock();
    shared.state = ProcState::Zombie {
        exit_status: status,
    };
    drop(wait_lock);

    // Jump into the scheduler, never to return.
    scheduler::sched(&mut shared);

    unreachable!("zombie exit");
}

/// Waits for a child to exit; returns its pid after copying the exit
/// status to user address `addr` (if non-zero).
pub fn wait(
    p: &'static Proc,
    p_private: &ProcPrivateData,
    addr: usize,
) -> Result<ProcId, KernelError> {
    let mut wait_lock = wait_lock::lock();

    loop {
        let mut have_kids = false;
        for pp in &PROC {
            if !pp.is_child_of(p, &mut wait_lock) {
                continue;
            }

            // Make sure the child isn't still in exit() or switch().
            let mut pp_shared = pp.shared.lock();

            have_kids = true;
            if let ProcState::Zombie { exit_status } = pp_shared.state {
                // Found one.
                let pid = pp_shared.pid;
                if addr != 0
                    && vm_user::copy_out(p_private.pagetable(), addr, &exit_status).is_err()
                {
                    return Err(KernelError::BadAddress);
                }
                // Safety: zombies have no other users of their private
                // data.
                let pp_private = unsafe { pp.private_mut() };
                pp.free(pp_private, &mut pp_shared);
                return Ok(pid);
            }
            drop(pp_shared);
        }

        // No point waiting if we have nothing to wait for.
        if !have_kids {
            return Err(KernelError::NoChildren);
        }
        if p.shared.lock().killed() {
            return Err(KernelError::Killed);
        }

        // Wait for a child to exit.
        wait_lock = sleep(ptr::from_ref(p).addr(), wait_lock);
    }
}

/// Gives up the CPU for one scheduling round.
pub fn yield_(p: &Proc) {
    let mut shared = p.shared.lock();
    shared.state = ProcState::Runnable;
    scheduler::sched(&mut shared);
    drop(shared);
}

/// A forked child's very first scheduled run starts here, still holding
/// the slot lock the scheduler took. Release it and return to user
/// space as if a trap had just completed.
extern "C" fn forkret() -> ! {
    static FIRST: AtomicBool = AtomicBool::new(true);

    let p = Proc::current();
    let shared = unsafe { p.shared.0.remember_locked() };
    drop(shared);

    if FIRST.load(Ordering::Acquire) {
        // The file system must be mounted in the context of a regular
        // process (it sleeps on disk I/O), so it cannot happen in main().
        fs::mount(fs::ROOT_DEV);
        FIRST.store(false, Ordering::Release);
    }

    trap::trap_user_ret(p)
}

/// Atomically releases `guard` and sleeps on `chan`; reacquires the
/// lock once awakened.
///
/// The slot lock is the rendezvous: it is held from before the
/// condition lock is released until the switch into the scheduler is
/// complete, and `wakeup` needs it to change the state — so no wakeup
/// can fall between the predicate check and the sleep, and no CPU can
/// see this stack while it is still in use.
pub fn sleep<T>(chan: Chan, guard: SpinLockGuard<'_, T>) -> SpinLockGuard<'_, T> {
    let p = Proc::current();
    let mut shared = p.shared.lock();
    let lock = guard.into_lock();

    // Go to sleep.
    shared.state = ProcState::Sleeping { chan };
    scheduler::sched(&mut shared);

    // Reacquire the original lock.
    drop(shared);
    lock.lock()
}

/// Wakes every process sleeping on `chan`.
///
/// Must be called without any slot lock held; callers hold the
/// condition lock instead.
pub fn wakeup(chan: Chan) {
    for p in &PROC {
        let mut shared = p.shared.lock();
        if shared.state == (ProcState::Sleeping { chan }) {
            shared.state = ProcState::Runnable;
        }
        drop(shared);
    }
}

/// Flags the process with the given pid as killed; if it is sleeping,
/// makes it runnable so it reaches its next kill check and exits.
pub fn kill(pid: ProcId) -> Result<(), KernelError> {
    for p in &PROC {
        let mut shared = p.shared.lock();
        if shared.pid == pid {
            shared.killed = true;
            if let ProcState::Sleeping { .. } = shared.state {
                shared.state = ProcState::Runnable;
            }
            return Ok(());
        }
        drop(shared);
    }
    Err(KernelError::ProcessNotFound)
}

pub fn current_pid() -> ProcId {
    Proc::current().shared.lock().pid
}

/// Prints a process listing to the console; ^P.
pub fn dump() {
    println!();
    for p in &PROC {
        let shared = p.shared.lock();
        let pid = shared.pid;
        let state = shared.state;
        let name = shared.name;
        drop(shared);

        let state = match state {
            ProcState::Unused => continue,
            ProcState::Used => "used",
            ProcState::Sleeping { .. } => "sleep",
            ProcState::Runnable => "runnable",
            ProcState::Running => "run",
            ProcState::Zombie { .. } => "zombie",
        };
        println!("{pid:5} {state:<10} {name}");
    }
}
