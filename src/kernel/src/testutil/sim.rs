//! Host doubles for every collaborator the loader and timer talk to.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use spin::Mutex;
use vireo_common::{IoError, MapError, TaskId, TaskState, WaitObject};
use vireo_hal::{
    AddressSpace, FileIo, FrameAllocator, InterruptController, PhysAddr, Scheduler, SeekFrom,
    SwitchReason, VirtAddr, PAGE_SIZE,
};

use crate::task::{SavedFrame, TaskTable};

/// Byte pattern fresh simulated frames are filled with, standing in for
/// whatever the previous owner left behind.
pub const STALE_BYTE: u8 = 0xA5;

/// A file held in memory.
#[derive(Debug, Clone)]
pub struct MemFile {
    data: Vec<u8>,
    pos: u64,
    max_read: usize,
}

impl MemFile {
    /// A file with `data`, positioned at the start.
    pub fn new(data: Vec<u8>) -> Self {
        MemFile {
            data,
            pos: 0,
            max_read: usize::MAX,
        }
    }

    /// Like [`new`](Self::new), but each `read` returns at most `max_read`
    /// bytes.
    pub fn with_max_read(data: Vec<u8>, max_read: usize) -> Self {
        MemFile {
            max_read: max_read.max(1),
            ..MemFile::new(data)
        }
    }

    /// Current position.
    pub fn position(&self) -> u64 {
        self.pos
    }
}

impl FileIo for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        let len = self.data.len() as u64;
        if self.pos >= len {
            return Ok(0);
        }
        let start = self.pos as usize;
        let n = buf.len().min(self.data.len() - start).min(self.max_read);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64, IoError> {
        self.pos = match pos {
            SeekFrom::Start(offset) => offset,
            SeekFrom::Current(delta) => self
                .pos
                .checked_add_signed(delta)
                .ok_or(IoError::InvalidSeek)?,
        };
        Ok(self.pos)
    }
}

/// Hands out consecutive frames from 1 MiB, optionally up to a limit.
#[derive(Debug, Default)]
pub struct SimFrames {
    next: u64,
    limit: Option<usize>,
    allocated: usize,
}

impl SimFrames {
    const BASE: u64 = 0x10_0000;

    /// An unbounded pool.
    pub fn new() -> Self {
        SimFrames {
            next: Self::BASE,
            limit: None,
            allocated: 0,
        }
    }

    /// A pool that runs dry after `limit` frames.
    pub fn with_limit(limit: usize) -> Self {
        SimFrames {
            limit: Some(limit),
            ..SimFrames::new()
        }
    }

    /// Frames handed out so far.
    pub fn allocated(&self) -> usize {
        self.allocated
    }
}

impl FrameAllocator for SimFrames {
    fn alloc_frame(&mut self) -> Option<PhysAddr> {
        if self.limit.is_some_and(|limit| self.allocated >= limit) {
            return None;
        }
        let frame = PhysAddr::new(self.next);
        self.next += PAGE_SIZE;
        self.allocated += 1;
        Some(frame)
    }
}

struct SimPage {
    frame: PhysAddr,
    user: bool,
    writable: bool,
    data: Vec<u8>,
}

/// An address space kept in a map of pages.
///
/// Newly mapped pages start out filled with [`STALE_BYTE`]. Every change to
/// a page's writable bit is recorded so tests can check the order in which
/// permissions were applied.
#[derive(Default)]
pub struct SimAddressSpace {
    pages: BTreeMap<u64, SimPage>,
    writable_history: BTreeMap<u64, Vec<bool>>,
}

impl SimAddressSpace {
    /// An empty address space.
    pub fn new() -> Self {
        Self::default()
    }

    /// Writable bit of the page containing `vaddr`, if mapped.
    pub fn is_writable(&self, vaddr: VirtAddr) -> Option<bool> {
        self.pages.get(&vaddr.page_floor().as_u64()).map(|p| p.writable)
    }

    /// User bit of the page containing `vaddr`, if mapped.
    pub fn is_user(&self, vaddr: VirtAddr) -> Option<bool> {
        self.pages.get(&vaddr.page_floor().as_u64()).map(|p| p.user)
    }

    /// Frame backing the page containing `vaddr`, if mapped.
    pub fn frame(&self, vaddr: VirtAddr) -> Option<PhysAddr> {
        self.pages.get(&vaddr.page_floor().as_u64()).map(|p| p.frame)
    }

    /// Every writable bit the page containing `vaddr` has had, oldest first.
    pub fn writable_history(&self, vaddr: VirtAddr) -> &[bool] {
        self.writable_history
            .get(&vaddr.page_floor().as_u64())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Number of mapped pages.
    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }

    /// Copies `len` bytes starting at `vaddr`.
    ///
    /// # Panics
    ///
    /// If any byte in the range is unmapped.
    pub fn read(&self, vaddr: VirtAddr, len: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(len);
        let mut addr = vaddr.as_u64();
        let end = addr + len as u64;
        while addr < end {
            let page = self
                .pages
                .get(&(addr & !(PAGE_SIZE - 1)))
                .unwrap_or_else(|| panic!("read from unmapped address {:#x}", addr));
            let offset = (addr % PAGE_SIZE) as usize;
            let chunk = (PAGE_SIZE as usize - offset).min((end - addr) as usize);
            out.extend_from_slice(&page.data[offset..offset + chunk]);
            addr += chunk as u64;
        }
        out
    }

    fn record(&mut self, page: u64, writable: bool) {
        self.writable_history.entry(page).or_default().push(writable);
    }
}

impl AddressSpace for SimAddressSpace {
    fn is_mapped(&self, vaddr: VirtAddr) -> bool {
        self.pages.contains_key(&vaddr.page_floor().as_u64())
    }

    fn map_page(
        &mut self,
        vaddr: VirtAddr,
        paddr: PhysAddr,
        user: bool,
        writable: bool,
    ) -> Result<(), MapError> {
        let page = vaddr.page_floor().as_u64();
        if self.pages.contains_key(&page) {
            return Err(MapError::AlreadyMapped);
        }
        self.pages.insert(
            page,
            SimPage {
                frame: paddr,
                user,
                writable,
                data: vec![STALE_BYTE; PAGE_SIZE as usize],
            },
        );
        self.record(page, writable);
        Ok(())
    }

    fn set_page_rw(&mut self, vaddr: VirtAddr, writable: bool) -> Result<(), MapError> {
        let page = vaddr.page_floor().as_u64();
        self.pages
            .get_mut(&page)
            .ok_or(MapError::NotMapped)?
            .writable = writable;
        self.record(page, writable);
        Ok(())
    }

    fn page_mut(&mut self, vaddr: VirtAddr) -> Option<&mut [u8]> {
        self.pages
            .get_mut(&vaddr.page_floor().as_u64())
            .map(|p| p.data.as_mut_slice())
    }
}

/// Interrupt controller that only tracks the interrupt flag and counts
/// critical sections.
#[derive(Debug)]
pub struct SimInterrupts {
    enabled: AtomicBool,
    sections: AtomicUsize,
}

impl Default for SimInterrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl SimInterrupts {
    /// Interrupts enabled, no sections entered yet.
    pub const fn new() -> Self {
        SimInterrupts {
            enabled: AtomicBool::new(true),
            sections: AtomicUsize::new(0),
        }
    }

    /// Whether interrupts are currently enabled.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// How many times interrupts were disabled.
    pub fn critical_sections(&self) -> usize {
        self.sections.load(Ordering::SeqCst)
    }
}

impl InterruptController for SimInterrupts {
    fn save_and_disable(&self) -> bool {
        self.sections.fetch_add(1, Ordering::SeqCst);
        self.enabled.swap(false, Ordering::SeqCst)
    }

    fn restore(&self, was_enabled: bool) {
        self.enabled.store(was_enabled, Ordering::SeqCst);
    }
}

/// A scheduler decision recorded by [`SimScheduler`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedEvent {
    /// `save_current_state` was called.
    Save,
    /// `switch_to` handed the CPU to a task.
    Switch(TaskId, SwitchReason),
    /// `invoke_scheduler` ran.
    Schedule(SwitchReason),
    /// The current task yielded.
    Yield,
}

struct SimState {
    table: TaskTable,
    events: Vec<SchedEvent>,
    stray_sleepers: Vec<TaskId>,
}

/// A [`TaskTable`] that records the scheduling calls made on it.
///
/// Clones share the same table, so one instance can be handed to each
/// thread of a concurrency test.
#[derive(Clone)]
pub struct SimScheduler {
    state: Arc<Mutex<SimState>>,
}

impl Default for SimScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl SimScheduler {
    /// Only the kernel task, running.
    pub fn new() -> Self {
        SimScheduler {
            state: Arc::new(Mutex::new(SimState {
                table: TaskTable::new(),
                events: Vec::new(),
                stray_sleepers: Vec::new(),
            })),
        }
    }

    /// Adds a runnable task.
    ///
    /// # Panics
    ///
    /// When the task table is full.
    pub fn spawn(&self) -> TaskId {
        self.state
            .lock()
            .table
            .spawn(SavedFrame::default())
            .expect("task table full")
    }

    /// Makes `task` the running task without recording an event.
    pub fn set_current(&self, task: TaskId) {
        self.state.lock().table.switch_to(task, SwitchReason::Yield);
    }

    /// State of `task`.
    pub fn state(&self, task: TaskId) -> TaskState {
        self.state.lock().table.task_state(task)
    }

    /// What `task` waits on.
    pub fn wait_object(&self, task: TaskId) -> WaitObject {
        self.state.lock().table.wait_object(task)
    }

    /// Events recorded so far.
    pub fn events(&self) -> Vec<SchedEvent> {
        self.state.lock().events.clone()
    }

    /// Makes the policy ask for a reschedule.
    pub fn request_reschedule(&self) {
        self.state.lock().table.request_reschedule();
    }

    /// Lists `task` as sleeping without changing its state.
    pub fn force_sleeping_entry(&self, task: TaskId) {
        self.state.lock().stray_sleepers.push(task);
    }
}

impl Scheduler for SimScheduler {
    type Frame = SavedFrame;

    fn current_task(&self) -> TaskId {
        self.state.lock().table.current_task()
    }

    fn is_idle(&self, task: TaskId) -> bool {
        self.state.lock().table.is_idle(task)
    }

    fn task_state(&self, task: TaskId) -> TaskState {
        self.state(task)
    }

    fn change_state(&mut self, task: TaskId, state: TaskState) {
        self.state.lock().table.change_state(task, state);
    }

    fn set_wait_object(&mut self, task: TaskId, obj: WaitObject) {
        self.state.lock().table.set_wait_object(task, obj);
    }

    fn reset_wait_object(&mut self, task: TaskId) {
        self.state.lock().table.reset_wait_object(task);
    }

    fn save_current_state(&mut self, frame: &SavedFrame) {
        let mut state = self.state.lock();
        state.table.save_current_state(frame);
        state.events.push(SchedEvent::Save);
    }

    fn switch_to(&mut self, task: TaskId, reason: SwitchReason) {
        let mut state = self.state.lock();
        state.table.switch_to(task, reason);
        state.events.push(SchedEvent::Switch(task, reason));
    }

    fn invoke_scheduler(&mut self, reason: SwitchReason) {
        let mut state = self.state.lock();
        state.table.invoke_scheduler(reason);
        state.events.push(SchedEvent::Schedule(reason));
    }

    fn reschedule_needed(&self) -> bool {
        self.state.lock().table.reschedule_needed()
    }

    fn yield_now(&mut self) {
        let mut state = self.state.lock();
        state.table.yield_now();
        state.events.push(SchedEvent::Yield);
    }

    fn account_tick(&mut self) {
        self.state.lock().table.account_tick();
    }

    fn for_each_sleeping(&self, f: &mut dyn FnMut(TaskId, TaskState)) {
        let state = self.state.lock();
        state.table.for_each_sleeping(&mut *f);
        for &task in &state.stray_sleepers {
            f(task, state.table.task_state(task));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_file_short_reads() {
        let mut file = MemFile::with_max_read(vec![1, 2, 3, 4, 5], 2);
        let mut buf = [0u8; 5];
        file.read_exact(&mut buf).expect("read_exact");
        assert_eq!(buf, [1, 2, 3, 4, 5]);
        assert_eq!(file.read(&mut buf), Ok(0));
    }

    #[test]
    fn test_mem_file_seek() {
        let mut file = MemFile::new(vec![0; 8]);
        assert_eq!(file.seek(SeekFrom::Start(6)), Ok(6));
        assert_eq!(file.seek(SeekFrom::Current(-2)), Ok(4));
        assert_eq!(file.seek(SeekFrom::Current(-5)), Err(IoError::InvalidSeek));
        assert_eq!(file.position(), 4);
    }

    #[test]
    fn test_sim_frames_limit() {
        let mut frames = SimFrames::with_limit(1);
        assert_eq!(frames.alloc_frame(), Some(PhysAddr::new(0x10_0000)));
        assert_eq!(frames.alloc_frame(), None);
        assert_eq!(frames.allocated(), 1);
    }

    #[test]
    fn test_sim_space_rejects_double_map() {
        let mut space = SimAddressSpace::new();
        let page = VirtAddr::new(0x4000);
        space.map_page(page, PhysAddr::new(0x10_0000), true, false).expect("map");
        assert_eq!(
            space.map_page(page, PhysAddr::new(0x10_1000), true, false),
            Err(MapError::AlreadyMapped)
        );
        assert_eq!(space.read(page, 4), [STALE_BYTE; 4]);
    }
}
