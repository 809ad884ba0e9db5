//! The controller: owns the task handle, the exception machinery, the
//! breakpoint table, and the allocation ledger for the current process.
//!
//! All mutable controller state is touched either on the controller thread
//! (the thread that constructed it) or inside an `Interrupter::send_interrupt`
//! critical section, which runs under the controller mutex. Foreign threads
//! have no other mutation path.

use crate::bindings::mach_exc::{
    mach_port_destroy, task_dyld_info_t, task_info, thread_terminate, TASK_DYLD_INFO,
    TASK_DYLD_INFO_COUNT,
};
use crate::breakpoints::{BreakpointHandle, BreakpointTable};
use crate::debugger::{
    resolve_resume_action, Debugger, MemoryPermissions, ThreadResumeAction, ThreadResumeEntry,
};
use crate::errors::{kern_result, Result, SdbError};
use crate::event::{DebugEvent, EventSlot, Interrupter};
use crate::exception_server;
use crate::machine::{MachineBreakpointState, MACHINE_BREAKPOINT_SIZE};
use crate::registers::Registers;
use crate::remote_ptr::RemotePtr;
use crate::thread::Thread;
use crate::vm;
use mach2::exception_types::EXC_BREAKPOINT;
use mach2::kern_return::{KERN_INVALID_ARGUMENT, KERN_NOT_SUPPORTED};
use mach2::mach_init::mach_thread_self;
use mach2::mach_port::mach_port_deallocate;
use mach2::mach_types::{task_t, thread_act_array_t, thread_act_t};
use mach2::message::mach_msg_type_number_t;
use mach2::port::{mach_port_t, MACH_PORT_NULL};
use mach2::task::task_threads;
use mach2::traps::mach_task_self;
use mach2::vm_prot::{VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_types::integer_t;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::mem;
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use tracing::debug;

pub struct Controller {
    task: task_t,
    /// The thread that constructed the controller; never enumerated.
    controller_thread: thread_act_t,
    /// Equals `controller_thread` until the exception server is started.
    server_thread: thread_act_t,
    exception_port: mach_port_t,
    slot: Arc<EventSlot>,
    breakpoints: BreakpointTable,
    allocations: HashMap<RemotePtr, usize>,
    utility_thread: Option<thread_act_t>,
    utility_join: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new() -> Controller {
        let task = unsafe { mach_task_self() };
        let controller_thread = unsafe { mach_thread_self() };
        debug!("controller thread {} of task {}", controller_thread, task);
        Controller {
            task,
            controller_thread,
            server_thread: controller_thread,
            exception_port: MACH_PORT_NULL,
            slot: Arc::new(EventSlot::new()),
            breakpoints: BreakpointTable::new(),
            allocations: HashMap::new(),
            utility_thread: None,
            utility_join: None,
        }
    }

    pub fn task(&self) -> task_t {
        self.task
    }

    /// Binds the exception port as the handler for each of `threads` and
    /// starts the server thread. Call once.
    pub fn initialize_exception_handling(&mut self, threads: &[Thread]) -> Result<()> {
        assert!(
            self.exception_port == MACH_PORT_NULL,
            "exception handling already initialized"
        );
        let startup = exception_server::start(self.task, threads, Arc::clone(&self.slot))?;
        self.exception_port = startup.port;
        self.server_thread = startup.thread_id;
        Ok(())
    }

    /// Blocks until a sibling thread raises a debug exception or someone
    /// posts an interrupt. A pending exception wins over a pending
    /// interrupt; the interrupt then comes back from the next call. The
    /// optional handler runs under the controller mutex before an
    /// `Interrupted` return.
    ///
    /// When the exception is a breakpoint whose landing address is known,
    /// the thread's instruction pointer is rewound to the patched address
    /// before the event is returned. Any other instruction pointer means a
    /// plain step or a foreign trap and stays untouched.
    pub fn wait_for_event(
        &mut self,
        interrupt_handler: Option<&mut dyn FnMut()>,
    ) -> Result<DebugEvent> {
        let event = self.slot.wait(interrupt_handler);
        if let DebugEvent::CaughtException(ref exception) = event {
            if exception.kind == EXC_BREAKPOINT as i32 {
                self.rewind_breakpoint_ip(Thread::new(exception.thread))?;
            }
        }
        Ok(event)
    }

    fn rewind_breakpoint_ip(&self, thread: Thread) -> Result<()> {
        let mut regs = thread.regs()?;
        if let Some(address) = self.breakpoints.rewind_address(regs.ip()) {
            debug!("rewinding thread {} to {}", thread.id(), address);
            regs.set_ip(address);
            thread.set_regs(&regs)?;
        }
        Ok(())
    }

    /// A capability other threads can use to wake `wait_for_event`. It holds
    /// no ownership of the controller and faults if used after teardown.
    pub fn interrupter(&self) -> Interrupter {
        Interrupter::new(&self.slot)
    }

    /// Wakes `wait_for_event`, running `f` under the controller mutex first.
    pub fn interrupt<F: FnOnce()>(&self, f: F) {
        self.slot.post_interrupt(f);
    }

    /// Starts the utility thread (at most one). The worker first registers
    /// its own kernel id through the interrupt path, so this does not return
    /// until enumeration can exclude it; the registration is observed by
    /// `wait_for_event` as an ordinary interrupt. Well-behaved workers poll
    /// `Interrupter::stop_requested` and exit when it reports true.
    pub fn run_utility_thread<F>(&mut self, f: F) -> Result<()>
    where
        F: FnOnce(Interrupter) + Send + 'static,
    {
        assert!(self.utility_join.is_none(), "utility thread already running");
        let interrupter = self.interrupter();
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("sdb-utility".into())
            .spawn(move || {
                let id = unsafe { mach_thread_self() };
                interrupter.send_interrupt(move || {
                    let _ = tx.send(id);
                });
                f(interrupter);
            })
            .map_err(|e| SdbError::Posix(e.raw_os_error().unwrap_or(libc::EAGAIN)))?;
        let id = rx.recv().map_err(|_| SdbError::Posix(libc::EAGAIN))?;
        debug!("utility thread {} registered", id);
        self.utility_thread = Some(id);
        self.utility_join = Some(handle);
        Ok(())
    }

    /// Snapshot of the task's threads minus the controller, server, and
    /// utility threads. Stale the moment the task resumes.
    pub fn get_threads(&self) -> Result<Vec<Thread>> {
        let mut list: thread_act_array_t = std::ptr::null_mut();
        let mut count: mach_msg_type_number_t = 0;
        kern_result(unsafe { task_threads(self.task, &mut list, &mut count) })?;

        let mut threads = Vec::with_capacity(count as usize);
        for i in 0..count as usize {
            let port = unsafe { *list.add(i) };
            if !self.is_service_thread(port) {
                threads.push(Thread::new(port));
            }
        }
        // The kernel vm_allocates the port array in our address space.
        let _ = vm::deallocate(
            self.task,
            RemotePtr::new(list as usize),
            count as usize * mem::size_of::<thread_act_t>(),
        );
        Ok(threads)
    }

    fn is_service_thread(&self, port: thread_act_t) -> bool {
        port == self.controller_thread
            || port == self.server_thread
            || self.utility_thread == Some(port)
    }

    /// Suspends every enumerated thread; the first failure aborts the batch
    /// with no rollback.
    pub fn suspend_threads(&self) -> Result<()> {
        for thread in self.get_threads()? {
            thread.suspend()?;
        }
        Ok(())
    }

    pub fn resume_threads(&self) -> Result<()> {
        for thread in self.get_threads()? {
            thread.resume()?;
        }
        Ok(())
    }

    /// Where dyld publishes its image list (`all_image_info_addr`).
    pub fn get_shared_library_info_address(&self) -> Result<RemotePtr> {
        let mut info = task_dyld_info_t::default();
        let mut count = TASK_DYLD_INFO_COUNT;
        kern_result(unsafe {
            task_info(
                self.task,
                TASK_DYLD_INFO,
                &mut info as *mut task_dyld_info_t as *mut integer_t,
                &mut count,
            )
        })?;
        let address = info.all_image_info_addr;
        Ok(RemotePtr::from(address))
    }

    /// Installs (or reference-counts) a software breakpoint. The first
    /// install widens the page to read+write+execute over the patched bytes;
    /// if anything later fails the page stays widened.
    pub fn install_breakpoint(&mut self, address: RemotePtr) -> Result<BreakpointHandle> {
        if let Some(handle) = self.breakpoints.retain(address) {
            return Ok(handle);
        }
        vm::protect(
            self.task,
            address,
            MACHINE_BREAKPOINT_SIZE,
            VM_PROT_READ | VM_PROT_WRITE | VM_PROT_EXECUTE,
        )?;
        let (state, landing) = unsafe { MachineBreakpointState::patch(address) };
        Ok(self.breakpoints.insert(address, state, landing))
    }

    /// Drops one reference; the last one restores the original instruction.
    pub fn remove_breakpoint(&mut self, handle: BreakpointHandle) -> Result<()> {
        if let Some(state) = self.breakpoints.release(&handle)? {
            unsafe { state.restore(handle.address()) };
        }
        Ok(())
    }

    /// Allocates `size` bytes with the requested access and records the
    /// region. A failed protect deallocates before surfacing the error.
    pub fn allocate(&mut self, size: usize, permissions: MemoryPermissions) -> Result<RemotePtr> {
        let base = vm::allocate(self.task, size)?;
        if let Err(error) = vm::protect(self.task, base, size, vm::native_protection(permissions)) {
            let _ = vm::deallocate(self.task, base, size);
            return Err(error);
        }
        self.allocations.insert(base, size);
        Ok(base)
    }

    /// Deallocates a region by the exact base `allocate` returned.
    pub fn deallocate(&mut self, address: RemotePtr) -> Result<()> {
        let size = *self
            .allocations
            .get(&address)
            .ok_or(SdbError::InvalidAllocation)?;
        vm::deallocate(self.task, address, size)?;
        self.allocations.remove(&address);
        Ok(())
    }

    pub fn read_memory(&self, address: RemotePtr, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; length];
        vm::read(self.task, address, &mut buf)?;
        Ok(buf)
    }

    pub fn write_memory(&self, address: RemotePtr, bytes: &[u8]) -> Result<()> {
        vm::write(self.task, address, bytes)
    }
}

impl Default for Controller {
    fn default() -> Self {
        Controller::new()
    }
}

impl Debugger for Controller {
    /// Only the current process can be controlled.
    fn attach(&mut self, process_id: u32) -> Result<()> {
        if process_id != std::process::id() {
            return Err(SdbError::Posix(libc::ESRCH));
        }
        Ok(())
    }

    fn kill_process(&mut self) -> Result<()> {
        kill(Pid::this(), Signal::SIGKILL).map_err(|e| {
            SdbError::Posix(e.as_errno().map(|errno| errno as i32).unwrap_or(libc::EINVAL))
        })
    }

    /// Forwarded method
    fn thread_ids(&mut self) -> Result<Vec<u64>> {
        Ok(self.get_threads()?.iter().map(Thread::id).collect())
    }

    fn resume(
        &mut self,
        entries: &[ThreadResumeEntry],
        default_action: ThreadResumeAction,
    ) -> Result<()> {
        for thread in self.get_threads()? {
            let (action, address) = resolve_resume_action(entries, default_action, thread.id());
            match action {
                ThreadResumeAction::ResumeNone => {}
                ThreadResumeAction::ResumeStop => thread.suspend()?,
                ThreadResumeAction::ResumeContinue => {
                    if let Some(address) = address {
                        thread.set_ip(address)?;
                    }
                    thread.resume()?;
                }
                ThreadResumeAction::ResumeStep => {
                    let mut regs = thread.regs()?;
                    if let Some(address) = address {
                        regs.set_ip(address);
                    }
                    if !regs.set_single_step(true) {
                        return Err(SdbError::Kernel(KERN_NOT_SUPPORTED));
                    }
                    thread.set_regs(&regs)?;
                    thread.resume()?;
                }
            }
        }
        Ok(())
    }

    /// Forwarded method
    fn install_breakpoint(&mut self, address: RemotePtr) -> Result<BreakpointHandle> {
        Controller::install_breakpoint(self, address)
    }

    /// Forwarded method
    fn remove_breakpoint(&mut self, handle: BreakpointHandle) -> Result<()> {
        Controller::remove_breakpoint(self, handle)
    }

    fn read_register(&mut self, thread_id: u64, set_id: u32, register_id: u32) -> Result<u64> {
        Thread::new(thread_id as thread_act_t).read_register(set_id, register_id)
    }

    fn write_register(
        &mut self,
        thread_id: u64,
        set_id: u32,
        register_id: u32,
        value: u64,
    ) -> Result<()> {
        Thread::new(thread_id as thread_act_t).write_register(set_id, register_id, value)
    }

    fn read_register_context(&mut self, thread_id: u64) -> Result<Vec<u8>> {
        Ok(Thread::new(thread_id as thread_act_t).regs()?.to_bytes())
    }

    fn write_register_context(&mut self, thread_id: u64, bytes: &[u8]) -> Result<()> {
        let regs =
            Registers::from_bytes(bytes).ok_or(SdbError::Kernel(KERN_INVALID_ARGUMENT))?;
        Thread::new(thread_id as thread_act_t).set_regs(&regs)
    }

    /// Forwarded method
    fn read_memory(&mut self, address: RemotePtr, length: usize) -> Result<Vec<u8>> {
        Controller::read_memory(self, address, length)
    }

    /// Forwarded method
    fn write_memory(&mut self, address: RemotePtr, bytes: &[u8]) -> Result<()> {
        Controller::write_memory(self, address, bytes)
    }

    /// Forwarded method
    fn allocate(&mut self, size: usize, permissions: MemoryPermissions) -> Result<RemotePtr> {
        Controller::allocate(self, size, permissions)
    }

    /// Forwarded method
    fn deallocate(&mut self, address: RemotePtr) -> Result<()> {
        Controller::deallocate(self, address)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.slot.request_stop();
        if let Some(handle) = self.utility_join.take() {
            let _ = handle.join();
        }
        if let Some(port) = self.utility_thread.take() {
            unsafe {
                mach_port_deallocate(self.task, port);
            }
        }
        // The server blocks in mach_msg with no cancellation point, so it is
        // terminated in place; errors here are swallowed.
        if self.exception_port != MACH_PORT_NULL {
            unsafe {
                thread_terminate(self.server_thread);
                mach_port_destroy(self.task, self.exception_port);
            }
        }
        unsafe {
            mach_port_deallocate(self.task, self.controller_thread);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::DebugEvent;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn enumeration_excludes_controller_thread() {
        let controller = Controller::new();
        let own = unsafe { mach_thread_self() };
        let threads = controller.get_threads().unwrap();
        assert!(threads.iter().all(|t| t.port() != own));
        unsafe {
            mach_port_deallocate(controller.task(), own);
        }
    }

    #[test]
    fn utility_thread_registers_and_interrupts() {
        let mut controller = Controller::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&counter);
        controller
            .run_utility_thread(move |interrupter| {
                interrupter.send_interrupt(move || {
                    observed.fetch_add(1, Ordering::SeqCst);
                });
            })
            .unwrap();
        assert!(controller.utility_thread.is_some());

        // The registration interrupt is already pending; the worker's own
        // may coalesce with it, so only one wake is guaranteed.
        assert_eq!(
            controller.wait_for_event(None).unwrap(),
            DebugEvent::Interrupted
        );

        // Teardown joins the worker, so its interrupt has run by now.
        drop(controller);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn allocation_ledger_round_trip() {
        let mut controller = Controller::new();
        let base = controller
            .allocate(4096, MemoryPermissions::READ | MemoryPermissions::WRITE)
            .unwrap();
        controller.write_memory(base, b"ok").unwrap();
        assert_eq!(controller.read_memory(base, 2).unwrap(), b"ok".to_vec());
        controller.deallocate(base).unwrap();
        assert_eq!(
            controller.deallocate(base),
            Err(SdbError::InvalidAllocation)
        );
    }

    // arm64 macOS refuses writable+executable pages outside MAP_JIT, so the
    // full install path is exercised on x86_64 only.
    #[cfg(target_arch = "x86_64")]
    #[test]
    fn breakpoint_refcount_end_to_end() {
        let mut controller = Controller::new();
        let base = controller
            .allocate(
                4096,
                MemoryPermissions::READ | MemoryPermissions::WRITE | MemoryPermissions::EXECUTE,
            )
            .unwrap();
        controller.write_memory(base, &[0x90; 8]).unwrap();

        let first = controller.install_breakpoint(base).unwrap();
        let second = controller.install_breakpoint(base).unwrap();
        let patched = controller.read_memory(base, 1).unwrap();
        assert_ne!(patched[0], 0x90);

        controller.remove_breakpoint(second).unwrap();
        assert_ne!(controller.read_memory(base, 1).unwrap()[0], 0x90);

        controller.remove_breakpoint(first).unwrap();
        assert_eq!(controller.read_memory(base, 1).unwrap()[0], 0x90);

        controller.deallocate(base).unwrap();
    }
}
