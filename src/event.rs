//! The single-slot rendezvous between the exception server thread and the
//! controller thread.
//!
//! One mutex and one condition variable guard the caught-exception slot and
//! the interrupt flag. The server blocks while the previous exception is
//! undrained (back-pressure keeps per-thread delivery ordered and never drops
//! an exception's data buffer), and an interrupt posted while an exception is
//! pending is observed on the wait after the exception is returned.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use tracing::trace;

/// A debug exception as decoded off the exception port.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Exception {
    /// Kernel thread id (mach port name) of the thread that raised it.
    pub thread: u32,
    /// Exception type (`EXC_BREAKPOINT`, `EXC_BAD_ACCESS`, ...).
    pub kind: i32,
    /// The machine-word exception codes; owned by whoever drains the event.
    pub data: Vec<i64>,
}

#[derive(Debug, Eq, PartialEq)]
pub enum DebugEvent {
    CaughtException(Exception),
    Interrupted,
}

#[derive(Default)]
struct SlotState {
    exception: Option<Exception>,
    has_interrupt: bool,
}

#[derive(Default)]
pub struct EventSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
    stop: AtomicBool,
}

impl EventSlot {
    pub fn new() -> EventSlot {
        Default::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Server side. Blocks while the previously deposited exception has not
    /// been drained, then fills the slot and wakes the controller.
    pub fn deposit_exception(&self, exception: Exception) {
        let mut state = self.lock();
        while state.exception.is_some() {
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        trace!(
            "depositing exception kind {} from thread {}",
            exception.kind,
            exception.thread
        );
        state.exception = Some(exception);
        self.cond.notify_all();
    }

    /// Sets the interrupt flag and runs `f` while still holding the mutex,
    /// then wakes the controller. `f` therefore happens-before the
    /// controller's observation of the interrupt.
    pub fn post_interrupt<F: FnOnce()>(&self, f: F) {
        let mut state = self.lock();
        state.has_interrupt = true;
        f();
        self.cond.notify_all();
    }

    /// Controller side. Blocks until an exception or an interrupt is
    /// pending. Exceptions win when both are: the interrupt flag is left set
    /// and comes back from the next call.
    pub fn wait(&self, mut on_interrupt: Option<&mut dyn FnMut()>) -> DebugEvent {
        let mut state = self.lock();
        loop {
            if let Some(exception) = state.exception.take() {
                // The server may be blocked on the full slot.
                self.cond.notify_all();
                return DebugEvent::CaughtException(exception);
            }
            if state.has_interrupt {
                if let Some(handler) = on_interrupt.as_mut() {
                    handler();
                }
                state.has_interrupt = false;
                return DebugEvent::Interrupted;
            }
            state = self.cond.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }
}

/// Capability for waking the controller from a foreign thread.
///
/// Holds a non-owning reference to the controller's slot so that it cannot
/// extend the controller's lifetime; using it after teardown is a
/// programming error and panics.
#[derive(Clone)]
pub struct Interrupter {
    slot: Weak<EventSlot>,
}

impl Interrupter {
    pub(crate) fn new(slot: &Arc<EventSlot>) -> Interrupter {
        Interrupter {
            slot: Arc::downgrade(slot),
        }
    }

    /// Wakes the controller's `wait_for_event`, running `f` under the
    /// controller mutex first. This is the only safe mutation path into
    /// controller-owned state from foreign threads.
    pub fn send_interrupt<F: FnOnce()>(&self, f: F) {
        let slot = self
            .slot
            .upgrade()
            .expect("interrupter used after controller teardown");
        slot.post_interrupt(f);
    }

    /// Cooperative shutdown flag; utility functions are expected to poll
    /// this each iteration. Reports true once the controller is gone.
    pub fn stop_requested(&self) -> bool {
        match self.slot.upgrade() {
            Some(slot) => slot.stop_requested(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn exception(thread: u32) -> Exception {
        Exception {
            thread,
            kind: 6,
            data: vec![1, 0],
        }
    }

    #[test]
    fn interrupt_wakes_a_blocked_wait() {
        let slot = Arc::new(EventSlot::new());
        let counter = Arc::new(AtomicUsize::new(0));

        let waiter = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || slot.wait(None))
        };

        thread::sleep(Duration::from_millis(50));
        let interrupter = Interrupter::new(&slot);
        let n = Arc::clone(&counter);
        interrupter.send_interrupt(move || {
            n.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(waiter.join().unwrap(), DebugEvent::Interrupted);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exception_wins_over_concurrent_interrupt() {
        let slot = EventSlot::new();
        slot.deposit_exception(exception(7));
        slot.post_interrupt(|| {});

        assert_eq!(slot.wait(None), DebugEvent::CaughtException(exception(7)));
        // The interrupt was not lost; it comes back from the next wait.
        assert_eq!(slot.wait(None), DebugEvent::Interrupted);
    }

    #[test]
    fn interrupt_handler_runs_before_the_flag_clears() {
        let slot = EventSlot::new();
        slot.post_interrupt(|| {});
        let mut handled = 0;
        let mut handler = || handled += 1;
        assert_eq!(slot.wait(Some(&mut handler)), DebugEvent::Interrupted);
        assert_eq!(handled, 1);
    }

    #[test]
    fn second_deposit_blocks_until_first_is_drained() {
        let slot = Arc::new(EventSlot::new());
        let second_deposited = Arc::new(AtomicBool::new(false));

        slot.deposit_exception(exception(1));
        let depositor = {
            let slot = Arc::clone(&slot);
            let flag = Arc::clone(&second_deposited);
            thread::spawn(move || {
                slot.deposit_exception(exception(2));
                flag.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!second_deposited.load(Ordering::SeqCst));

        assert_eq!(slot.wait(None), DebugEvent::CaughtException(exception(1)));
        depositor.join().unwrap();
        assert!(second_deposited.load(Ordering::SeqCst));
        assert_eq!(slot.wait(None), DebugEvent::CaughtException(exception(2)));
    }

    #[test]
    fn interrupter_reports_stop_after_teardown() {
        let slot = Arc::new(EventSlot::new());
        let interrupter = Interrupter::new(&slot);
        assert!(!interrupter.stop_requested());
        slot.request_stop();
        assert!(interrupter.stop_requested());
        drop(slot);
        assert!(interrupter.stop_requested());
    }

    #[test]
    #[should_panic(expected = "interrupter used after controller teardown")]
    fn interrupter_faults_after_teardown() {
        let slot = Arc::new(EventSlot::new());
        let interrupter = Interrupter::new(&slot);
        drop(slot);
        interrupter.send_interrupt(|| {});
    }
}
