//! Operations on one thread of the controlled task.

use crate::bindings::mach_exc::{thread_resume, thread_set_state, thread_suspend};
use crate::errors::{kern_result, Result, SdbError};
use crate::registers::{Registers, THREAD_STATE_FLAVOR};
use crate::remote_ptr::RemotePtr;
use mach2::kern_return::KERN_INVALID_ARGUMENT;
use mach2::mach_types::thread_act_t;
use mach2::thread_act::thread_get_state;

/// Handle on a thread of the controlled task. The port name stays valid for
/// the thread's lifetime; callers must not assume a handle survives task
/// resumption (the thread may exit).
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Thread {
    port: thread_act_t,
}

impl Thread {
    pub fn new(port: thread_act_t) -> Thread {
        Thread { port }
    }

    pub(crate) fn port(&self) -> thread_act_t {
        self.port
    }

    /// The kernel id the protocol and enumeration use.
    pub fn id(&self) -> u64 {
        u64::from(self.port)
    }

    /// Current register context; meaningful only while the thread is
    /// suspended or stopped in an exception.
    pub fn regs(&self) -> Result<Registers> {
        let mut regs = Registers::new();
        let mut count = Registers::word_count();
        kern_result(unsafe {
            thread_get_state(
                self.port,
                THREAD_STATE_FLAVOR,
                regs.state_words_mut(),
                &mut count,
            )
        })?;
        Ok(regs)
    }

    pub fn set_regs(&self, regs: &Registers) -> Result<()> {
        let mut copy = *regs;
        kern_result(unsafe {
            thread_set_state(
                self.port,
                THREAD_STATE_FLAVOR,
                copy.state_words_mut(),
                Registers::word_count(),
            )
        })
    }

    pub fn ip(&self) -> Result<RemotePtr> {
        Ok(self.regs()?.ip())
    }

    pub fn set_ip(&self, address: RemotePtr) -> Result<()> {
        let mut regs = self.regs()?;
        regs.set_ip(address);
        self.set_regs(&regs)
    }

    pub fn suspend(&self) -> Result<()> {
        kern_result(unsafe { thread_suspend(self.port) })
    }

    pub fn resume(&self) -> Result<()> {
        kern_result(unsafe { thread_resume(self.port) })
    }

    pub fn read_register(&self, set_id: u32, register_id: u32) -> Result<u64> {
        self.regs()?
            .get(set_id, register_id)
            .ok_or(SdbError::Kernel(KERN_INVALID_ARGUMENT))
    }

    pub fn write_register(&self, set_id: u32, register_id: u32, value: u64) -> Result<()> {
        let mut regs = self.regs()?;
        if !regs.set(set_id, register_id, value) {
            return Err(SdbError::Kernel(KERN_INVALID_ARGUMENT));
        }
        self.set_regs(&regs)
    }
}
