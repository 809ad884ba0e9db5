//! The control surface a packet dispatcher drives.
//!
//! The trait mirrors the remote protocol's operations one to one; the
//! controller implements it for the current task. Keeping the types here,
//! away from the Mach-specific modules, lets dispatcher code and tests build
//! on every platform.

use crate::breakpoints::BreakpointHandle;
use crate::errors::Result;
use crate::remote_ptr::RemotePtr;
use bitflags::bitflags;

bitflags! {
    /// Requested access for an allocated region. Translation to native
    /// protection bits ignores unknown flags.
    pub struct MemoryPermissions: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadReference {
    Id(u64),
    Any,
    All,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ThreadResumeAction {
    /// Leave the thread as it is.
    ResumeNone,
    ResumeStop,
    ResumeContinue,
    ResumeStep,
}

#[derive(Copy, Clone, Debug)]
pub struct ThreadResumeEntry {
    pub thread: ThreadReference,
    pub action: ThreadResumeAction,
    /// Move the instruction pointer here before applying the action.
    pub address: Option<RemotePtr>,
}

/// Picks the action for `thread_id`: the first entry naming it (by id or as
/// a wildcard) wins, otherwise `default_action` with no address override.
pub fn resolve_resume_action(
    entries: &[ThreadResumeEntry],
    default_action: ThreadResumeAction,
    thread_id: u64,
) -> (ThreadResumeAction, Option<RemotePtr>) {
    for entry in entries {
        let matches = match entry.thread {
            ThreadReference::Id(id) => id == thread_id,
            ThreadReference::Any | ThreadReference::All => true,
        };
        if matches {
            return (entry.action, entry.address);
        }
    }
    (default_action, None)
}

/// Operations the remote-debugging dispatcher needs from the target.
pub trait Debugger {
    fn attach(&mut self, process_id: u32) -> Result<()>;
    fn kill_process(&mut self) -> Result<()>;

    /// Kernel ids of the debuggable threads; the controller's own service
    /// threads never appear here.
    fn thread_ids(&mut self) -> Result<Vec<u64>>;
    /// Applies a per-thread action to every debuggable thread; entries are
    /// consulted in order, `default_action` covers the rest.
    fn resume(
        &mut self,
        entries: &[ThreadResumeEntry],
        default_action: ThreadResumeAction,
    ) -> Result<()>;

    fn install_breakpoint(&mut self, address: RemotePtr) -> Result<BreakpointHandle>;
    fn remove_breakpoint(&mut self, handle: BreakpointHandle) -> Result<()>;

    fn read_register(&mut self, thread_id: u64, set_id: u32, register_id: u32) -> Result<u64>;
    fn write_register(
        &mut self,
        thread_id: u64,
        set_id: u32,
        register_id: u32,
        value: u64,
    ) -> Result<()>;
    /// The full register context as the architecture's byte image.
    fn read_register_context(&mut self, thread_id: u64) -> Result<Vec<u8>>;
    fn write_register_context(&mut self, thread_id: u64, bytes: &[u8]) -> Result<()>;

    fn read_memory(&mut self, address: RemotePtr, length: usize) -> Result<Vec<u8>>;
    fn write_memory(&mut self, address: RemotePtr, bytes: &[u8]) -> Result<()>;

    fn allocate(&mut self, size: usize, permissions: MemoryPermissions) -> Result<RemotePtr>;
    fn deallocate(&mut self, address: RemotePtr) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_entry_wins() {
        let entries = [
            ThreadResumeEntry {
                thread: ThreadReference::Id(4),
                action: ThreadResumeAction::ResumeStep,
                address: Some(RemotePtr::new(0x1000)),
            },
            ThreadResumeEntry {
                thread: ThreadReference::All,
                action: ThreadResumeAction::ResumeContinue,
                address: None,
            },
        ];
        assert_eq!(
            resolve_resume_action(&entries, ThreadResumeAction::ResumeNone, 4),
            (ThreadResumeAction::ResumeStep, Some(RemotePtr::new(0x1000)))
        );
        assert_eq!(
            resolve_resume_action(&entries, ThreadResumeAction::ResumeNone, 9),
            (ThreadResumeAction::ResumeContinue, None)
        );
    }

    #[test]
    fn default_applies_when_nothing_matches() {
        let entries = [ThreadResumeEntry {
            thread: ThreadReference::Id(2),
            action: ThreadResumeAction::ResumeStop,
            address: None,
        }];
        assert_eq!(
            resolve_resume_action(&entries, ThreadResumeAction::ResumeContinue, 3),
            (ThreadResumeAction::ResumeContinue, None)
        );
    }

    #[test]
    fn unknown_permission_bits_are_dropped() {
        let perms = MemoryPermissions::from_bits_truncate(0xff);
        assert_eq!(
            perms,
            MemoryPermissions::READ | MemoryPermissions::WRITE | MemoryPermissions::EXECUTE
        );
    }
}
