//! In-process debugging for Mach tasks.
//!
//! A `Controller` attaches to its own process, routes debug exceptions from
//! sibling threads through a dedicated exception-port server, and mediates
//! breakpoints, registers, memory, and thread control. The wire codec and
//! payload parser for the remote debugging protocol are platform-neutral and
//! usable on their own; everything that talks to the kernel is macOS-only.
//!
//! The usual shape of a session:
//!
//! 1. `Controller::new()` on the thread that will drive debugging.
//! 2. `get_threads()` + `initialize_exception_handling(&threads)`.
//! 3. Loop on `wait_for_event`, inspecting and resuming threads between
//!    events; any other thread wakes the loop through an `Interrupter`.

pub mod breakpoints;
pub mod debugger;
pub mod errors;
pub mod event;
pub mod machine;
pub mod packets;
pub mod payload;
pub mod remote_ptr;

#[cfg(target_os = "macos")]
pub mod bindings;
#[cfg(target_os = "macos")]
pub mod controller;
#[cfg(target_os = "macos")]
mod exception_server;
#[cfg(target_os = "macos")]
pub mod registers;
#[cfg(target_os = "macos")]
pub mod thread;
#[cfg(target_os = "macos")]
pub mod vm;

pub use crate::breakpoints::{BreakpointHandle, BreakpointTable};
pub use crate::debugger::{
    Debugger, MemoryPermissions, ThreadReference, ThreadResumeAction, ThreadResumeEntry,
};
pub use crate::errors::{Result, SdbError};
pub use crate::event::{DebugEvent, EventSlot, Exception, Interrupter};
pub use crate::packets::{parse_packets, Packet};
pub use crate::payload::PayloadReader;
pub use crate::remote_ptr::RemotePtr;

#[cfg(target_os = "macos")]
pub use crate::controller::Controller;
#[cfg(target_os = "macos")]
pub use crate::thread::Thread;
