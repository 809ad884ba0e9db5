//! The exception-port server: owns a receive right on the task and runs a
//! dedicated thread that turns `mach_exc` messages into `Exception` values.
//!
//! One message is outstanding at a time: the server does not reply to the
//! kernel (and therefore does not pick up the next message) until the
//! controller has room for the event. That keeps per-thread exception order
//! and never drops a code buffer.

use crate::bindings::mach_exc::{
    thread_set_exception_ports, NDR_record, __Reply__mach_exception_raise_t,
    __Request__mach_exception_raise_t, ExceptionMessage, EXCEPTION_DEFAULT_BEHAVIOR,
    MACH_EXCEPTION_CODES, MACH_EXCEPTION_RAISE_MSG_ID, THREAD_STATE_NONE,
};
use crate::errors::{kern_result, Result, SdbError};
use crate::event::{EventSlot, Exception};
use crate::thread::Thread;
use mach2::exception_types::{EXC_MASK_BAD_ACCESS, EXC_MASK_BAD_INSTRUCTION, EXC_MASK_BREAKPOINT};
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_init::mach_thread_self;
use mach2::mach_port::{mach_port_allocate, mach_port_insert_right};
use mach2::mach_types::{task_t, thread_act_t};
use mach2::message::{
    mach_msg, MACH_MSGH_BITS, MACH_MSGH_BITS_REMOTE_MASK, MACH_MSG_TIMEOUT_NONE,
    MACH_MSG_TYPE_MAKE_SEND, MACH_RCV_MSG, MACH_SEND_MSG,
};
use mach2::port::{mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE};
use std::mem;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{debug, warn};

pub(crate) struct ServerStartup {
    pub port: mach_port_t,
    pub thread_id: thread_act_t,
}

/// Creates the exception port, binds it as the handler for each of `threads`,
/// and spawns the server thread. Does not return until the server thread has
/// reported its kernel id.
pub(crate) fn start(task: task_t, threads: &[Thread], slot: Arc<EventSlot>) -> Result<ServerStartup> {
    let mut port: mach_port_t = MACH_PORT_NULL;
    kern_result(unsafe { mach_port_allocate(task, MACH_PORT_RIGHT_RECEIVE, &mut port) })?;
    kern_result(unsafe { mach_port_insert_right(task, port, port, MACH_MSG_TYPE_MAKE_SEND) })?;

    for thread in threads {
        kern_result(unsafe {
            thread_set_exception_ports(
                thread.port(),
                EXC_MASK_BREAKPOINT | EXC_MASK_BAD_ACCESS | EXC_MASK_BAD_INSTRUCTION,
                port,
                EXCEPTION_DEFAULT_BEHAVIOR | MACH_EXCEPTION_CODES,
                THREAD_STATE_NONE,
            )
        })?;
    }

    let (tx, rx) = mpsc::channel();
    thread::Builder::new()
        .name("sdb-exception-server".into())
        .spawn(move || {
            let _ = tx.send(unsafe { mach_thread_self() });
            serve(port, &slot);
        })
        .map_err(|e| SdbError::Posix(e.raw_os_error().unwrap_or(libc::EAGAIN)))?;
    let thread_id = rx.recv().map_err(|_| SdbError::Posix(libc::EAGAIN))?;
    debug!("exception server running on thread {}", thread_id);

    Ok(ServerStartup { port, thread_id })
}

fn serve(port: mach_port_t, slot: &EventSlot) {
    loop {
        let mut message: ExceptionMessage = unsafe { mem::zeroed() };
        let kr = unsafe {
            mach_msg(
                &mut message.body.Head,
                MACH_RCV_MSG,
                0,
                mem::size_of::<ExceptionMessage>() as u32,
                port,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        if kr != KERN_SUCCESS {
            // The port went away; teardown is the usual reason.
            warn!("exception receive failed: {:#x}", kr);
            return;
        }
        if message.body.Head.msgh_id != MACH_EXCEPTION_RAISE_MSG_ID {
            warn!("unexpected message id {}", message.body.Head.msgh_id);
            continue;
        }

        let code = message.body.code;
        let code_count = (message.body.codeCnt as usize).min(code.len());
        let exception = Exception {
            thread: message.body.thread.name,
            kind: message.body.exception,
            data: code[..code_count].to_vec(),
        };
        debug!(
            "exception kind {} from thread {}",
            exception.kind, exception.thread
        );

        // Blocks while the controller has not drained the previous event.
        slot.deposit_exception(exception);
        send_reply(&message.body);
    }
}

/// The reply shape comes from `mig -v /usr/include/mach/mach_exc.defs`:
/// same remote port, message id + 100, KERN_SUCCESS for "handled".
fn send_reply(request: &__Request__mach_exception_raise_t) {
    let mut reply: __Reply__mach_exception_raise_t = unsafe { mem::zeroed() };
    reply.Head.msgh_bits = MACH_MSGH_BITS(request.Head.msgh_bits & MACH_MSGH_BITS_REMOTE_MASK, 0);
    reply.Head.msgh_size = mem::size_of::<__Reply__mach_exception_raise_t>() as u32;
    reply.Head.msgh_remote_port = request.Head.msgh_remote_port;
    reply.Head.msgh_local_port = MACH_PORT_NULL;
    reply.Head.msgh_id = request.Head.msgh_id + 100;
    reply.NDR = unsafe { NDR_record };
    reply.RetCode = KERN_SUCCESS;

    let kr = unsafe {
        mach_msg(
            &mut reply.Head,
            MACH_SEND_MSG,
            mem::size_of::<__Reply__mach_exception_raise_t>() as u32,
            0,
            MACH_PORT_NULL,
            MACH_MSG_TIMEOUT_NONE,
            MACH_PORT_NULL,
        )
    };
    if kr != KERN_SUCCESS {
        warn!("exception reply failed: {:#x}", kr);
    }
}
