//! Architecture-specific breakpoint patching.
//!
//! The controlled task is the current process, so patching is a plain store
//! through the address once the page has been made writable. What differs per
//! architecture is the trap encoding and where the instruction pointer lands
//! when the trap is taken: one past the patch on x86_64, on the patch itself
//! on aarch64.

use crate::remote_ptr::RemotePtr;
use cfg_if::cfg_if;
use std::ptr;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        /// `int3`
        const BREAKPOINT_CODE: [u8; 1] = [0xcc];

        fn landing_address(address: RemotePtr) -> RemotePtr {
            address + BREAKPOINT_CODE.len()
        }
    } else if #[cfg(target_arch = "aarch64")] {
        /// `brk #0`, little-endian
        const BREAKPOINT_CODE: [u8; 4] = [0x00, 0x00, 0x20, 0xd4];

        fn landing_address(address: RemotePtr) -> RemotePtr {
            address
        }
    } else {
        compile_error!("unsupported target architecture");
    }
}

/// Number of bytes a breakpoint patch covers; page protection must be widened
/// over at least this many bytes before patching.
pub const MACHINE_BREAKPOINT_SIZE: usize = BREAKPOINT_CODE.len();

#[cfg(all(target_os = "macos", target_arch = "aarch64"))]
extern "C" {
    fn sys_icache_invalidate(start: *mut libc::c_void, size: usize);
}

fn flush_instruction_cache(address: RemotePtr) {
    #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
    unsafe {
        sys_icache_invalidate(
            address.as_usize() as *mut libc::c_void,
            MACHINE_BREAKPOINT_SIZE,
        );
    }
    #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
    let _ = address;
}

/// The bytes a breakpoint patch displaced; enough to undo the patch.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MachineBreakpointState {
    original_bytes: [u8; MACHINE_BREAKPOINT_SIZE],
}

impl MachineBreakpointState {
    /// Writes the trap encoding at `address` and returns the displaced bytes
    /// together with the landing address the exception handler will observe.
    ///
    /// # Safety
    ///
    /// `address` must point at `MACHINE_BREAKPOINT_SIZE` writable bytes in
    /// the current process, and no other thread may be executing through
    /// them mid-store.
    pub unsafe fn patch(address: RemotePtr) -> (MachineBreakpointState, RemotePtr) {
        let target = address.as_usize() as *mut u8;
        let mut original_bytes = [0u8; MACHINE_BREAKPOINT_SIZE];
        ptr::copy_nonoverlapping(target, original_bytes.as_mut_ptr(), MACHINE_BREAKPOINT_SIZE);
        ptr::copy_nonoverlapping(BREAKPOINT_CODE.as_ptr(), target, MACHINE_BREAKPOINT_SIZE);
        flush_instruction_cache(address);
        (
            MachineBreakpointState { original_bytes },
            landing_address(address),
        )
    }

    /// Puts the displaced bytes back.
    ///
    /// # Safety
    ///
    /// `address` must be the address this state was captured at, still
    /// writable, with no thread executing through it.
    pub unsafe fn restore(&self, address: RemotePtr) {
        let target = address.as_usize() as *mut u8;
        ptr::copy_nonoverlapping(
            self.original_bytes.as_ptr(),
            target,
            MACHINE_BREAKPOINT_SIZE,
        );
        flush_instruction_cache(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer_ptr(buf: &mut [u8]) -> RemotePtr {
        RemotePtr::new(buf.as_mut_ptr() as usize)
    }

    #[test]
    fn patch_writes_trap_and_restore_undoes_it() {
        let mut buf = [0u8; 16];
        for (i, b) in buf.iter_mut().enumerate() {
            *b = 0x40 + i as u8;
        }
        let pristine = buf;

        let addr = buffer_ptr(&mut buf);
        let (state, _) = unsafe { MachineBreakpointState::patch(addr) };
        assert_eq!(&buf[..MACHINE_BREAKPOINT_SIZE], &BREAKPOINT_CODE[..]);
        assert_eq!(&buf[MACHINE_BREAKPOINT_SIZE..], &pristine[MACHINE_BREAKPOINT_SIZE..]);

        unsafe { state.restore(addr) };
        assert_eq!(buf, pristine);
    }

    #[test]
    fn landing_address_matches_architecture() {
        let mut buf = [0u8; 16];
        let addr = buffer_ptr(&mut buf);
        let (state, landing) = unsafe { MachineBreakpointState::patch(addr) };
        #[cfg(target_arch = "x86_64")]
        assert_eq!(landing, addr + 1);
        #[cfg(target_arch = "aarch64")]
        assert_eq!(landing, addr);
        unsafe { state.restore(addr) };
    }
}
