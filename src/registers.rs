//! Thread register context in the native architecture's Mach flavor.
//!
//! Single registers are addressed by `(set id, register id)` pairs the way
//! the remote protocol does; the full context moves as the raw thread-state
//! byte image. Only the general-purpose set is exposed, set id 1.

use crate::remote_ptr::RemotePtr;
use cfg_if::cfg_if;
use mach2::message::mach_msg_type_number_t;
use mach2::thread_status::thread_state_flavor_t;
use std::mem;

/// The general-purpose register set.
pub const GPR_SET_ID: u32 = 1;

#[cfg(target_arch = "x86_64")]
const X86_TF_FLAG: u64 = 1 << 8;

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub(crate) type ArchThreadState = mach2::structs::x86_thread_state64_t;

        pub(crate) const THREAD_STATE_FLAVOR: thread_state_flavor_t =
            mach2::thread_status::x86_THREAD_STATE64;
    } else if #[cfg(target_arch = "aarch64")] {
        pub(crate) type ArchThreadState = crate::bindings::mach_exc::arm_thread_state64_t;

        pub(crate) const THREAD_STATE_FLAVOR: thread_state_flavor_t =
            crate::bindings::mach_exc::ARM_THREAD_STATE64;
    } else {
        compile_error!("unsupported target architecture");
    }
}

macro_rules! arch_reg {
    ($slf:expr, $x86case:ident, $armcase:ident) => {{
        cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                $slf.state.$x86case as u64
            } else if #[cfg(target_arch = "aarch64")] {
                $slf.state.$armcase as u64
            }
        }
    }};
}

macro_rules! arch_set_reg {
    ($slf:expr, $x86case:ident, $armcase:ident, $val:expr) => {{
        cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                $slf.state.$x86case = $val;
            } else if #[cfg(target_arch = "aarch64")] {
                $slf.state.$armcase = $val;
            }
        }
    }};
}

#[derive(Copy, Clone)]
pub struct Registers {
    state: ArchThreadState,
}

impl Registers {
    pub fn new() -> Registers {
        Registers {
            // Plain words only; all-zero is a valid state image.
            state: unsafe { mem::zeroed() },
        }
    }

    pub(crate) fn word_count() -> mach_msg_type_number_t {
        (mem::size_of::<ArchThreadState>() / mem::size_of::<u32>()) as mach_msg_type_number_t
    }

    pub(crate) fn state_words_mut(&mut self) -> *mut u32 {
        &mut self.state as *mut ArchThreadState as *mut u32
    }

    pub fn ip(&self) -> RemotePtr {
        RemotePtr::new(arch_reg!(self, __rip, __pc) as usize)
    }

    pub fn set_ip(&mut self, address: RemotePtr) {
        arch_set_reg!(self, __rip, __pc, address.as_u64());
    }

    pub fn sp(&self) -> RemotePtr {
        RemotePtr::new(arch_reg!(self, __rsp, __sp) as usize)
    }

    /// Reads one register; `None` for an unknown set or id.
    pub fn get(&self, set_id: u32, register_id: u32) -> Option<u64> {
        if set_id != GPR_SET_ID {
            return None;
        }
        self.get_gpr(register_id)
    }

    /// Writes one register; reports whether the `(set, id)` pair is known.
    pub fn set(&mut self, set_id: u32, register_id: u32, value: u64) -> bool {
        if set_id != GPR_SET_ID {
            return false;
        }
        self.set_gpr(register_id, value)
    }

    /// Arms or disarms the per-instruction trap. Reports false where the
    /// architecture has no flag reachable through the GPR state (aarch64
    /// keeps it in debug state, which this flavor does not carry).
    pub fn set_single_step(&mut self, enable: bool) -> bool {
        cfg_if! {
            if #[cfg(target_arch = "x86_64")] {
                if enable {
                    self.state.__rflags |= X86_TF_FLAG;
                } else {
                    self.state.__rflags &= !X86_TF_FLAG;
                }
                true
            } else {
                let _ = enable;
                false
            }
        }
    }

    /// The raw thread-state image, as the protocol's full-context reads
    /// expect it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let ptr = &self.state as *const ArchThreadState as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, mem::size_of::<ArchThreadState>()) }.to_vec()
    }

    /// Rebuilds a context from a full byte image; `None` on a size mismatch.
    pub fn from_bytes(bytes: &[u8]) -> Option<Registers> {
        if bytes.len() != mem::size_of::<ArchThreadState>() {
            return None;
        }
        let mut regs = Registers::new();
        let ptr = &mut regs.state as *mut ArchThreadState as *mut u8;
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Some(regs)
    }
}

impl Default for Registers {
    fn default() -> Self {
        Registers::new()
    }
}

cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        impl Registers {
            fn get_gpr(&self, id: u32) -> Option<u64> {
                let s = &self.state;
                Some(match id {
                    0 => s.__rax,
                    1 => s.__rbx,
                    2 => s.__rcx,
                    3 => s.__rdx,
                    4 => s.__rdi,
                    5 => s.__rsi,
                    6 => s.__rbp,
                    7 => s.__rsp,
                    8 => s.__r8,
                    9 => s.__r9,
                    10 => s.__r10,
                    11 => s.__r11,
                    12 => s.__r12,
                    13 => s.__r13,
                    14 => s.__r14,
                    15 => s.__r15,
                    16 => s.__rip,
                    17 => s.__rflags,
                    18 => s.__cs,
                    19 => s.__fs,
                    20 => s.__gs,
                    _ => return None,
                })
            }

            fn set_gpr(&mut self, id: u32, value: u64) -> bool {
                let s = &mut self.state;
                match id {
                    0 => s.__rax = value,
                    1 => s.__rbx = value,
                    2 => s.__rcx = value,
                    3 => s.__rdx = value,
                    4 => s.__rdi = value,
                    5 => s.__rsi = value,
                    6 => s.__rbp = value,
                    7 => s.__rsp = value,
                    8 => s.__r8 = value,
                    9 => s.__r9 = value,
                    10 => s.__r10 = value,
                    11 => s.__r11 = value,
                    12 => s.__r12 = value,
                    13 => s.__r13 = value,
                    14 => s.__r14 = value,
                    15 => s.__r15 = value,
                    16 => s.__rip = value,
                    17 => s.__rflags = value,
                    18 => s.__cs = value,
                    19 => s.__fs = value,
                    20 => s.__gs = value,
                    _ => return false,
                }
                true
            }
        }
    } else if #[cfg(target_arch = "aarch64")] {
        impl Registers {
            fn get_gpr(&self, id: u32) -> Option<u64> {
                let s = &self.state;
                Some(match id {
                    0..=28 => s.__x[id as usize],
                    29 => s.__fp,
                    30 => s.__lr,
                    31 => s.__sp,
                    32 => s.__pc,
                    33 => u64::from(s.__cpsr),
                    _ => return None,
                })
            }

            fn set_gpr(&mut self, id: u32, value: u64) -> bool {
                let s = &mut self.state;
                match id {
                    0..=28 => s.__x[id as usize] = value,
                    29 => s.__fp = value,
                    30 => s.__lr = value,
                    31 => s.__sp = value,
                    32 => s.__pc = value,
                    33 => s.__cpsr = value as u32,
                    _ => return false,
                }
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ip_and_sp_round_trip() {
        let mut regs = Registers::new();
        regs.set_ip(RemotePtr::new(0x10_0000));
        assert_eq!(regs.ip(), RemotePtr::new(0x10_0000));
        assert_eq!(regs.sp(), RemotePtr::null());
    }

    #[test]
    fn gpr_set_round_trip() {
        let mut regs = Registers::new();
        assert!(regs.set(GPR_SET_ID, 0, 0xdead_beef));
        assert_eq!(regs.get(GPR_SET_ID, 0), Some(0xdead_beef));
        assert_eq!(regs.get(GPR_SET_ID + 1, 0), None);
        assert_eq!(regs.get(GPR_SET_ID, 999), None);
        assert!(!regs.set(GPR_SET_ID, 999, 1));
    }

    #[test]
    fn context_bytes_round_trip() {
        let mut regs = Registers::new();
        regs.set_ip(RemotePtr::new(0x4242));
        let bytes = regs.to_bytes();
        assert_eq!(bytes.len(), std::mem::size_of::<ArchThreadState>());
        let copy = Registers::from_bytes(&bytes).unwrap();
        assert_eq!(copy.ip(), RemotePtr::new(0x4242));
        assert!(Registers::from_bytes(&bytes[1..]).is_none());
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn single_step_sets_trap_flag() {
        let mut regs = Registers::new();
        assert!(regs.set_single_step(true));
        assert_eq!(regs.get(GPR_SET_ID, 17), Some(1 << 8));
        assert!(regs.set_single_step(false));
        assert_eq!(regs.get(GPR_SET_ID, 17), Some(0));
    }
}
