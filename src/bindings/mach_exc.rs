//! Raw declarations for the `mach_exc` MIG subsystem and a few thread/task
//! calls missing from `mach2`.
//!
//! The request/reply layouts follow `mig -v /usr/include/mach/mach_exc.defs`;
//! MIG packs these structures to four bytes, which matters here because the
//! 64-bit exception codes sit at a 4-byte offset.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]
#![allow(non_upper_case_globals)]

use mach2::exception_types::exception_mask_t;
use mach2::kern_return::kern_return_t;
use mach2::mach_types::{task_t, thread_act_t};
use mach2::message::{
    mach_msg_body_t, mach_msg_header_t, mach_msg_id_t, mach_msg_port_descriptor_t,
    mach_msg_trailer_t, mach_msg_type_number_t,
};
use mach2::port::mach_port_t;
use mach2::thread_status::{thread_state_flavor_t, thread_state_t};
use mach2::vm_types::{integer_t, mach_vm_address_t, mach_vm_size_t};
use static_assertions::assert_eq_size;

/// `exception_raise` in the `mach_exc` subsystem (base id 2405).
pub const MACH_EXCEPTION_RAISE_MSG_ID: mach_msg_id_t = 2405;

/// Exception behavior bits, kept as plain u32 so they OR together without
/// sign trouble: `MACH_EXCEPTION_CODES` is the top bit.
pub const EXCEPTION_DEFAULT_BEHAVIOR: u32 = 1;
pub const MACH_EXCEPTION_CODES: u32 = 0x8000_0000;

#[cfg(any(target_arch = "x86_64", target_arch = "x86"))]
pub const THREAD_STATE_NONE: thread_state_flavor_t = 13;
#[cfg(target_arch = "aarch64")]
pub const THREAD_STATE_NONE: thread_state_flavor_t = 5;

#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct NDR_record_t {
    mig_vers: libc::c_uchar,
    if_vers: libc::c_uchar,
    reserved1: libc::c_uchar,
    mig_encoding: libc::c_uchar,
    int_rep: libc::c_uchar,
    char_rep: libc::c_uchar,
    float_rep: libc::c_uchar,
    reserved32: libc::c_uchar,
}

assert_eq_size!(NDR_record_t, [u8; 8]);

#[repr(C, packed(4))]
#[derive(Copy, Clone, Debug)]
pub struct __Request__mach_exception_raise_t {
    pub Head: mach_msg_header_t,
    /* start of the kernel processed data */
    pub msgh_body: mach_msg_body_t,
    pub thread: mach_msg_port_descriptor_t,
    pub task: mach_msg_port_descriptor_t,
    /* end of the kernel processed data */
    pub NDR: NDR_record_t,
    pub exception: integer_t,
    pub codeCnt: mach_msg_type_number_t,
    pub code: [i64; 2],
}

assert_eq_size!(__Request__mach_exception_raise_t, [u8; 84]);

#[repr(C, packed(4))]
#[derive(Copy, Clone, Debug)]
pub struct __Reply__mach_exception_raise_t {
    pub Head: mach_msg_header_t,
    pub NDR: NDR_record_t,
    pub RetCode: kern_return_t,
}

assert_eq_size!(__Reply__mach_exception_raise_t, [u8; 36]);

/// Receive buffer for one exception message: the request plus the trailer
/// the kernel appends.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct ExceptionMessage {
    pub body: __Request__mach_exception_raise_t,
    pub trailer: mach_msg_trailer_t,
}

/// TASK_DYLD_INFO, /usr/include/mach/task_info.h
pub const TASK_DYLD_INFO: u32 = 17;

#[repr(C, packed(4))]
#[derive(Copy, Clone, Debug, Default)]
pub struct task_dyld_info_t {
    pub all_image_info_addr: mach_vm_address_t,
    pub all_image_info_size: mach_vm_size_t,
    pub all_image_info_format: integer_t,
}

pub const TASK_DYLD_INFO_COUNT: mach_msg_type_number_t =
    (std::mem::size_of::<task_dyld_info_t>() / std::mem::size_of::<u32>())
        as mach_msg_type_number_t;

#[cfg(target_arch = "aarch64")]
#[repr(C)]
#[derive(Copy, Clone, Debug, Default)]
pub struct arm_thread_state64_t {
    pub __x: [u64; 29],
    pub __fp: u64, // frame pointer x29
    pub __lr: u64, // link register x30
    pub __sp: u64, // stack pointer x31
    pub __pc: u64,
    pub __cpsr: u32,
    pub __pad: u32,
}

#[cfg(target_arch = "aarch64")]
pub const ARM_THREAD_STATE64: thread_state_flavor_t = 6;

extern "C" {
    pub static NDR_record: NDR_record_t;

    pub fn thread_set_state(
        target_act: thread_act_t,
        flavor: thread_state_flavor_t,
        new_state: thread_state_t,
        new_state_count: mach_msg_type_number_t,
    ) -> kern_return_t;

    pub fn thread_set_exception_ports(
        thread: thread_act_t,
        exception_mask: exception_mask_t,
        new_port: mach_port_t,
        behavior: libc::c_uint,
        new_flavor: thread_state_flavor_t,
    ) -> kern_return_t;

    pub fn thread_suspend(target_act: thread_act_t) -> kern_return_t;

    pub fn thread_resume(target_act: thread_act_t) -> kern_return_t;

    pub fn thread_terminate(target_act: thread_act_t) -> kern_return_t;

    pub fn task_info(
        target_task: task_t,
        flavor: u32,
        task_info_out: *mut integer_t,
        task_info_count: *mut mach_msg_type_number_t,
    ) -> kern_return_t;

    pub fn mach_port_destroy(task: mach_port_t, name: mach_port_t) -> kern_return_t;
}
