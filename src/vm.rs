//! Virtual-memory primitives on the controlled task.
//!
//! Stateless wrappers over the `mach_vm` subsystem; the controller keeps the
//! allocation ledger. Reads and writes go through the kernel rather than raw
//! pointer copies so that a bad address comes back as a `Kernel` error
//! instead of faulting the debugger itself.

use crate::debugger::MemoryPermissions;
use crate::errors::{kern_result, Result};
use crate::remote_ptr::RemotePtr;
use mach2::mach_types::task_t;
use mach2::message::mach_msg_type_number_t;
use mach2::vm::{
    mach_vm_allocate, mach_vm_deallocate, mach_vm_protect, mach_vm_read_overwrite, mach_vm_write,
};
use mach2::vm_prot::{vm_prot_t, VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE};
use mach2::vm_statistics::VM_FLAGS_ANYWHERE;
use mach2::vm_types::{mach_vm_address_t, mach_vm_size_t};
use tracing::debug;

/// Translates a permission set to native protection bits; unknown bits
/// contribute nothing.
pub fn native_protection(permissions: MemoryPermissions) -> vm_prot_t {
    let mut prot = 0;
    if permissions.contains(MemoryPermissions::READ) {
        prot |= VM_PROT_READ;
    }
    if permissions.contains(MemoryPermissions::WRITE) {
        prot |= VM_PROT_WRITE;
    }
    if permissions.contains(MemoryPermissions::EXECUTE) {
        prot |= VM_PROT_EXECUTE;
    }
    prot
}

/// Allocates `size` bytes anywhere in the task.
pub fn allocate(task: task_t, size: usize) -> Result<RemotePtr> {
    let mut address: mach_vm_address_t = 0;
    kern_result(unsafe {
        mach_vm_allocate(task, &mut address, size as mach_vm_size_t, VM_FLAGS_ANYWHERE)
    })?;
    debug!("allocated {} bytes at {:#x}", size, address);
    Ok(RemotePtr::from(address))
}

pub fn protect(
    task: task_t,
    address: RemotePtr,
    size: usize,
    protection: vm_prot_t,
) -> Result<()> {
    kern_result(unsafe {
        mach_vm_protect(
            task,
            address.as_u64(),
            size as mach_vm_size_t,
            0,
            protection,
        )
    })
}

pub fn deallocate(task: task_t, address: RemotePtr, size: usize) -> Result<()> {
    debug!("deallocating {} bytes at {}", size, address);
    kern_result(unsafe { mach_vm_deallocate(task, address.as_u64(), size as mach_vm_size_t) })
}

pub fn read(task: task_t, address: RemotePtr, buf: &mut [u8]) -> Result<()> {
    let mut read_size: mach_vm_size_t = 0;
    kern_result(unsafe {
        mach_vm_read_overwrite(
            task,
            address.as_u64(),
            buf.len() as mach_vm_size_t,
            buf.as_mut_ptr() as mach_vm_address_t,
            &mut read_size,
        )
    })
}

pub fn write(task: task_t, address: RemotePtr, bytes: &[u8]) -> Result<()> {
    kern_result(unsafe {
        mach_vm_write(
            task,
            address.as_u64(),
            bytes.as_ptr() as _,
            bytes.len() as mach_msg_type_number_t,
        )
    })
}
