//! Reference-counted software breakpoint bookkeeping.
//!
//! Two indexes are maintained as one invariant: `by_address` owns the
//! per-address record and `by_landing` maps the post-trap instruction
//! pointer back to the patched address. Patching itself lives in
//! `crate::machine`; the controller composes the two so this table stays
//! testable without touching page protections.

use crate::errors::{Result, SdbError};
use crate::machine::MachineBreakpointState;
use crate::remote_ptr::RemotePtr;
use std::collections::HashMap;
use tracing::debug;

/// Proof of an install; removal takes it back.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BreakpointHandle {
    address: RemotePtr,
}

impl BreakpointHandle {
    pub fn address(&self) -> RemotePtr {
        self.address
    }
}

struct BreakpointRecord {
    machine_state: MachineBreakpointState,
    landing: RemotePtr,
    /// Outstanding installs at this address; the record exists iff >= 1.
    counter: u32,
}

#[derive(Default)]
pub struct BreakpointTable {
    by_address: HashMap<RemotePtr, BreakpointRecord>,
    by_landing: HashMap<RemotePtr, RemotePtr>,
}

impl BreakpointTable {
    pub fn new() -> BreakpointTable {
        Default::default()
    }

    /// Bumps the counter of an existing breakpoint. `None` means nothing is
    /// installed at `address` yet and the caller must patch and `insert`.
    pub fn retain(&mut self, address: RemotePtr) -> Option<BreakpointHandle> {
        let record = self.by_address.get_mut(&address)?;
        record.counter += 1;
        debug!("retained breakpoint at {} (count {})", address, record.counter);
        Some(BreakpointHandle { address })
    }

    /// Records a freshly patched breakpoint with a counter of one.
    pub fn insert(
        &mut self,
        address: RemotePtr,
        machine_state: MachineBreakpointState,
        landing: RemotePtr,
    ) -> BreakpointHandle {
        let previous = self.by_address.insert(
            address,
            BreakpointRecord {
                machine_state,
                landing,
                counter: 1,
            },
        );
        assert!(previous.is_none(), "double insert at {}", address);
        self.by_landing.insert(landing, address);
        debug!("installed breakpoint at {} (landing {})", address, landing);
        BreakpointHandle { address }
    }

    /// Drops one reference. `Ok(None)` while other installs remain;
    /// `Ok(Some(state))` hands back the displaced bytes once the last
    /// reference is gone and both index entries have been removed.
    pub fn release(&mut self, handle: &BreakpointHandle) -> Result<Option<MachineBreakpointState>> {
        let record = self
            .by_address
            .get_mut(&handle.address)
            .ok_or(SdbError::InvalidBreakpoint)?;
        record.counter -= 1;
        if record.counter >= 1 {
            debug!(
                "released breakpoint at {} (count {})",
                handle.address, record.counter
            );
            return Ok(None);
        }
        let record = self.by_address.remove(&handle.address).unwrap();
        let back = self.by_landing.remove(&record.landing);
        assert_eq!(back, Some(handle.address), "landing index out of sync");
        debug!("removed breakpoint at {}", handle.address);
        Ok(Some(record.machine_state))
    }

    /// The address to rewind a thread to when its instruction pointer is a
    /// known landing address; `None` means the trap was a plain step and no
    /// rewind applies.
    pub fn rewind_address(&self, landing: RemotePtr) -> Option<RemotePtr> {
        self.by_landing.get(&landing).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.by_address.is_empty()
    }
}
