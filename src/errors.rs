use thiserror::Error;

pub type Result<T> = std::result::Result<T, SdbError>;

/// Everything the controller surfaces to callers. Protocol-framing faults are
/// not here: the framer is total and reports them as packet variants instead.
#[derive(Error, Debug, Copy, Clone, Eq, PartialEq)]
pub enum SdbError {
    #[error("kernel primitive failed: {} ({0:#x})", kern_return_name(.0))]
    Kernel(i32),
    #[error("posix primitive failed: {} (errno {0})", errno_name(.0))]
    Posix(i32),
    #[error("no breakpoint is installed at the given address")]
    InvalidBreakpoint,
    #[error("no allocation is recorded at the given address")]
    InvalidAllocation,
}

/// `KERN_SUCCESS` is zero on every Mach; keeping the check here lets the
/// portable modules report kernel codes without linking mach2.
pub(crate) fn kern_result(kr: i32) -> Result<()> {
    if kr == 0 {
        Ok(())
    } else {
        Err(SdbError::Kernel(kr))
    }
}

/// Names for the kern_return_t values this crate actually runs into.
/// See <usr/include/mach/kern_return.h> for the full table.
fn kern_return_name(kr: &i32) -> &'static str {
    match *kr {
        1 => "KERN_INVALID_ADDRESS",
        2 => "KERN_PROTECTION_FAILURE",
        3 => "KERN_NO_SPACE",
        4 => "KERN_INVALID_ARGUMENT",
        5 => "KERN_FAILURE",
        6 => "KERN_RESOURCE_SHORTAGE",
        8 => "KERN_NO_ACCESS",
        9 => "KERN_MEMORY_FAILURE",
        10 => "KERN_MEMORY_ERROR",
        15 => "KERN_INVALID_NAME",
        16 => "KERN_INVALID_TASK",
        17 => "KERN_INVALID_RIGHT",
        18 => "KERN_INVALID_VALUE",
        20 => "KERN_INVALID_CAPABILITY",
        37 => "KERN_TERMINATED",
        46 => "KERN_NOT_SUPPORTED",
        49 => "KERN_OPERATION_TIMED_OUT",
        _ => "unrecognized kern_return_t",
    }
}

fn errno_name(code: &i32) -> &'static str {
    nix::errno::Errno::from_i32(*code).desc()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kern_result_maps_success_and_failure() {
        assert_eq!(kern_result(0), Ok(()));
        assert_eq!(kern_result(4), Err(SdbError::Kernel(4)));
    }

    #[test]
    fn display_names_known_codes() {
        let msg = SdbError::Kernel(2).to_string();
        assert!(msg.contains("KERN_PROTECTION_FAILURE"));
        let msg = SdbError::Posix(libc::EINVAL).to_string();
        assert!(msg.contains("errno"));
    }
}
