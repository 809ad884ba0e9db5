//! Hand-declared Mach bits that `mach2` doesn't cover.

pub mod mach_exc;
