//! Target instruction set abstractions.
//!
//! The backend targets a single 64-bit architecture (x86-64), so this layer
//! is thin: a calling-convention identifier shared by the emitter entry
//! points, and the register-class vocabulary the allocator hands out.

pub mod x64;

use core::fmt;
use core::str;

/// Calling convention identifiers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// System V-style convention used on most platforms.
    SystemV,
    /// Windows "fastcall" convention for x64.
    WindowsFastcall,
}

impl CallConv {
    /// Return the default calling convention for the host.
    pub fn host_default() -> Self {
        if cfg!(windows) {
            Self::WindowsFastcall
        } else {
            Self::SystemV
        }
    }
}

impl fmt::Display for CallConv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Self::SystemV => "system_v",
            Self::WindowsFastcall => "windows_fastcall",
        })
    }
}

impl str::FromStr for CallConv {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system_v" => Ok(Self::SystemV),
            "windows_fastcall" => Ok(Self::WindowsFastcall),
            _ => Err(()),
        }
    }
}

/// Storage classes the register allocator can place a value in.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum RegClass {
    /// Allocatable general-purpose (volatile) integer register.
    Gpr,
    /// Non-volatile integer register, assigned by requirement only and
    /// never drawn from the free ring.
    Nvr,
    /// Floating-point register. Not allocated yet; values move through
    /// fixed SSE registers in the emitter.
    Fpr,
}

impl fmt::Display for RegClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Self::Gpr => "gpr",
            Self::Nvr => "nvr",
            Self::Fpr => "fpr",
        })
    }
}
