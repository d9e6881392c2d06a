//! Result and error types for code generation.

use crate::tile::Opcode;
use thiserror::Error;

/// An error that prevented a tile list from being compiled.
///
/// The backend never recovers locally: every error aborts the current
/// compilation. The variants exist so the driver can tell *capability*
/// errors (bail out to the interpreter and carry on) from *invariant*
/// errors (an allocator bug worth a loud report) and plain bad input.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodegenError {
    /// A combination of inputs the backend does not handle yet, such as
    /// spilling, floating-point register allocation, or variadic C calls.
    #[error("not yet implemented: {0}")]
    Nyi(&'static str),

    /// An internal invariant of the register allocator was violated.
    #[error("register allocator invariant violated: {0}")]
    Invariant(&'static str),

    /// The emitter has no lowering for this opcode.
    #[error("unsupported opcode: {0}")]
    UnsupportedOpcode(Opcode),

    /// A C call asked for more arguments than the calling convention has
    /// argument registers.
    #[error("cannot pass {requested} C call arguments (limit {supported})")]
    TooManyArgs {
        /// Number of argument registers in the selected calling convention.
        supported: usize,
        /// Number of arguments the call descriptor carried.
        requested: usize,
    },
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error.
pub type CodegenResult<T> = Result<T, CodegenError>;
