//! Hoist code generation library.
//!
//! This crate is the code generation core of the Hoist JIT: it takes a flat
//! list of *tiles* (atomic code generation units selected from an expression
//! tree by an external matcher), assigns physical registers to the values
//! flowing between them with a linear-scan allocator, and lowers them to
//! x86-64 machine code.
//!
//! The two central entry points are [`regalloc::allocate`], which mutates a
//! [`tile::TileList`] in place by writing register numbers into its value
//! slots, and [`isa::x64::emit::Emitter`], which consumes allocated tiles and
//! produces bytes, labels, and relocations in a [`binemit::CodeBuffer`].

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

pub use cranelift_entity as entity;

pub mod binemit;
pub mod isa;
pub mod offsets;
pub mod regalloc;
pub mod result;
pub mod tile;

pub use crate::result::{CodegenError, CodegenResult};
