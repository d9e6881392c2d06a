//! Binary machine code emission.
//!
//! The `binemit` module owns the byte buffer the emitter writes into, the
//! label table used for branches, and the relocation records a host needs to
//! patch absolute pointers after moving the code. Forward branches are
//! emitted as zeroed rel32 fields and fixed up by [`CodeBuffer::finalize`]
//! once every label has been bound.

use crate::result::{CodegenError, CodegenResult};
use core::fmt;
use cranelift_entity::{entity_impl, PrimaryMap};

/// Offset in bytes from the beginning of the emitted function.
pub type CodeOffset = u32;

/// Relocation kinds the emitter can request.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reloc {
    /// Absolute 8-byte pointer embedded in the instruction stream.
    Abs8,
}

impl fmt::Display for Reloc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Abs8 => write!(f, "Abs8"),
        }
    }
}

/// A branch target within the function being emitted.
///
/// Two label spaces coexist: the reserved global `exit` label created with
/// the buffer, and dynamic labels handed out by [`CodeBuffer::get_label`]
/// for the bytecode's own control flow.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(u32);
entity_impl!(Label, "label");

/// A pending rel32 reference to a label, patched at finalization.
struct LabelFixup {
    /// Offset of the 4-byte displacement field. The displacement is
    /// relative to the end of that field.
    offset: CodeOffset,
    label: Label,
}

/// A growable machine code buffer with label and relocation tracking.
pub struct CodeBuffer {
    bytes: Vec<u8>,
    labels: PrimaryMap<Label, Option<CodeOffset>>,
    fixups: Vec<LabelFixup>,
    relocs: Vec<(CodeOffset, Reloc)>,
}

/// The bytes and relocations of a fully emitted function.
pub struct FinalizedCode {
    /// The machine code, with all label references resolved.
    pub bytes: Vec<u8>,
    /// Positions of absolute pointers the host may need to patch.
    pub relocs: Vec<(CodeOffset, Reloc)>,
}

impl CodeBuffer {
    /// Create an empty buffer. The global `exit` label is created eagerly
    /// and can be fetched with [`CodeBuffer::exit_label`].
    pub fn new() -> Self {
        let mut labels = PrimaryMap::new();
        labels.push(None);
        Self {
            bytes: Vec::new(),
            labels,
            fixups: Vec::new(),
            relocs: Vec::new(),
        }
    }

    /// The reserved label bound at the function epilogue.
    pub fn exit_label(&self) -> Label {
        Label::from_u32(0)
    }

    /// Current write position.
    pub fn offset(&self) -> CodeOffset {
        self.bytes.len() as CodeOffset
    }

    /// Add 1 byte.
    pub fn put1(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    /// Add 2 bytes, little-endian.
    pub fn put2(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Add 4 bytes, little-endian.
    pub fn put4(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Add 8 bytes, little-endian.
    pub fn put8(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    /// Add an 8-byte value and record a relocation for it at its offset.
    pub fn put8_reloc(&mut self, value: u64, reloc: Reloc) {
        self.relocs.push((self.offset(), reloc));
        self.put8(value);
    }

    /// Allocate a fresh, unbound dynamic label.
    pub fn get_label(&mut self) -> Label {
        self.labels.push(None)
    }

    /// Bind `label` to the current offset. A label can be bound only once.
    pub fn bind_label(&mut self, label: Label) {
        debug_assert!(self.labels[label].is_none(), "label bound twice");
        self.labels[label] = Some(self.offset());
    }

    /// Emit a zeroed rel32 displacement referencing `label`, to be patched
    /// at finalization.
    pub fn reloc_rel32(&mut self, label: Label) {
        self.fixups.push(LabelFixup {
            offset: self.offset(),
            label,
        });
        self.put4(0);
    }

    /// Relocation records accumulated so far.
    pub fn relocs(&self) -> &[(CodeOffset, Reloc)] {
        &self.relocs
    }

    /// Resolve every label fixup and return the finished code.
    ///
    /// Fails with an invariant error if any referenced label was never
    /// bound: the driver emitted a branch to a label point it never emitted.
    pub fn finalize(mut self) -> CodegenResult<FinalizedCode> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label]
                .ok_or(CodegenError::Invariant("branch to unbound label"))?;
            let rel = target.wrapping_sub(fixup.offset + 4) as i32;
            let site = fixup.offset as usize;
            self.bytes[site..site + 4].copy_from_slice(&rel.to_le_bytes());
        }
        Ok(FinalizedCode {
            bytes: self.bytes,
            relocs: self.relocs,
        })
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn puts_are_little_endian() {
        let mut buf = CodeBuffer::new();
        buf.put1(0x01);
        buf.put2(0x0302);
        buf.put4(0x0706_0504);
        buf.put8(0x0f0e_0d0c_0b0a_0908);
        let code = buf.finalize().unwrap();
        assert_eq!(code.bytes, (0x01u8..=0x0f).collect::<Vec<u8>>());
    }

    #[test]
    fn forward_label_is_patched() {
        let mut buf = CodeBuffer::new();
        let label = buf.get_label();
        buf.put1(0xe9);
        buf.reloc_rel32(label);
        buf.put1(0x90);
        buf.put1(0x90);
        buf.bind_label(label);
        let code = buf.finalize().unwrap();
        // Jump over the two nops: displacement 2 from the end of the field.
        assert_eq!(code.bytes, vec![0xe9, 0x02, 0x00, 0x00, 0x00, 0x90, 0x90]);
    }

    #[test]
    fn backward_label_is_patched() {
        let mut buf = CodeBuffer::new();
        let label = buf.get_label();
        buf.bind_label(label);
        buf.put1(0x90);
        buf.put1(0xe9);
        buf.reloc_rel32(label);
        let code = buf.finalize().unwrap();
        // Back to offset 0: -6 from the end of the displacement field.
        assert_eq!(code.bytes, vec![0x90, 0xe9, 0xfa, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut buf = CodeBuffer::new();
        let label = buf.get_label();
        buf.put1(0xe9);
        buf.reloc_rel32(label);
        assert_eq!(
            buf.finalize().err(),
            Some(CodegenError::Invariant("branch to unbound label"))
        );
    }

    #[test]
    fn abs8_relocs_are_recorded() {
        let mut buf = CodeBuffer::new();
        buf.put1(0x48);
        buf.put1(0xb9);
        buf.put8_reloc(0xdead_beef, Reloc::Abs8);
        let code = buf.finalize().unwrap();
        assert_eq!(code.relocs, vec![(2, Reloc::Abs8)]);
    }
}
