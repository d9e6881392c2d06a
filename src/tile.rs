//! Tiles: the atomic units of code generation.
//!
//! A tile pairs an opcode with the expression-tree node it computes and with
//! up to [`TILE_VALUES`] *value slots*: slot 0 is the value the tile defines,
//! slots 1.. are the values it uses. The register allocator resolves each
//! used slot to a live range and writes a physical register number into the
//! slot; the emitter then reads the slots when lowering.
//!
//! Tiles are produced by an external matcher walking an expression tree;
//! this module only defines the shape the allocator and emitter agree on.

use core::fmt;
use cranelift_entity::entity_impl;
use smallvec::SmallVec;

/// An opaque reference to an expression tree node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(u32);
entity_impl!(Node, "node");

/// The number of value slots on a tile: one definition plus up to three uses.
pub const TILE_VALUES: usize = 4;

/// The closed set of operations the backend understands.
///
/// `Copy`, `Do`, and `If` are allocator-level operations: they alias or join
/// values and have no lowering of their own. Everything else is a primitive
/// the emitter knows how to turn into machine code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[allow(missing_docs)]
pub enum Opcode {
    // Value plumbing handled entirely by the register allocator.
    Copy,
    Do,
    If,

    // Constants.
    ConstI64Short,
    ConstI64,
    ConstN64,
    ConstStr,

    // Argument and object field access.
    GetArg,
    GetField,
    GetFieldObj,
    BindField,
    BindFieldObj,
    Set,

    // Integer arithmetic.
    AddI,
    SubI,
    MulI,
    DivI,
    ModI,
    IncI,
    DecI,

    // Floating-point arithmetic and conversions.
    AddN,
    SubN,
    MulN,
    DivN,
    CoerceIN,
    CoerceNI,

    // Integer comparisons.
    EqI,
    NeI,
    LtI,
    LeI,
    GtI,
    GeI,

    // Control flow.
    IfI,
    UnlessI,
    Goto,
}

impl Opcode {
    /// The conventional name of this operation in bytecode listings.
    pub fn name(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Do => "do",
            Self::If => "if",
            Self::ConstI64Short => "const_i64_16",
            Self::ConstI64 => "const_i64",
            Self::ConstN64 => "const_n64",
            Self::ConstStr => "const_s",
            Self::GetArg => "sp_getarg",
            Self::GetField => "sp_p6oget",
            Self::GetFieldObj => "sp_p6oget_o",
            Self::BindField => "sp_p6obind",
            Self::BindFieldObj => "sp_p6obind_o",
            Self::Set => "set",
            Self::AddI => "add_i",
            Self::SubI => "sub_i",
            Self::MulI => "mul_i",
            Self::DivI => "div_i",
            Self::ModI => "mod_i",
            Self::IncI => "inc_i",
            Self::DecI => "dec_i",
            Self::AddN => "add_n",
            Self::SubN => "sub_n",
            Self::MulN => "mul_n",
            Self::DivN => "div_n",
            Self::CoerceIN => "coerce_in",
            Self::CoerceNI => "coerce_ni",
            Self::EqI => "eq_i",
            Self::NeI => "ne_i",
            Self::LtI => "lt_i",
            Self::LeI => "le_i",
            Self::GtI => "gt_i",
            Self::GeI => "ge_i",
            Self::IfI => "if_i",
            Self::UnlessI => "unless_i",
            Self::Goto => "goto",
        }
    }

    /// Does a tile with this opcode define a value in slot 0 by default?
    ///
    /// `Do` yields a value only when its block does; the tile builder
    /// overrides the flag in that case.
    pub fn yields_value(self) -> bool {
        match self {
            Self::ConstI64Short
            | Self::ConstI64
            | Self::ConstN64
            | Self::ConstStr
            | Self::GetArg
            | Self::GetField
            | Self::GetFieldObj
            | Self::AddI
            | Self::SubI
            | Self::MulI
            | Self::DivI
            | Self::ModI
            | Self::AddN
            | Self::SubN
            | Self::MulN
            | Self::DivN
            | Self::CoerceIN
            | Self::CoerceNI
            | Self::EqI
            | Self::NeI
            | Self::LtI
            | Self::LeI
            | Self::GtI
            | Self::GeI => true,
            _ => false,
        }
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Packed per-slot register specifications.
///
/// Each value slot owns eight bits: bit 0 is set when the slot carries a
/// specific register requirement, bit 1 when the slot is used at all, and
/// bits 2..8 hold the required register number.
#[derive(Copy, Clone, Default, PartialEq, Eq, Debug)]
pub struct RegSpec(u64);

/// The specification bits for a single value slot.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SlotSpec(u8);

impl SlotSpec {
    const HAS_REQUIREMENT: u8 = 0b01;
    const IS_USED: u8 = 0b10;

    /// Does this slot demand one specific physical register?
    pub fn has_requirement(self) -> bool {
        self.0 & Self::HAS_REQUIREMENT != 0
    }

    /// Does this slot participate in allocation at all?
    pub fn is_used(self) -> bool {
        self.0 & Self::IS_USED != 0
    }

    /// The required register number. Meaningless unless
    /// [`SlotSpec::has_requirement`] returns true.
    pub fn requirement(self) -> u8 {
        self.0 >> 2
    }
}

impl RegSpec {
    /// A specification with every slot unused and unconstrained.
    pub fn new() -> Self {
        Self(0)
    }

    /// Extract the specification byte for `slot`.
    pub fn slot(self, slot: usize) -> SlotSpec {
        debug_assert!(slot < 8);
        SlotSpec((self.0 >> (slot * 8)) as u8)
    }

    /// Mark `slot` as used.
    pub fn with_used(self, slot: usize) -> Self {
        debug_assert!(slot < 8);
        Self(self.0 | (u64::from(SlotSpec::IS_USED) << (slot * 8)))
    }

    /// Mark `slot` as used and requiring physical register `reg`.
    pub fn with_requirement(self, slot: usize, reg: u8) -> Self {
        debug_assert!(slot < 8);
        debug_assert!(reg < 64);
        let bits = SlotSpec::IS_USED | SlotSpec::HAS_REQUIREMENT | (reg << 2);
        Self(self.0 | (u64::from(bits) << (slot * 8)))
    }
}

/// One atomic code generation unit.
#[derive(Clone, Debug)]
pub struct Tile {
    /// The operation this tile performs.
    pub op: Opcode,
    /// The expression-tree node the tile computes.
    pub node: Node,
    /// Physical register numbers per value slot, -1 before allocation.
    /// Slot 0 is the definition, slots 1.. the uses.
    pub values: [i8; TILE_VALUES],
    /// Per-slot register specifications.
    pub register_spec: RegSpec,
    /// Node ids of the values this tile uses, in slot order (slot `j + 1`
    /// corresponds to `refs[j]`).
    pub refs: SmallVec<[Node; 3]>,
    /// False for pseudo-tiles, which carry structure (labels, argument
    /// marshalling markers) but no template and are skipped by allocation.
    pub has_template: bool,
    /// Whether slot 0 defines a value.
    pub yields_value: bool,
    /// Operand size in bytes.
    pub size: u8,
}

impl Tile {
    /// Create a tile for `op` computing `node`, with no uses yet.
    pub fn new(op: Opcode, node: Node) -> Self {
        Self {
            op,
            node,
            values: [-1; TILE_VALUES],
            register_spec: RegSpec::new(),
            refs: SmallVec::new(),
            has_template: true,
            yields_value: op.yields_value(),
            size: 8,
        }
    }

    /// Create a pseudo-tile: participates in the list but not in allocation.
    pub fn pseudo(op: Opcode, node: Node) -> Self {
        let mut tile = Self::new(op, node);
        tile.has_template = false;
        tile.yields_value = false;
        tile
    }

    /// Add a used value in the next free use slot.
    pub fn with_use(mut self, node: Node) -> Self {
        let slot = self.refs.len() + 1;
        debug_assert!(slot < TILE_VALUES);
        self.refs.push(node);
        self.register_spec = self.register_spec.with_used(slot);
        self
    }

    /// Require that slot 0 (the definition) lands in physical register `reg`.
    pub fn with_requirement(mut self, reg: u8) -> Self {
        self.register_spec = self.register_spec.with_requirement(0, reg);
        self
    }
}

/// A list of tiles in program order, plus a queue of pending edits.
///
/// The allocator (and, later, the spiller) does not splice tiles into the
/// list while walking it; insertions are queued and applied in one pass by
/// [`TileList::apply_edits`] once the walk is done.
pub struct TileList {
    /// The tiles, in program order.
    pub tiles: Vec<Tile>,
    /// Exclusive upper bound of expression node ids referenced by the tiles.
    pub num_nodes: u32,
    edits: Vec<(usize, Tile)>,
}

impl TileList {
    /// Create an empty list covering `num_nodes` expression nodes.
    pub fn new(num_nodes: u32) -> Self {
        Self {
            tiles: Vec::new(),
            num_nodes,
            edits: Vec::new(),
        }
    }

    /// Append a tile, returning its index.
    pub fn push(&mut self, tile: Tile) -> usize {
        self.tiles.push(tile);
        self.tiles.len() - 1
    }

    /// Number of tiles in the list.
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    /// Is the list empty?
    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    /// Queue `tile` for insertion before the tile currently at `index`.
    pub fn queue_insert(&mut self, index: usize, tile: Tile) {
        debug_assert!(index <= self.tiles.len());
        self.edits.push((index, tile));
    }

    /// Apply all queued insertions. Earlier-queued tiles at the same index
    /// end up earlier in the list.
    pub fn apply_edits(&mut self) {
        if self.edits.is_empty() {
            return;
        }
        let mut edits = core::mem::take(&mut self.edits);
        edits.sort_by_key(|&(index, _)| index);
        for (index, tile) in edits.into_iter().rev() {
            self.tiles.insert(index, tile);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    #[test]
    fn reg_spec_slots_are_independent() {
        let spec = RegSpec::new().with_used(1).with_requirement(2, 14);
        assert!(!spec.slot(0).is_used());
        assert!(spec.slot(1).is_used());
        assert!(!spec.slot(1).has_requirement());
        assert!(spec.slot(2).is_used());
        assert!(spec.slot(2).has_requirement());
        assert_eq!(spec.slot(2).requirement(), 14);
    }

    #[test]
    fn edits_apply_in_queue_order() {
        let mut list = TileList::new(4);
        list.push(Tile::new(Opcode::ConstI64, Node::new(0)));
        list.push(Tile::new(Opcode::ConstI64, Node::new(1)));
        list.queue_insert(1, Tile::new(Opcode::Set, Node::new(2)));
        list.queue_insert(1, Tile::new(Opcode::Set, Node::new(3)));
        list.apply_edits();
        let nodes: Vec<_> = list.tiles.iter().map(|t| t.node).collect();
        assert_eq!(
            nodes,
            vec![Node::new(0), Node::new(2), Node::new(3), Node::new(1)]
        );
    }
}
