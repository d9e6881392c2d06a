//! Linear-scan register allocation over a tile list.
//!
//! Allocation runs in two single passes. The first walks the tiles in
//! program order, folding equivalent values together (copies alias their
//! source, value-yielding do-blocks alias their last child, `if` joins
//! union their two arms) and building a live range per surviving value.
//! The second pass visits ranges in ascending first-reference order off a
//! worklist heap, retires whatever ended, and hands out registers from a
//! FIFO ring, writing the chosen register number into every tile slot the
//! range touches.
//!
//! The active set is kept sorted by ascending last reference with plain
//! insertion sort: its size is bounded by the register file (seven on
//! x86-64), so the quadratic insertion is constant-time in practice.

pub mod liverange;
pub mod ring;

use crate::isa::x64::NONVOLATILE_GPR_BITMAP;
use crate::isa::RegClass;
use crate::result::{CodegenError, CodegenResult};
use crate::tile::{Opcode, TileList};
use liverange::{heap_pop, heapify, RangeId, RangeTable, ValueSets};
use log::trace;
use ring::{RegisterRing, MAX_ACTIVE};

struct RegisterAllocator {
    sets: ValueSets,
    table: RangeTable,
    /// Ranges not yet reached, as a min-heap keyed on first reference.
    worklist: Vec<RangeId>,
    /// Ranges currently holding a register, sorted by ascending last
    /// reference.
    active: Vec<RangeId>,
    /// Ranges whose registers have been released again.
    retired: Vec<RangeId>,
    ring: RegisterRing,
}

/// Allocate registers for `list`, writing a physical register number into
/// every tile value slot that resolves to a live value, then apply any
/// queued tile edits.
pub fn allocate(list: &mut TileList) -> CodegenResult<()> {
    trace!("allocating registers for {} tiles", list.len());
    let mut alc = RegisterAllocator {
        sets: ValueSets::new(list.num_nodes),
        table: RangeTable::with_capacity(list.len()),
        worklist: Vec::with_capacity(list.len()),
        active: Vec::with_capacity(MAX_ACTIVE),
        retired: Vec::new(),
        ring: RegisterRing::new(),
    };
    determine_live_ranges(&mut alc, list)?;
    linear_scan(&mut alc, list)?;
    trace!("retired {} live ranges", alc.retired.len());
    // Every register handed out must have come back.
    debug_assert_eq!(alc.ring.free_count(), MAX_ACTIVE);
    list.apply_edits();
    Ok(())
}

fn determine_live_ranges(alc: &mut RegisterAllocator, list: &TileList) -> CodegenResult<()> {
    for (i, tile) in list.tiles.iter().enumerate() {
        let i = i as u32;
        let node = tile.node;
        if !tile.has_template {
            continue;
        }
        match tile.op {
            // Aliases and joins, not definitions: no new range.
            Opcode::Copy => {
                let src = *tile
                    .refs
                    .first()
                    .ok_or(CodegenError::Invariant("copy without a source"))?;
                alc.sets.alias(node, src);
            }
            Opcode::Do if tile.yields_value => {
                let last = *tile
                    .refs
                    .last()
                    .ok_or(CodegenError::Invariant("do-block without children"))?;
                alc.sets.alias(node, last);
            }
            Opcode::If => {
                if tile.refs.len() < 2 {
                    return Err(CodegenError::Invariant("if-join without two arms"));
                }
                let root = alc.sets.union(&mut alc.table, tile.refs[0], tile.refs[1])?;
                alc.sets.alias(node, root);
            }
            _ => {
                if tile.yields_value {
                    let idx = alc.table.new_range();
                    alc.sets.define(node, idx);
                    alc.table.add_ref(idx, i, 0);
                    let spec = tile.register_spec.slot(0);
                    if spec.has_requirement() {
                        alc.table.range_mut(idx).register_spec = Some(spec.requirement());
                    }
                }
                for (j, &used) in tile.refs.iter().enumerate() {
                    let spec = tile.register_spec.slot(j + 1);
                    if spec.has_requirement() {
                        return Err(CodegenError::Nyi("register requirement on a use"));
                    }
                    if spec.is_used() {
                        let idx = alc
                            .sets
                            .range_of(used)
                            .ok_or(CodegenError::Invariant("use of an undefined value"))?;
                        alc.table.add_ref(idx, i, (j + 1) as u8);
                    }
                }
            }
        }
    }
    alc.worklist.extend(alc.table.range_ids());
    heapify(&alc.table, &mut alc.worklist);
    Ok(())
}

fn linear_scan(alc: &mut RegisterAllocator, list: &mut TileList) -> CodegenResult<()> {
    while let Some(v) = heap_pop(&alc.table, &mut alc.worklist) {
        // Unions can drain a range of all its references.
        if alc.table.is_empty(v) {
            continue;
        }
        let pos = alc.table.first_ref(v);
        active_set_expire(alc, pos)?;
        if let Some(reg) = alc.table.range(v).register_spec {
            if NONVOLATILE_GPR_BITMAP & (1u32 << reg) != 0 {
                // Non-volatile registers are permanently live; the range
                // costs no allocation and never joins the active set.
                assign_register(alc, list, v, RegClass::Nvr, reg);
            } else {
                return Err(CodegenError::Nyi(
                    "register requirement outside the non-volatile set",
                ));
            }
        } else {
            let reg = match alc.ring.take() {
                Some(reg) => reg,
                None => return spill_register(alc, list, pos),
            };
            assign_register(alc, list, v, RegClass::Gpr, reg);
            active_set_add(alc, v);
        }
    }
    active_set_expire(alc, u32::MAX)?;
    Ok(())
}

fn active_set_add(alc: &mut RegisterAllocator, v: RangeId) {
    let last = alc.table.last_ref(v);
    let at = alc
        .active
        .iter()
        .position(|&b| alc.table.last_ref(b) > last)
        .unwrap_or(alc.active.len());
    alc.active.insert(at, v);
    debug_assert!(alc.active.len() <= MAX_ACTIVE);
}

/// Retire every active range whose last reference is at or before
/// `position`, returning their registers to the ring.
fn active_set_expire(alc: &mut RegisterAllocator, position: u32) -> CodegenResult<()> {
    let mut expired = 0;
    for &v in alc.active.iter() {
        if alc.table.last_ref(v) > position {
            break;
        }
        let (_, reg) = alc
            .table
            .range(v)
            .assigned
            .ok_or(CodegenError::Invariant("active range without a register"))?;
        alc.ring.give(reg)?;
        expired += 1;
    }
    if expired > 0 {
        alc.retired.extend(alc.active.drain(..expired));
    }
    Ok(())
}

fn assign_register(
    alc: &mut RegisterAllocator,
    list: &mut TileList,
    v: RangeId,
    reg_cls: RegClass,
    reg_num: u8,
) {
    trace!("assigning {} register {} to {}", reg_cls, reg_num, v);
    alc.table.range_mut(v).assigned = Some((reg_cls, reg_num));
    for vref in alc.table.queue(v) {
        list.tiles[vref.tile as usize].values[vref.slot as usize] = reg_num as i8;
    }
    // Synthetic endpoint i carries its register in value slot i.
    for i in 0..2 {
        if let Some(synth) = alc.table.range_mut(v).synthetic[i].as_mut() {
            synth.tile.values[i] = reg_num as i8;
        }
    }
}

/// Spilling would need to pick a victim (the tail of the active set has the
/// most lifetime left to amortise the reload), split its range around the
/// spill position, insert a store after the definition and a load before
/// each use through the edit queue, and requeue the sub-ranges.
fn spill_register(
    _alc: &mut RegisterAllocator,
    _list: &mut TileList,
    _position: u32,
) -> CodegenResult<()> {
    Err(CodegenError::Nyi("spill"))
}
