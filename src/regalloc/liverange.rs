//! Live ranges, value reference queues, and value sets.
//!
//! A value's *live range* is the interval of tile order between its first and
//! last reference. Each range owns a queue of [`ValueRef`]s, back-pointers
//! into the tile list kept in non-decreasing tile order so the scan can read
//! endpoints off the ends in constant time. Equivalent values (copies,
//! do-blocks, branch joins) are folded together by a union-find over node
//! ids whose roots carry the range index.
//!
//! Value refs live in one arena, pre-sized and linked by index, so building
//! liveness allocates nothing per reference and the whole table is dropped
//! wholesale when allocation finishes.

use crate::isa::RegClass;
use crate::result::{CodegenError, CodegenResult};
use crate::tile::{Node, Tile};
use cranelift_entity::packed_option::PackedOption;
use cranelift_entity::{entity_impl, PrimaryMap};

/// An opaque reference to a live range.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RangeId(u32);
entity_impl!(RangeId, "lr");

/// An opaque reference to a value reference in the arena.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RefId(u32);
entity_impl!(RefId, "vref");

/// A back-pointer from a live range into the tile list.
#[derive(Copy, Clone, Debug)]
pub struct ValueRef {
    /// Index of the referencing tile.
    pub tile: u32,
    /// Value slot on that tile: 0 for the definition, 1.. for uses.
    pub slot: u8,
    next: PackedOption<RefId>,
}

impl ValueRef {
    /// Is this the defining reference?
    pub fn is_def(&self) -> bool {
        self.slot == 0
    }
}

/// A synthetic range endpoint: a position paired with a tile that carries
/// the endpoint but is not part of the main queue. At most one may be
/// attached before the first definition and one after the last use (spill
/// stores and reloads, phi-like joins).
#[derive(Clone, Debug)]
pub struct Synthetic {
    /// Position in tile order.
    pub pos: u32,
    /// The carried tile; assignment writes the range's register into its
    /// value slot matching the endpoint index.
    pub tile: Tile,
}

/// A contiguous interval of program order during which a value is held.
#[derive(Clone, Debug, Default)]
pub struct LiveRange {
    first: PackedOption<RefId>,
    last: PackedOption<RefId>,
    /// Synthetic endpoints: `[0]` before the first queued reference, `[1]`
    /// after the last.
    pub synthetic: [Option<Synthetic>; 2],
    /// Required physical register, if slot 0 of the defining tile carried
    /// a requirement.
    pub register_spec: Option<u8>,
    /// Storage class and register number once placed.
    pub assigned: Option<(RegClass, u8)>,
}

/// The live range table: all ranges of a compilation plus the shared
/// value-ref arena.
pub struct RangeTable {
    refs: PrimaryMap<RefId, ValueRef>,
    ranges: PrimaryMap<RangeId, LiveRange>,
}

impl RangeTable {
    /// Create a table sized for a list of `num_tiles` tiles.
    pub fn with_capacity(num_tiles: usize) -> Self {
        Self {
            refs: PrimaryMap::with_capacity(num_tiles * 4),
            ranges: PrimaryMap::with_capacity(num_tiles),
        }
    }

    /// Create a fresh, empty live range.
    pub fn new_range(&mut self) -> RangeId {
        self.ranges.push(LiveRange::default())
    }

    /// Borrow a range.
    pub fn range(&self, id: RangeId) -> &LiveRange {
        &self.ranges[id]
    }

    /// Mutably borrow a range.
    pub fn range_mut(&mut self, id: RangeId) -> &mut LiveRange {
        &mut self.ranges[id]
    }

    /// All range ids in creation order.
    pub fn range_ids(&self) -> impl Iterator<Item = RangeId> {
        (0..self.ranges.len() as u32).map(RangeId::from_u32)
    }

    /// Append a reference at `(tile, slot)` to the end of `id`'s queue.
    ///
    /// References must be appended in non-decreasing tile order; the queue
    /// is never re-sorted.
    pub fn add_ref(&mut self, id: RangeId, tile: u32, slot: u8) {
        debug_assert!(
            self.last_ref(id) <= tile || self.range(id).first.is_none(),
            "value refs must arrive in tile order"
        );
        let vref = self.refs.push(ValueRef {
            tile,
            slot,
            next: None.into(),
        });
        let range = &mut self.ranges[id];
        if range.first.is_none() {
            range.first = vref.into();
        }
        if let Some(last) = range.last.expand() {
            self.refs[last].next = vref.into();
        }
        self.ranges[id].last = vref.into();
    }

    /// First reference position of `id`, `u32::MAX` when the range is empty.
    pub fn first_ref(&self, id: RangeId) -> u32 {
        let range = &self.ranges[id];
        let queued = range.first.expand().map_or(u32::MAX, |r| self.refs[r].tile);
        let synth = range.synthetic[0].as_ref().map_or(u32::MAX, |s| s.pos);
        queued.min(synth)
    }

    /// Last reference position of `id`, 0 when the range is empty.
    pub fn last_ref(&self, id: RangeId) -> u32 {
        let range = &self.ranges[id];
        let queued = range.last.expand().map_or(0, |r| self.refs[r].tile);
        let synth = range.synthetic[1].as_ref().map_or(0, |s| s.pos);
        queued.max(synth)
    }

    /// Does `id` reference anything at all?
    pub fn is_empty(&self, id: RangeId) -> bool {
        let range = &self.ranges[id];
        range.first.is_none() && range.synthetic[0].is_none() && range.synthetic[1].is_none()
    }

    /// Iterate over `id`'s queued references in tile order.
    pub fn queue(&self, id: RangeId) -> QueueIter<'_> {
        QueueIter {
            table: self,
            next: self.ranges[id].first,
        }
    }

    /// Merge `src`'s reference queue into `dst`, preserving the
    /// non-decreasing tile order of both inputs, and leave `src` empty.
    pub fn merge_sorted(&mut self, dst: RangeId, src: RangeId) {
        let mut a = self.ranges[dst].first.expand();
        let mut b = self.ranges[src].first.expand();
        let mut head: Option<RefId> = None;
        let mut tail: Option<RefId> = None;
        loop {
            let next = match (a, b) {
                (None, None) => break,
                (Some(ra), None) => {
                    a = self.refs[ra].next.expand();
                    ra
                }
                (None, Some(rb)) => {
                    b = self.refs[rb].next.expand();
                    rb
                }
                (Some(ra), Some(rb)) => {
                    if self.refs[ra].tile <= self.refs[rb].tile {
                        a = self.refs[ra].next.expand();
                        ra
                    } else {
                        b = self.refs[rb].next.expand();
                        rb
                    }
                }
            };
            match tail {
                Some(t) => self.refs[t].next = next.into(),
                None => head = Some(next),
            }
            tail = Some(next);
        }
        if let Some(t) = tail {
            self.refs[t].next = None.into();
        }
        self.ranges[dst].first = head.into();
        self.ranges[dst].last = tail.into();
        self.ranges[src].first = None.into();
        self.ranges[src].last = None.into();
    }
}

/// Iterator over a live range's reference queue.
pub struct QueueIter<'a> {
    table: &'a RangeTable,
    next: PackedOption<RefId>,
}

impl<'a> Iterator for QueueIter<'a> {
    type Item = ValueRef;

    fn next(&mut self) -> Option<ValueRef> {
        let id = self.next.expand()?;
        let vref = self.table.refs[id];
        self.next = vref.next;
        Some(vref)
    }
}

#[derive(Clone)]
struct SetEntry {
    key: Node,
    idx: PackedOption<RangeId>,
}

/// Union-find over expression nodes, merging equivalent values.
///
/// Entries are a parallel array indexed by node id; an entry whose key is
/// itself is a root, and roots of defined values carry their range index.
/// No path compression: chains stay short because copies point straight at
/// their source.
pub struct ValueSets {
    sets: PrimaryMap<Node, SetEntry>,
}

impl ValueSets {
    /// Create sets for nodes `0..num_nodes`, each initially its own root.
    pub fn new(num_nodes: u32) -> Self {
        let mut sets = PrimaryMap::with_capacity(num_nodes as usize);
        for i in 0..num_nodes {
            sets.push(SetEntry {
                key: Node::from_u32(i),
                idx: None.into(),
            });
        }
        Self { sets }
    }

    /// Walk parent links from `node` to its root.
    pub fn find(&self, node: Node) -> Node {
        let mut key = node;
        while self.sets[key].key != key {
            key = self.sets[key].key;
        }
        key
    }

    /// The live range of the set containing `node`, if one was defined.
    pub fn range_of(&self, node: Node) -> Option<RangeId> {
        self.sets[self.find(node)].idx.expand()
    }

    /// Point `node` at `to` without creating a range: `node` is an alias.
    pub fn alias(&mut self, node: Node, to: Node) {
        self.sets[node].key = to;
    }

    /// Make `node` a root owning `idx`.
    pub fn define(&mut self, node: Node, idx: RangeId) {
        self.sets[node].key = node;
        self.sets[node].idx = idx.into();
    }

    /// Union the sets of `a` and `b`, merging their reference queues.
    ///
    /// The root with the earlier first reference wins, which keeps
    /// `first_ref` lookups cheap during the scan. Returns the new root.
    pub fn union(&mut self, table: &mut RangeTable, a: Node, b: Node) -> CodegenResult<Node> {
        let mut a = self.find(a);
        let mut b = self.find(b);
        if a == b {
            return Ok(a);
        }
        let mut ra = self.sets[a]
            .idx
            .expand()
            .ok_or(CodegenError::Invariant("branch join of an undefined value"))?;
        let mut rb = self.sets[b]
            .idx
            .expand()
            .ok_or(CodegenError::Invariant("branch join of an undefined value"))?;
        if table.first_ref(rb) < table.first_ref(ra) {
            core::mem::swap(&mut a, &mut b);
            core::mem::swap(&mut ra, &mut rb);
        }
        match (
            table.range(ra).register_spec,
            table.range(rb).register_spec,
        ) {
            (Some(x), Some(y)) if x != y => {
                return Err(CodegenError::Nyi(
                    "conflicting register requirements at branch join",
                ));
            }
            (None, Some(y)) => table.range_mut(ra).register_spec = Some(y),
            _ => {}
        }
        self.sets[b].key = a;
        table.merge_sorted(ra, rb);
        Ok(a)
    }
}

/// Restore the min-heap property downward from `item`, considering only the
/// first `top` elements of `heap`.
pub(crate) fn heap_down(table: &RangeTable, heap: &mut [RangeId], top: usize, mut item: usize) {
    while item < top {
        let left = item * 2 + 1;
        let right = left + 1;
        let swap = if right < top {
            if table.first_ref(heap[left]) < table.first_ref(heap[right]) {
                left
            } else {
                right
            }
        } else if left < top {
            left
        } else {
            break;
        };
        if table.first_ref(heap[swap]) < table.first_ref(heap[item]) {
            heap.swap(swap, item);
            item = swap;
        } else {
            break;
        }
    }
}

/// Restore the min-heap property upward from `item`.
pub(crate) fn heap_up(table: &RangeTable, heap: &mut [RangeId], mut item: usize) {
    while item > 0 {
        let parent = (item - 1) / 2;
        if table.first_ref(heap[item]) < table.first_ref(heap[parent]) {
            heap.swap(item, parent);
            item = parent;
        } else {
            break;
        }
    }
}

/// Pop the range with the minimum first reference.
pub(crate) fn heap_pop(table: &RangeTable, heap: &mut Vec<RangeId>) -> Option<RangeId> {
    if heap.is_empty() {
        return None;
    }
    let min = heap.swap_remove(0);
    let top = heap.len();
    heap_down(table, heap, top, 0);
    Some(min)
}

/// Establish the min-heap property over all of `heap`.
pub(crate) fn heapify(table: &RangeTable, heap: &mut [RangeId]) {
    for item in 1..heap.len() {
        heap_up(table, heap, item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::Opcode;

    fn range_with_refs(table: &mut RangeTable, refs: &[(u32, u8)]) -> RangeId {
        let id = table.new_range();
        for &(tile, slot) in refs {
            table.add_ref(id, tile, slot);
        }
        id
    }

    fn queue_tiles(table: &RangeTable, id: RangeId) -> Vec<u32> {
        table.queue(id).map(|r| r.tile).collect()
    }

    #[test]
    fn queue_stays_in_tile_order() {
        let mut table = RangeTable::with_capacity(8);
        let id = range_with_refs(&mut table, &[(0, 0), (2, 1), (2, 2), (5, 1)]);
        assert_eq!(queue_tiles(&table, id), vec![0, 2, 2, 5]);
        assert_eq!(table.first_ref(id), 0);
        assert_eq!(table.last_ref(id), 5);
        assert!(table.queue(id).next().map(|r| r.is_def()).unwrap_or(false));
    }

    #[test]
    fn synthetic_endpoints_extend_the_range() {
        let mut table = RangeTable::with_capacity(4);
        let id = range_with_refs(&mut table, &[(3, 0), (4, 1)]);
        table.range_mut(id).synthetic[0] = Some(Synthetic {
            pos: 1,
            tile: Tile::new(Opcode::Set, Node::from_u32(0)),
        });
        table.range_mut(id).synthetic[1] = Some(Synthetic {
            pos: 9,
            tile: Tile::new(Opcode::Set, Node::from_u32(0)),
        });
        assert_eq!(table.first_ref(id), 1);
        assert_eq!(table.last_ref(id), 9);
        assert!(!table.is_empty(id));
    }

    #[test]
    fn union_merges_sorted() {
        let mut table = RangeTable::with_capacity(8);
        let mut sets = ValueSets::new(2);
        let ra = range_with_refs(&mut table, &[(1, 0), (4, 1), (7, 1)]);
        let rb = range_with_refs(&mut table, &[(2, 0), (3, 1), (6, 2)]);
        sets.define(Node::from_u32(0), ra);
        sets.define(Node::from_u32(1), rb);
        let root = sets
            .union(&mut table, Node::from_u32(0), Node::from_u32(1))
            .unwrap();
        assert_eq!(root, Node::from_u32(0));
        assert_eq!(sets.find(Node::from_u32(1)), Node::from_u32(0));
        assert_eq!(sets.range_of(Node::from_u32(1)), Some(ra));
        assert_eq!(queue_tiles(&table, ra), vec![1, 2, 3, 4, 6, 7]);
        assert!(table.is_empty(rb));
    }

    #[test]
    fn union_roots_at_earlier_first_ref() {
        let mut table = RangeTable::with_capacity(8);
        let mut sets = ValueSets::new(2);
        let ra = range_with_refs(&mut table, &[(5, 0)]);
        let rb = range_with_refs(&mut table, &[(2, 0)]);
        sets.define(Node::from_u32(0), ra);
        sets.define(Node::from_u32(1), rb);
        let root = sets
            .union(&mut table, Node::from_u32(0), Node::from_u32(1))
            .unwrap();
        assert_eq!(root, Node::from_u32(1));
        assert_eq!(sets.range_of(Node::from_u32(0)), Some(rb));
    }

    #[test]
    fn union_rejects_conflicting_requirements() {
        let mut table = RangeTable::with_capacity(8);
        let mut sets = ValueSets::new(2);
        let ra = range_with_refs(&mut table, &[(0, 0)]);
        let rb = range_with_refs(&mut table, &[(1, 0)]);
        table.range_mut(ra).register_spec = Some(14);
        table.range_mut(rb).register_spec = Some(12);
        sets.define(Node::from_u32(0), ra);
        sets.define(Node::from_u32(1), rb);
        assert_eq!(
            sets.union(&mut table, Node::from_u32(0), Node::from_u32(1)),
            Err(CodegenError::Nyi(
                "conflicting register requirements at branch join"
            ))
        );
    }

    #[test]
    fn heap_pops_ascending_first_ref() {
        let mut table = RangeTable::with_capacity(16);
        let firsts = [9u32, 3, 7, 1, 8, 2, 6];
        let mut heap: Vec<RangeId> = firsts
            .iter()
            .map(|&f| range_with_refs(&mut table, &[(f, 0)]))
            .collect();
        heapify(&table, &mut heap);
        let mut popped = Vec::new();
        while let Some(id) = heap_pop(&table, &mut heap) {
            // Every pop yields the minimum of what remains.
            for &rest in heap.iter() {
                assert!(table.first_ref(id) <= table.first_ref(rest));
            }
            popped.push(table.first_ref(id));
        }
        assert_eq!(popped, vec![1, 2, 3, 6, 7, 8, 9]);
    }
}
