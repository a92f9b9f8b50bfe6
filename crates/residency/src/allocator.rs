use ahash::AHashMap;
use bitvec::prelude::{BitVec, Lsb0};

use crate::{HeapId, TextureId, TileAllocation};

/// One caller-provided physical heap, partitioned into equal tile slots.
/// Slots are handed out from a LIFO free stack; the used set is kept as a
/// bit vector so defragmentation can walk used slots in ascending order.
#[derive(Debug)]
pub(crate) struct TiledHeap {
    heap_id: HeapId,
    tiles_num: u32,
    free_slots: Vec<u32>,
    used_slots: BitVec<usize, Lsb0>,
    residents: Vec<Option<(TextureId, u32)>>,
}

impl TiledHeap {
    fn new(heap_id: HeapId, tiles_num: u32) -> Self {
        Self {
            heap_id,
            tiles_num,
            // stacked so the first pops hand out the lowest slots
            free_slots: (0..tiles_num).rev().collect(),
            used_slots: BitVec::repeat(false, tiles_num as usize),
            residents: vec![None; tiles_num as usize],
        }
    }

    pub(crate) fn heap_id(&self) -> HeapId {
        self.heap_id
    }

    pub(crate) fn free_tiles_num(&self) -> u32 {
        self.free_slots.len() as u32
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.free_slots.len() == self.tiles_num as usize
    }

    fn allocate(&mut self, texture_id: TextureId, tile_index: u32) -> u32 {
        let Some(slot) = self.free_slots.pop() else {
            panic!("allocating from a full heap");
        };
        self.used_slots.set(slot as usize, true);
        self.residents[slot as usize] = Some((texture_id, tile_index));
        slot
    }

    fn free(&mut self, slot: u32) {
        let resident = self.residents[slot as usize].take();
        debug_assert!(resident.is_some(), "freeing a slot that holds no tile");
        self.used_slots.set(slot as usize, false);
        self.free_slots.push(slot);
    }

    fn resident(&self, slot: u32) -> (TextureId, u32) {
        let Some(resident) = self.residents[slot as usize] else {
            panic!("used slot holds no resident tile");
        };
        resident
    }
}

/// Insertion-ordered collection of heaps with first-fit slot allocation.
#[derive(Debug)]
pub(crate) struct TileAllocator {
    heap_tiles_capacity: u32,
    heaps: Vec<TiledHeap>,
    heap_positions: AHashMap<HeapId, usize>,
    allocated_tiles_num: u32,
}

impl TileAllocator {
    pub(crate) fn new(heap_tiles_capacity: u32) -> Self {
        Self {
            heap_tiles_capacity,
            heaps: Vec::new(),
            heap_positions: AHashMap::new(),
            allocated_tiles_num: 0,
        }
    }

    pub(crate) fn add_heap(&mut self, heap_id: HeapId) {
        let previous = self.heap_positions.insert(heap_id, self.heaps.len());
        assert!(previous.is_none(), "heap id already registered");
        self.heaps.push(TiledHeap::new(heap_id, self.heap_tiles_capacity));
    }

    pub(crate) fn remove_heap(&mut self, heap_id: HeapId) {
        let Some(position) = self.heap_positions.remove(&heap_id) else {
            panic!("removing unknown heap id");
        };
        assert!(
            self.heaps[position].is_empty(),
            "removing a heap that still holds tiles"
        );
        self.heaps.remove(position);
        for heap in &self.heaps[position..] {
            let shifted = self
                .heap_positions
                .get_mut(&heap.heap_id())
                .expect("registered heap missing from position map");
            *shifted -= 1;
        }
    }

    pub(crate) fn heaps_num(&self) -> u32 {
        self.heaps.len() as u32
    }

    pub(crate) fn allocated_tiles_num(&self) -> u32 {
        self.allocated_tiles_num
    }

    pub(crate) fn total_tiles_num(&self) -> u32 {
        self.heaps_num() * self.heap_tiles_capacity
    }

    pub(crate) fn free_tiles_num(&self) -> u32 {
        self.total_tiles_num() - self.allocated_tiles_num
    }

    /// First-fit: the earliest added heap with a free slot wins. Returns
    /// `None` when every heap is full.
    pub(crate) fn allocate(
        &mut self,
        texture_id: TextureId,
        tile_index: u32,
    ) -> Option<TileAllocation> {
        let heap = self.heaps.iter_mut().find(|heap| heap.free_tiles_num() > 0)?;
        let heap_slot = heap.allocate(texture_id, tile_index);
        self.allocated_tiles_num += 1;
        Some(TileAllocation {
            heap_id: heap.heap_id(),
            heap_slot,
        })
    }

    pub(crate) fn free(&mut self, allocation: TileAllocation) {
        let Some(&position) = self.heap_positions.get(&allocation.heap_id) else {
            panic!("freeing a tile from an unknown heap");
        };
        self.heaps[position].free(allocation.heap_slot);
        self.allocated_tiles_num -= 1;
    }

    /// A tile whose slot can be compacted into an earlier heap: scans heaps
    /// back to front (skipping empty ones) and their used slots in ascending
    /// order, returning the first tile the oracle reports as movable.
    /// Requires at least two heaps and a free slot somewhere before the last
    /// heap, otherwise there is nothing to compact towards.
    pub(crate) fn fragmented_tile(
        &self,
        is_movable: impl Fn(TextureId, u32) -> bool,
    ) -> Option<(TextureId, u32)> {
        if self.heaps.len() < 2 {
            return None;
        }
        let head_has_space = self.heaps[..self.heaps.len() - 1]
            .iter()
            .any(|heap| heap.free_tiles_num() > 0);
        if !head_has_space {
            return None;
        }

        for heap in self.heaps[1..].iter().rev() {
            if heap.is_empty() {
                continue;
            }
            for slot in heap.used_slots.iter_ones() {
                let (texture_id, tile_index) = heap.resident(slot as u32);
                if is_movable(texture_id, tile_index) {
                    return Some((texture_id, tile_index));
                }
            }
        }
        None
    }

    pub(crate) fn empty_heaps(&self) -> Vec<HeapId> {
        self.heaps
            .iter()
            .filter(|heap| heap.is_empty())
            .map(|heap| heap.heap_id())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn texture(id: u32) -> TextureId {
        TextureId(id)
    }

    #[test]
    fn first_fit_prefers_earlier_heaps() {
        let mut allocator = TileAllocator::new(2);
        allocator.add_heap(HeapId(7));
        allocator.add_heap(HeapId(8));

        let a = allocator.allocate(texture(0), 0).expect("slot");
        let b = allocator.allocate(texture(0), 1).expect("slot");
        assert_eq!(a.heap_id, HeapId(7));
        assert_eq!(b.heap_id, HeapId(7));

        let c = allocator.allocate(texture(0), 2).expect("slot");
        assert_eq!(c.heap_id, HeapId(8));

        // freeing in the first heap makes it win again
        allocator.free(a);
        let d = allocator.allocate(texture(0), 3).expect("slot");
        assert_eq!(d.heap_id, HeapId(7));

        assert_eq!(allocator.allocated_tiles_num(), 3);
        assert_eq!(allocator.free_tiles_num(), 1);
    }

    #[test]
    fn allocation_fails_when_all_heaps_are_full() {
        let mut allocator = TileAllocator::new(1);
        allocator.add_heap(HeapId(1));
        assert!(allocator.allocate(texture(0), 0).is_some());
        assert!(allocator.allocate(texture(0), 1).is_none());
    }

    #[test]
    fn free_slots_are_reused_lifo() {
        let mut allocator = TileAllocator::new(4);
        allocator.add_heap(HeapId(1));
        let allocations: Vec<_> = (0..4)
            .map(|tile| allocator.allocate(texture(0), tile).expect("slot"))
            .collect();
        allocator.free(allocations[1]);
        allocator.free(allocations[3]);

        // last freed slot comes back first
        let next = allocator.allocate(texture(0), 9).expect("slot");
        assert_eq!(next.heap_slot, allocations[3].heap_slot);
    }

    #[test]
    fn remove_heap_keeps_positions_consistent() {
        let mut allocator = TileAllocator::new(1);
        allocator.add_heap(HeapId(1));
        allocator.add_heap(HeapId(2));
        allocator.add_heap(HeapId(3));
        allocator.remove_heap(HeapId(2));

        // heap 3 shifted down; allocation and free still resolve it
        let a = allocator.allocate(texture(0), 0).expect("slot");
        let b = allocator.allocate(texture(0), 1).expect("slot");
        assert_eq!(a.heap_id, HeapId(1));
        assert_eq!(b.heap_id, HeapId(3));
        allocator.free(b);
        assert_eq!(allocator.free_tiles_num(), 1);
    }

    #[test]
    #[should_panic(expected = "still holds tiles")]
    fn remove_heap_rejects_occupied_heaps() {
        let mut allocator = TileAllocator::new(1);
        allocator.add_heap(HeapId(1));
        let _ = allocator.allocate(texture(0), 0);
        allocator.remove_heap(HeapId(1));
    }

    #[test]
    fn fragmented_tile_scans_from_the_back() {
        let mut allocator = TileAllocator::new(2);
        allocator.add_heap(HeapId(1));
        allocator.add_heap(HeapId(2));

        let a = allocator.allocate(texture(0), 0).expect("slot");
        let _ = allocator.allocate(texture(0), 1).expect("slot");
        let _ = allocator.allocate(texture(0), 2).expect("slot"); // lands in heap 2

        // no free slot before the last heap yet
        assert_eq!(allocator.fragmented_tile(|_, _| true), None);

        allocator.free(a);
        assert_eq!(
            allocator.fragmented_tile(|_, _| true),
            Some((texture(0), 2))
        );
        // the oracle can veto candidates
        assert_eq!(
            allocator.fragmented_tile(|_, tile| tile != 2),
            None
        );
    }

    #[test]
    fn empty_heaps_are_reported() {
        let mut allocator = TileAllocator::new(1);
        allocator.add_heap(HeapId(1));
        allocator.add_heap(HeapId(2));
        assert_eq!(allocator.empty_heaps(), vec![HeapId(1), HeapId(2)]);

        let a = allocator.allocate(texture(0), 0).expect("slot");
        assert_eq!(allocator.empty_heaps(), vec![HeapId(2)]);
        allocator.free(a);
        assert_eq!(allocator.empty_heaps(), vec![HeapId(1), HeapId(2)]);
    }
}
