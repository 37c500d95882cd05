// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Fixed-capacity descriptor rings shared with the chip.
//!
//! A ring of capacity `N` has `N + 1` slots in DMA memory; the extra slot is a
//! permanent jump marker that sends the hardware back to slot 0. Software
//! fills slots at `head`, the hardware consumes them in order and clears the
//! `VALID` bit of each one it is done with, and software reclaims them at
//! `tail`.
//!
//! # Ownership
//!
//! A slot belongs to the hardware from the moment [`DescriptorRing::write`]
//! sets `VALID` until the hardware clears it. Software never rewrites a slot in
//! that window: `reserve` only hands out slots that were drained (or never
//! used), and `drain` stops at the first slot still marked valid.

use crate::descriptor::{Descriptor, DescriptorFlags, DESCRIPTOR_SIZE};
use crate::dma::{DmaMemory, DmaRegion, SyncOp};
use crate::error::{HifnError, HifnResult};

/// The four rings of the DMA engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RingKind {
    /// Command buffers.
    Command,
    /// Source data segments.
    Source,
    /// Destination data segments.
    Destination,
    /// Result buffers.
    Result,
}

impl RingKind {
    /// All rings in submission order.
    pub const ALL: [RingKind; 4] = [
        RingKind::Command,
        RingKind::Source,
        RingKind::Destination,
        RingKind::Result,
    ];

    /// Position in [`RingKind::ALL`].
    pub const fn index(self) -> usize {
        match self {
            Self::Command => 0,
            Self::Source => 1,
            Self::Destination => 2,
            Self::Result => 3,
        }
    }

    /// Short name used in logs.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Command => "cmd",
            Self::Source => "src",
            Self::Destination => "dst",
            Self::Result => "res",
        }
    }
}

impl std::fmt::Display for RingKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One descriptor ring plus its software bookkeeping.
#[derive(Debug)]
pub struct DescriptorRing {
    kind: RingKind,
    capacity: usize,
    /// Next slot to hand out.
    head: usize,
    /// Next slot to reclaim.
    tail: usize,
    in_use: usize,
    /// Software shadow of the slots, jump marker last.
    slots: Vec<Descriptor>,
    region: DmaRegion,
}

impl DescriptorRing {
    /// Allocate a ring of `capacity` usable slots and initialize it empty.
    pub fn new<M: DmaMemory + ?Sized>(kind: RingKind, capacity: usize, mem: &M) -> HifnResult<Self> {
        if capacity == 0 {
            return Err(HifnError::InvalidArgument(format!("{kind} ring capacity must be non-zero")));
        }
        let region = mem.dma_alloc((capacity + 1) * DESCRIPTOR_SIZE)?;
        let mut ring = Self {
            kind,
            capacity,
            head: 0,
            tail: 0,
            in_use: 0,
            slots: vec![Descriptor::new(); capacity + 1],
            region,
        };
        ring.reset(mem);
        Ok(ring)
    }

    /// Ring kind.
    #[inline]
    pub fn kind(&self) -> RingKind {
        self.kind
    }

    /// Usable slots (excluding the jump marker).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots reserved and not yet reclaimed.
    #[inline]
    pub fn in_use(&self) -> usize {
        self.in_use
    }

    /// Slots available to `reserve`.
    #[inline]
    pub fn free_slots(&self) -> usize {
        self.capacity - self.in_use
    }

    /// True if nothing is outstanding.
    #[inline]
    pub fn is_idle(&self) -> bool {
        self.in_use == 0
    }

    /// Next slot `reserve` will hand out (before wraparound).
    #[inline]
    pub fn head(&self) -> usize {
        self.head
    }

    /// Next slot `drain` will inspect.
    #[inline]
    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Device address of slot 0, programmed into the ring base register.
    #[inline]
    pub fn base_address(&self) -> u64 {
        self.region.device_address
    }

    /// Device address of `slot`.
    #[inline]
    pub fn slot_address(&self, slot: usize) -> u64 {
        self.region.device_address + (slot * DESCRIPTOR_SIZE) as u64
    }

    /// Software view of `slot` as last written or drained.
    pub fn slot(&self, slot: usize) -> Option<&Descriptor> {
        self.slots.get(slot)
    }

    /// DMA region backing the ring.
    pub fn region(&self) -> DmaRegion {
        self.region
    }

    /// True if `n` more slots fit.
    #[inline]
    pub fn can_reserve(&self, n: usize) -> bool {
        self.in_use + n <= self.capacity
    }

    /// Reserve `n` consecutive slots, arming the jump marker on wraparound.
    ///
    /// Fails with [`HifnError::Busy`] without touching the ring if fewer than
    /// `n` slots are free.
    pub fn reserve<M: DmaMemory + ?Sized>(&mut self, n: usize, mem: &M) -> HifnResult<Vec<usize>> {
        if !self.can_reserve(n) {
            return Err(HifnError::Busy);
        }
        let mut reserved = Vec::with_capacity(n);
        for _ in 0..n {
            if self.head == self.capacity {
                self.arm_jump(mem);
                self.head = 0;
            }
            reserved.push(self.head);
            self.head += 1;
        }
        self.in_use += n;
        Ok(reserved)
    }

    /// Store `desc` in a reserved slot and hand it to the hardware.
    ///
    /// The address is written before the control word so the chip never sees
    /// `VALID` next to a stale address.
    pub fn write<M: DmaMemory + ?Sized>(&mut self, slot: usize, mut desc: Descriptor, mem: &M) {
        debug_assert!(slot < self.capacity, "{} slot {slot} out of range", self.kind);
        debug_assert!(!self.slots[slot].valid(), "{} slot {slot} still owned by hardware", self.kind);
        desc.flags.insert(DescriptorFlags::VALID);
        self.store(slot, desc, mem);
    }

    /// Lazily reclaim completed slots in FIFO order.
    pub fn drain<'a, M: DmaMemory + ?Sized>(&'a mut self, mem: &'a M) -> Drain<'a, M> {
        Drain { ring: self, mem }
    }

    /// Slots currently outstanding, oldest first.
    pub fn occupied(&self) -> impl Iterator<Item = usize> + '_ {
        let capacity = self.capacity;
        let mut idx = self.tail;
        let mut left = self.in_use;
        std::iter::from_fn(move || {
            if left == 0 {
                return None;
            }
            if idx == capacity {
                idx = 0;
            }
            let slot = idx;
            idx += 1;
            left -= 1;
            Some(slot)
        })
    }

    /// True if the hardware has released `slot`.
    pub fn is_complete<M: DmaMemory + ?Sized>(&self, slot: usize, mem: &M) -> bool {
        !self.read_slot(slot, mem).valid()
    }

    /// Clear every slot and rewind to empty.
    pub fn reset<M: DmaMemory + ?Sized>(&mut self, mem: &M) {
        for slot in 0..self.capacity {
            self.store(slot, Descriptor::new(), mem);
        }
        // The jump target never changes; only its flags are re-armed.
        let jump = Descriptor {
            device_address: self.region.device_address,
            ..Descriptor::new()
        };
        self.store(self.capacity, jump, mem);
        self.head = 0;
        self.tail = 0;
        self.in_use = 0;
    }

    fn arm_jump<M: DmaMemory + ?Sized>(&mut self, mem: &M) {
        let jump = Descriptor::jump(self.region.device_address);
        self.store(self.capacity, jump, mem);
    }

    fn store<M: DmaMemory + ?Sized>(&mut self, slot: usize, desc: Descriptor, mem: &M) {
        let raw = desc.to_bytes();
        let addr = self.slot_address(slot);
        mem.dma_write(addr + 4, &raw[4..]);
        mem.dma_write(addr, &raw[..4]);
        mem.dma_sync(
            DmaRegion { device_address: addr, len: DESCRIPTOR_SIZE },
            SyncOp::PREWRITE | SyncOp::PREREAD,
        );
        self.slots[slot] = desc;
    }

    fn read_slot<M: DmaMemory + ?Sized>(&self, slot: usize, mem: &M) -> Descriptor {
        let addr = self.slot_address(slot);
        mem.dma_sync(
            DmaRegion { device_address: addr, len: DESCRIPTOR_SIZE },
            SyncOp::POSTWRITE | SyncOp::POSTREAD,
        );
        let mut raw = [0u8; DESCRIPTOR_SIZE];
        mem.dma_read(addr, &mut raw);
        Descriptor::from_bytes(&raw)
    }
}

/// Iterator returned by [`DescriptorRing::drain`].
///
/// Each call to `next` reclaims at most one slot; dropping the iterator early
/// leaves the remaining completed slots for the next drain.
pub struct Drain<'a, M: ?Sized> {
    ring: &'a mut DescriptorRing,
    mem: &'a M,
}

impl<M: DmaMemory + ?Sized> Iterator for Drain<'_, M> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        let ring = &mut *self.ring;
        if ring.in_use == 0 {
            return None;
        }
        if ring.tail == ring.capacity {
            let jump = ring.read_slot(ring.capacity, self.mem);
            if jump.valid() {
                return None;
            }
            ring.slots[ring.capacity] = jump;
            ring.tail = 0;
        }
        let slot = ring.tail;
        let desc = ring.read_slot(slot, self.mem);
        if desc.valid() {
            return None;
        }
        ring.slots[slot] = desc;
        ring.tail += 1;
        ring.in_use -= 1;
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimulatedChip;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    /// Play the hardware: clear VALID on `slot` (and the jump marker when
    /// the chip wraps to slot 0).
    fn hw_complete(ring: &DescriptorRing, chip: &SimulatedChip, slot: usize) {
        if slot == 0 {
            hw_clear_valid(chip, ring.slot_address(ring.capacity()));
        }
        hw_clear_valid(chip, ring.slot_address(slot));
    }

    fn hw_clear_valid(chip: &SimulatedChip, addr: u64) {
        let mut word = [0u8; 4];
        chip.dma_read(addr, &mut word);
        let control = u32::from_le_bytes(word) & !DescriptorFlags::VALID.bits();
        chip.dma_write(addr, &control.to_le_bytes());
    }

    fn fill(ring: &mut DescriptorRing, chip: &SimulatedChip, n: usize) -> Vec<usize> {
        let slots = ring.reserve(n, chip).unwrap();
        for (i, &slot) in slots.iter().enumerate() {
            ring.write(slot, Descriptor::segment(0x100 + i as u64 * 4, 4, i + 1 == n), chip);
        }
        slots
    }

    #[test]
    fn test_reserve_until_busy() {
        let chip = SimulatedChip::new();
        let mut ring = DescriptorRing::new(RingKind::Source, 4, &chip).unwrap();
        assert_eq!(ring.reserve(3, &chip).unwrap(), vec![0, 1, 2]);
        assert_eq!(ring.reserve(2, &chip), Err(HifnError::Busy));
        // A failed reserve leaves the ring untouched.
        assert_eq!(ring.in_use(), 3);
        assert_eq!(ring.head(), 3);
        assert_eq!(ring.reserve(1, &chip).unwrap(), vec![3]);
        assert_eq!(ring.free_slots(), 0);
    }

    #[test]
    fn test_drain_stops_at_first_valid_slot() {
        let chip = SimulatedChip::new();
        let mut ring = DescriptorRing::new(RingKind::Result, 4, &chip).unwrap();
        fill(&mut ring, &chip, 3);

        // Completing slot 1 alone must not let the drain skip slot 0.
        hw_complete(&ring, &chip, 1);
        assert_eq!(ring.drain(&chip).count(), 0);

        hw_complete(&ring, &chip, 0);
        assert_eq!(ring.drain(&chip).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(ring.in_use(), 1);
        assert_eq!(ring.tail(), 2);
    }

    #[test]
    fn test_wraparound_arms_jump_marker() {
        let chip = SimulatedChip::new();
        let mut ring = DescriptorRing::new(RingKind::Command, 3, &chip).unwrap();
        fill(&mut ring, &chip, 3);
        assert!(!ring.slot(3).unwrap().valid());
        for slot in 0..3 {
            hw_complete(&ring, &chip, slot);
        }
        assert_eq!(ring.drain(&chip).count(), 3);

        let slots = fill(&mut ring, &chip, 2);
        assert_eq!(slots, vec![0, 1]);
        let jump = ring.slot(3).unwrap();
        assert!(jump.valid());
        assert!(jump.is_jump());
        assert_eq!(jump.device_address, ring.base_address());
    }

    #[test]
    fn test_drain_waits_for_hardware_to_take_the_jump() {
        let chip = SimulatedChip::new();
        let mut ring = DescriptorRing::new(RingKind::Command, 2, &chip).unwrap();
        fill(&mut ring, &chip, 2);
        hw_complete(&ring, &chip, 0);
        hw_complete(&ring, &chip, 1);
        assert_eq!(ring.drain(&chip).count(), 2);

        fill(&mut ring, &chip, 1);
        // Slot 0 done but the jump marker still reads valid.
        hw_clear_valid(&chip, ring.slot_address(0));
        assert_eq!(ring.drain(&chip).count(), 0);
        hw_clear_valid(&chip, ring.slot_address(2));
        assert_eq!(ring.drain(&chip).collect::<Vec<_>>(), vec![0]);
    }

    #[test]
    fn test_occupied_lists_outstanding_slots_in_order() {
        let chip = SimulatedChip::new();
        let mut ring = DescriptorRing::new(RingKind::Result, 3, &chip).unwrap();
        fill(&mut ring, &chip, 3);
        hw_complete(&ring, &chip, 0);
        hw_complete(&ring, &chip, 1);
        assert_eq!(ring.drain(&chip).count(), 2);
        fill(&mut ring, &chip, 2);
        assert_eq!(ring.occupied().collect::<Vec<_>>(), vec![2, 0, 1]);
        assert!(!ring.is_complete(2, &chip));
    }

    #[test]
    fn test_reset_clears_everything() {
        let chip = SimulatedChip::new();
        let mut ring = DescriptorRing::new(RingKind::Destination, 4, &chip).unwrap();
        fill(&mut ring, &chip, 3);
        ring.reset(&chip);
        assert_eq!((ring.head(), ring.tail(), ring.in_use()), (0, 0, 0));
        for slot in 0..4 {
            assert!(ring.is_complete(slot, &chip));
        }
        assert_eq!(ring.slot(4).unwrap().device_address, ring.base_address());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let chip = SimulatedChip::new();
        assert!(matches!(
            DescriptorRing::new(RingKind::Source, 0, &chip),
            Err(HifnError::InvalidArgument(_))
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Reserve(usize),
        Complete(usize),
        Drain,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0usize..4).prop_map(Op::Reserve),
            (0usize..4).prop_map(Op::Complete),
            Just(Op::Drain),
        ]
    }

    proptest! {
        #[test]
        fn test_in_use_bounded_and_drain_is_fifo(
            capacity in 1usize..8,
            ops in proptest::collection::vec(op_strategy(), 1..64),
        ) {
            let chip = SimulatedChip::new();
            let mut ring = DescriptorRing::new(RingKind::Source, capacity, &chip).unwrap();
            // Reserved but not yet completed by the "hardware", oldest first.
            let mut pending: VecDeque<usize> = VecDeque::new();
            // Completed by the hardware, not yet drained.
            let mut completed: VecDeque<usize> = VecDeque::new();

            for op in ops {
                match op {
                    Op::Reserve(n) => {
                        let fits = ring.in_use() + n <= capacity;
                        match ring.reserve(n, &chip) {
                            Ok(slots) => {
                                prop_assert!(fits);
                                for slot in slots {
                                    ring.write(slot, Descriptor::segment(0, 4, true), &chip);
                                    pending.push_back(slot);
                                }
                            }
                            Err(e) => {
                                prop_assert!(!fits);
                                prop_assert_eq!(e, HifnError::Busy);
                            }
                        }
                    }
                    Op::Complete(k) => {
                        for _ in 0..k {
                            if let Some(slot) = pending.pop_front() {
                                hw_complete(&ring, &chip, slot);
                                completed.push_back(slot);
                            }
                        }
                    }
                    Op::Drain => {
                        let drained: Vec<usize> = ring.drain(&chip).collect();
                        let expected: Vec<usize> = completed.drain(..).collect();
                        prop_assert_eq!(drained, expected);
                    }
                }
                prop_assert!(ring.in_use() <= capacity);
                prop_assert_eq!(ring.in_use(), pending.len() + completed.len());
            }
        }
    }
}
