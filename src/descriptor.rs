// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Ring descriptor layout shared with the chip's DMA engine.
//!
//! A descriptor occupies 16 bytes of DMA memory:
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | control word (`length \| flags`) |
//! | 4 | 4 | reserved |
//! | 8 | 8 | device address |
//!
//! All fields are little-endian. The control word carries the transfer length
//! in bits [15:0] and the ownership/control flags in the upper bits.

use bitflags::bitflags;

/// Size of one descriptor in DMA memory.
pub const DESCRIPTOR_SIZE: usize = 16;

/// Mask of the length field inside the control word.
pub const LENGTH_MASK: u32 = 0x0000_ffff;

bitflags! {
    /// Descriptor control flags (upper bits of the control word).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DescriptorFlags: u32 {
        /// Slot is owned by the hardware. Cleared by the chip once consumed.
        const VALID = 0x8000_0000;
        /// Wrap marker: continue at the descriptor address (ring base).
        const JUMP = 0x4000_0000;
        /// Final descriptor of a logical transfer.
        const LAST = 0x2000_0000;
        /// Do not raise a done interrupt for this descriptor.
        const MASK_DONE_IRQ = 0x0200_0000;
    }
}

/// One ring slot as seen by software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Descriptor {
    /// Device address of the buffer (or ring base for a jump).
    pub device_address: u64,
    /// Transfer length in bytes.
    pub length: u32,
    /// Control flags.
    pub flags: DescriptorFlags,
}

impl Descriptor {
    /// Create a zeroed descriptor.
    #[inline]
    pub const fn new() -> Self {
        Self {
            device_address: 0,
            length: 0,
            flags: DescriptorFlags::empty(),
        }
    }

    /// Data descriptor handed to the hardware.
    ///
    /// Done interrupts are masked; completion is signalled through the result
    /// ring only.
    pub fn segment(device_address: u64, length: u32, last: bool) -> Self {
        let mut flags = DescriptorFlags::VALID | DescriptorFlags::MASK_DONE_IRQ;
        flags.set(DescriptorFlags::LAST, last);
        Self {
            device_address,
            length: length & LENGTH_MASK,
            flags,
        }
    }

    /// Result descriptor. Unlike every other descriptor its done interrupt is
    /// left unmasked.
    pub fn result(device_address: u64, length: u32) -> Self {
        Self {
            device_address,
            length: length & LENGTH_MASK,
            flags: DescriptorFlags::VALID | DescriptorFlags::LAST,
        }
    }

    /// Wraparound marker pointing back at the ring base.
    pub fn jump(ring_base: u64) -> Self {
        Self {
            device_address: ring_base,
            length: 0,
            flags: DescriptorFlags::VALID | DescriptorFlags::JUMP | DescriptorFlags::MASK_DONE_IRQ,
        }
    }

    /// True while the hardware owns the slot.
    #[inline]
    pub fn valid(&self) -> bool {
        self.flags.contains(DescriptorFlags::VALID)
    }

    /// True for the final descriptor of a transfer.
    #[inline]
    pub fn last(&self) -> bool {
        self.flags.contains(DescriptorFlags::LAST)
    }

    /// True if the done interrupt is masked.
    #[inline]
    pub fn suppress_irq(&self) -> bool {
        self.flags.contains(DescriptorFlags::MASK_DONE_IRQ)
    }

    /// True for the wraparound marker.
    #[inline]
    pub fn is_jump(&self) -> bool {
        self.flags.contains(DescriptorFlags::JUMP)
    }

    /// Control word as stored in DMA memory.
    #[inline]
    pub fn control_word(&self) -> u32 {
        (self.length & LENGTH_MASK) | self.flags.bits()
    }

    /// Rebuild a descriptor from its control word and address.
    pub fn from_parts(control: u32, device_address: u64) -> Self {
        Self {
            device_address,
            length: control & LENGTH_MASK,
            flags: DescriptorFlags::from_bits_truncate(control),
        }
    }

    /// Serialize to the 16-byte DMA layout.
    pub fn to_bytes(&self) -> [u8; DESCRIPTOR_SIZE] {
        let mut raw = [0u8; DESCRIPTOR_SIZE];
        raw[0..4].copy_from_slice(&self.control_word().to_le_bytes());
        raw[8..16].copy_from_slice(&self.device_address.to_le_bytes());
        raw
    }

    /// Deserialize from the 16-byte DMA layout.
    pub fn from_bytes(raw: &[u8; DESCRIPTOR_SIZE]) -> Self {
        let control = u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&raw[8..16]);
        Self::from_parts(control, u64::from_le_bytes(addr))
    }
}

// The length field is 16 bits wide; segment lengths are capped accordingly.
const _: () = assert!(LENGTH_MASK & DescriptorFlags::all().bits() == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_flags() {
        let desc = Descriptor::segment(0x1000, 64, false);
        assert!(desc.valid());
        assert!(desc.suppress_irq());
        assert!(!desc.last());
        assert!(!desc.is_jump());

        let desc = Descriptor::segment(0x1000, 64, true);
        assert!(desc.last());
    }

    #[test]
    fn test_result_descriptor_keeps_done_irq() {
        let desc = Descriptor::result(0x2000, 36);
        assert!(desc.valid());
        assert!(desc.last());
        assert!(!desc.suppress_irq());
    }

    #[test]
    fn test_jump_descriptor() {
        let desc = Descriptor::jump(0x4000);
        assert!(desc.valid());
        assert!(desc.is_jump());
        assert_eq!(desc.device_address, 0x4000);
        assert_eq!(desc.length, 0);
    }

    #[test]
    fn test_control_word_layout() {
        let desc = Descriptor::segment(0xdead_beef, 0x1234, true);
        assert_eq!(desc.control_word(), 0xa200_1234);

        let raw = desc.to_bytes();
        assert_eq!(&raw[0..4], &[0x34, 0x12, 0x00, 0xa2]);
        assert_eq!(&raw[4..8], &[0, 0, 0, 0]);
        assert_eq!(&raw[8..12], &[0xef, 0xbe, 0xad, 0xde]);
        assert_eq!(Descriptor::from_bytes(&raw), desc);
    }

    #[test]
    fn test_length_is_truncated_to_field_width() {
        let desc = Descriptor::segment(0, 0x1_0004, false);
        assert_eq!(desc.length, 4);
    }

    #[test]
    fn test_hardware_clearing_valid() {
        let desc = Descriptor::segment(0x1000, 16, true);
        let consumed = Descriptor::from_parts(desc.control_word() & !DescriptorFlags::VALID.bits(), 0x1000);
        assert!(!consumed.valid());
        assert!(consumed.last());
        assert_eq!(consumed.length, 16);
    }
}
