// HIFN Crypto/Compression Offload Engine
// Copyright 2025 Henk-Jan Lebbink
// SPDX-License-Identifier: MIT

//! Register map of the processing unit (BAR 0) and DMA unit (BAR 1).
//!
//! Only the registers the command-queue engine touches are listed. Offsets
//! and bit positions follow the 7751/7811 family; chip bring-up registers
//! (PLL, unlock signature, RAM configuration) are left to the platform.

use crate::ring::RingKind;
use bitflags::bitflags;

/// Register window selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bar {
    /// Processing unit registers.
    Zero,
    /// DMA engine registers.
    One,
}

/// Processing unit interrupt status (BAR 0).
pub const PU_ISR: u32 = 0x08;
/// Processing unit interrupt enable (BAR 0).
pub const PU_IER: u32 = 0x10;

/// Command ring base address (BAR 1).
pub const DMA_CRAR: u32 = 0x0c;
/// Source ring base address (BAR 1).
pub const DMA_SRAR: u32 = 0x1c;
/// Destination ring base address (BAR 1).
pub const DMA_DRAR: u32 = 0x2c;
/// Result ring base address (BAR 1).
pub const DMA_RRAR: u32 = 0x3c;
/// DMA control and status (BAR 1).
pub const DMA_CSR: u32 = 0x40;
/// DMA interrupt enable (BAR 1).
pub const DMA_IER: u32 = 0x44;
/// DMA configuration (BAR 1).
pub const DMA_CNFG: u32 = 0x48;

bitflags! {
    /// DMA control/status register bits.
    ///
    /// The interrupt enable register uses the same bit positions, so this
    /// type doubles as the IER mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmaStatus: u32 {
        const D_CTRL_DIS = 0x4000_0000;
        const D_CTRL_ENA = 0x8000_0000;
        const D_ABORT = 0x2000_0000;
        const D_DONE = 0x1000_0000;
        const D_LAST = 0x0800_0000;
        const D_WAIT = 0x0400_0000;
        const D_OVER = 0x0200_0000;
        const R_CTRL_DIS = 0x0040_0000;
        const R_CTRL_ENA = 0x0080_0000;
        const R_ABORT = 0x0020_0000;
        const R_DONE = 0x0010_0000;
        const R_LAST = 0x0008_0000;
        const R_WAIT = 0x0004_0000;
        const R_OVER = 0x0002_0000;
        const S_CTRL_DIS = 0x0000_4000;
        const S_CTRL_ENA = 0x0000_8000;
        const S_ABORT = 0x0000_2000;
        const S_DONE = 0x0000_1000;
        const S_LAST = 0x0000_0800;
        const S_WAIT = 0x0000_0400;
        /// Illegal write (destination not word granular).
        const ILLW = 0x0000_0200;
        /// Illegal read.
        const ILLR = 0x0000_0100;
        const C_CTRL_DIS = 0x0000_0040;
        const C_CTRL_ENA = 0x0000_0080;
        const C_ABORT = 0x0000_0020;
        const C_DONE = 0x0000_0010;
        const C_LAST = 0x0000_0008;
        /// Command ring waiting for work.
        const C_WAIT = 0x0000_0004;
        const PUB_DONE = 0x0000_0002;
        /// Processing unit raised an interrupt.
        const ENGINE = 0x0000_0001;
    }
}

impl DmaStatus {
    /// Any of the four per-ring abort indications.
    pub const ABORTS: Self = Self::C_ABORT
        .union(Self::S_ABORT)
        .union(Self::D_ABORT)
        .union(Self::R_ABORT);

    /// Destination or result ring overrun.
    pub const OVERRUNS: Self = Self::D_OVER.union(Self::R_OVER);

    /// Interrupt sources enabled after every (re)initialization.
    pub const DEFAULT_IER: Self = Self::R_DONE
        .union(Self::ABORTS)
        .union(Self::OVERRUNS)
        .union(Self::ILLW)
        .union(Self::ILLR)
        .union(Self::ENGINE);

    /// All "disable" control bits, written to stop every ring at once.
    pub const ALL_CTRL_DIS: Self = Self::C_CTRL_DIS
        .union(Self::S_CTRL_DIS)
        .union(Self::D_CTRL_DIS)
        .union(Self::R_CTRL_DIS);

    /// Control bit that starts `kind`'s DMA channel.
    pub const fn ctrl_enable(kind: RingKind) -> Self {
        match kind {
            RingKind::Command => Self::C_CTRL_ENA,
            RingKind::Source => Self::S_CTRL_ENA,
            RingKind::Destination => Self::D_CTRL_ENA,
            RingKind::Result => Self::R_CTRL_ENA,
        }
    }

    /// Control bit that stops `kind`'s DMA channel.
    pub const fn ctrl_disable(kind: RingKind) -> Self {
        match kind {
            RingKind::Command => Self::C_CTRL_DIS,
            RingKind::Source => Self::S_CTRL_DIS,
            RingKind::Destination => Self::D_CTRL_DIS,
            RingKind::Result => Self::R_CTRL_DIS,
        }
    }

    /// Abort indication for `kind`.
    pub const fn abort(kind: RingKind) -> Self {
        match kind {
            RingKind::Command => Self::C_ABORT,
            RingKind::Source => Self::S_ABORT,
            RingKind::Destination => Self::D_ABORT,
            RingKind::Result => Self::R_ABORT,
        }
    }
}

bitflags! {
    /// DMA configuration register bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct DmaConfig: u32 {
        /// Master reset, active low.
        const MSTRESET = 0x0000_0001;
        /// DMA unit reset, active low.
        const DMARESET = 0x0000_0002;
        const MODE = 0x0000_0004;
        const POLLENABLE = 0x0000_0020;
    }
}

/// Base address register for `kind`.
pub const fn ring_base_register(kind: RingKind) -> u32 {
    match kind {
        RingKind::Command => DMA_CRAR,
        RingKind::Source => DMA_SRAR,
        RingKind::Destination => DMA_DRAR,
        RingKind::Result => DMA_RRAR,
    }
}
