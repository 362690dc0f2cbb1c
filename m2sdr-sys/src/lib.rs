// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! # m2sdr-sys: Raw LitePCIe driver ABI
//!
//! This crate mirrors the userspace ABI of the LitePCIe kernel driver that
//! exposes the M2SDR board as a character device (`/dev/m2sdr0`, ...).
//!
//! ## Overview
//!
//! `m2sdr-sys` exposes:
//! - `repr(C)` structures exchanged with the driver through `ioctl(2)`
//! - The ioctl request wrappers, generated with the `nix` ioctl macros
//! - Driver constants (ioctl magic, lock status values)
//!
//! ## Usage
//!
//! **Most users should NOT use this crate directly.** Use the safe [`m2sdr`]
//! crate instead, which provides:
//! - RAII ownership of the DMA rings and DMA channel claims
//! - Rust-idiomatic error handling with `Result`
//! - Sample format conversion and the streaming API
//!
//! ## Safety
//!
//! All ioctl wrappers are `unsafe` and require the caller to uphold the
//! driver's invariants:
//! - The file descriptor must be an open LitePCIe device node
//! - Pointers must reference properly initialised structures
//! - DMA counters must only be published for a channel the caller claimed
//!
//! [`m2sdr`]: https://docs.rs/m2sdr

#![allow(non_camel_case_types)]
#![allow(clippy::missing_safety_doc)]

/// ioctl magic shared by every LitePCIe request.
pub const LITEPCIE_IOCTL: u8 = b'S';

pub const LITEPCIE_IOCTL_REG_NR: u8 = 0;
pub const LITEPCIE_IOCTL_DMA_NR: u8 = 20;
pub const LITEPCIE_IOCTL_DMA_WRITER_NR: u8 = 21;
pub const LITEPCIE_IOCTL_DMA_READER_NR: u8 = 22;
pub const LITEPCIE_IOCTL_MMAP_DMA_INFO_NR: u8 = 24;
pub const LITEPCIE_IOCTL_MMAP_DMA_WRITER_UPDATE_NR: u8 = 25;
pub const LITEPCIE_IOCTL_MMAP_DMA_READER_UPDATE_NR: u8 = 26;
pub const LITEPCIE_IOCTL_LOCK_NR: u8 = 27;

/// Lock status reported by the driver when a claim was granted.
pub const LITEPCIE_LOCK_GRANTED: u8 = 1;

/// CSR register access (`LITEPCIE_IOCTL_REG`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_reg {
    pub addr: u32,
    pub val: u32,
    pub is_write: u8,
}

/// Global DMA control (`LITEPCIE_IOCTL_DMA`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_dma {
    pub loopback_enable: u8,
}

/// DMA writer (host RX) control and counters (`LITEPCIE_IOCTL_DMA_WRITER`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_dma_writer {
    pub enable: u8,
    pub hw_count: i64,
    pub sw_count: i64,
}

/// DMA reader (host TX) control and counters (`LITEPCIE_IOCTL_DMA_READER`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_dma_reader {
    pub enable: u8,
    pub hw_count: i64,
    pub sw_count: i64,
}

/// DMA channel claim/release (`LITEPCIE_IOCTL_LOCK`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_lock {
    pub dma_reader_request: u8,
    pub dma_writer_request: u8,
    pub dma_reader_release: u8,
    pub dma_writer_release: u8,
    pub dma_reader_status: u8,
    pub dma_writer_status: u8,
}

/// Geometry of the mmap-able DMA buffers (`LITEPCIE_IOCTL_MMAP_DMA_INFO`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_mmap_dma_info {
    pub dma_tx_buf_offset: u64,
    pub dma_tx_buf_size: u64,
    pub dma_tx_buf_count: u64,
    pub dma_rx_buf_offset: u64,
    pub dma_rx_buf_size: u64,
    pub dma_rx_buf_count: u64,
}

/// Software buffer count published to the driver
/// (`LITEPCIE_IOCTL_MMAP_DMA_WRITER_UPDATE` / `..._READER_UPDATE`).
#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct litepcie_ioctl_mmap_dma_update {
    pub sw_count: i64,
}

nix::ioctl_readwrite!(
    litepcie_ioctl_reg_rw,
    LITEPCIE_IOCTL,
    LITEPCIE_IOCTL_REG_NR,
    litepcie_ioctl_reg
);
nix::ioctl_write_ptr!(
    litepcie_ioctl_dma_set,
    LITEPCIE_IOCTL,
    LITEPCIE_IOCTL_DMA_NR,
    litepcie_ioctl_dma
);
nix::ioctl_readwrite!(
    litepcie_ioctl_dma_writer_rw,
    LITEPCIE_IOCTL,
    LITEPCIE_IOCTL_DMA_WRITER_NR,
    litepcie_ioctl_dma_writer
);
nix::ioctl_readwrite!(
    litepcie_ioctl_dma_reader_rw,
    LITEPCIE_IOCTL,
    LITEPCIE_IOCTL_DMA_READER_NR,
    litepcie_ioctl_dma_reader
);
nix::ioctl_read!(
    litepcie_ioctl_mmap_dma_info_get,
    LITEPCIE_IOCTL,
    LITEPCIE_IOCTL_MMAP_DMA_INFO_NR,
    litepcie_ioctl_mmap_dma_info
);
nix::ioctl_write_ptr!(
    litepcie_ioctl_mmap_dma_writer_update,
    LITEPCIE_IOCTL,
    LITEPCIE_IOCTL_MMAP_DMA_WRITER_UPDATE_NR,
    litepcie_ioctl_mmap_dma_update
);
nix::ioctl_write_ptr!(
    litepcie_ioctl_mmap_dma_reader_update,
    LITEPCIE_IOCTL,
    LITEPCIE_IOCTL_MMAP_DMA_READER_UPDATE_NR,
    litepcie_ioctl_mmap_dma_update
);
nix::ioctl_readwrite!(
    litepcie_ioctl_lock_rw,
    LITEPCIE_IOCTL,
    LITEPCIE_IOCTL_LOCK_NR,
    litepcie_ioctl_lock
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_structures_match_c_layout() {
        // uint8_t followed by two naturally aligned int64_t.
        assert_eq!(std::mem::size_of::<litepcie_ioctl_dma_writer>(), 24);
        assert_eq!(std::mem::size_of::<litepcie_ioctl_dma_reader>(), 24);
        assert_eq!(std::mem::size_of::<litepcie_ioctl_mmap_dma_info>(), 48);
        assert_eq!(std::mem::size_of::<litepcie_ioctl_lock>(), 6);
        assert_eq!(std::mem::size_of::<litepcie_ioctl_reg>(), 12);
    }
}
