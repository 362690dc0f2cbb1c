// SPDX-FileCopyrightText: 2025 Contributors to the LiteX M2SDR project.
// SPDX-License-Identifier: Apache-2.0

//! LitePCIe character device transport.

use std::{
    fs::{File, OpenOptions},
    num::NonZeroUsize,
    os::fd::{AsFd, AsRawFd, RawFd},
    path::Path,
    ptr::NonNull,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use m2sdr_sys as sys;
use nix::{
    errno::Errno,
    poll::{PollFd, PollFlags, PollTimeout, poll},
    sys::mman::{MapFlags, ProtFlags, mmap, munmap},
};
use tracing::{debug, trace};

use crate::{
    DeviceHandle, Direction, DmaCounters, DmaGeometry, DmaInfo, Error, Result,
};

/// Transport to a board behind the LitePCIe kernel driver (`/dev/m2sdrN`).
pub struct LitePcieDevice {
    file: File,
    path: String,
    /// Channel claims held through this handle, indexed by [`Direction::index`].
    claimed: [AtomicBool; 2],
    /// DMA enable state, indexed by [`Direction::index`].
    enabled: [AtomicBool; 2],
}

impl LitePcieDevice {
    /// Opens the device node at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map_err(|source| Error::Open {
                path: path_str.clone(),
                source,
            })?;
        debug!(path = %path_str, "Opened LitePCIe device");
        Ok(Self {
            file,
            path: path_str,
            claimed: [AtomicBool::new(false), AtomicBool::new(false)],
            enabled: [AtomicBool::new(false), AtomicBool::new(false)],
        })
    }

    /// Returns the device node path.
    pub fn path(&self) -> &str {
        &self.path
    }

    fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    fn lock(&self, direction: Direction, request: bool) -> Result<sys::litepcie_ioctl_lock> {
        let mut lock = sys::litepcie_ioctl_lock::default();
        match (direction, request) {
            (Direction::Rx, true) => lock.dma_writer_request = 1,
            (Direction::Rx, false) => lock.dma_writer_release = 1,
            (Direction::Tx, true) => lock.dma_reader_request = 1,
            (Direction::Tx, false) => lock.dma_reader_release = 1,
        }
        unsafe { sys::litepcie_ioctl_lock_rw(self.fd(), &mut lock) }?;
        Ok(lock)
    }

    fn dma_control(&self, direction: Direction, enable: bool) -> Result<DmaCounters> {
        let (hw_count, sw_count) = match direction {
            Direction::Rx => {
                let mut writer = sys::litepcie_ioctl_dma_writer {
                    enable: enable as u8,
                    ..Default::default()
                };
                unsafe { sys::litepcie_ioctl_dma_writer_rw(self.fd(), &mut writer) }?;
                (writer.hw_count, writer.sw_count)
            }
            Direction::Tx => {
                let mut reader = sys::litepcie_ioctl_dma_reader {
                    enable: enable as u8,
                    ..Default::default()
                };
                unsafe { sys::litepcie_ioctl_dma_reader_rw(self.fd(), &mut reader) }?;
                (reader.hw_count, reader.sw_count)
            }
        };
        counters_from_raw(direction, hw_count, sw_count)
    }
}

fn counters_from_raw(direction: Direction, hw_count: i64, sw_count: i64) -> Result<DmaCounters> {
    let convert = |value: i64, name: &str| {
        u64::try_from(value)
            .map_err(|_| Error::integrity(direction, format!("negative {name} {value}")))
    };
    Ok(DmaCounters {
        hw_count: convert(hw_count, "hw_count")?,
        sw_count: convert(sw_count, "sw_count")?,
    })
}

fn geometry_from_raw(offset: u64, size: u64, count: u64) -> DmaGeometry {
    DmaGeometry {
        offset,
        slot_size: size as usize,
        slot_count: count as usize,
    }
}

impl DeviceHandle for LitePcieDevice {
    fn dma_info(&self) -> Result<DmaInfo> {
        let mut info = sys::litepcie_ioctl_mmap_dma_info::default();
        unsafe { sys::litepcie_ioctl_mmap_dma_info_get(self.fd(), &mut info) }?;
        Ok(DmaInfo {
            rx: geometry_from_raw(
                info.dma_rx_buf_offset,
                info.dma_rx_buf_size,
                info.dma_rx_buf_count,
            ),
            tx: geometry_from_raw(
                info.dma_tx_buf_offset,
                info.dma_tx_buf_size,
                info.dma_tx_buf_count,
            ),
        })
    }

    fn claim_dma(&self, direction: Direction) -> Result<()> {
        let claimed = &self.claimed[direction.index()];
        if claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::ResourceBusy(direction));
        }
        let status = match self.lock(direction, true) {
            Ok(lock) => match direction {
                Direction::Rx => lock.dma_writer_status,
                Direction::Tx => lock.dma_reader_status,
            },
            Err(err) => {
                claimed.store(false, Ordering::Release);
                return Err(err);
            }
        };
        if status != sys::LITEPCIE_LOCK_GRANTED {
            claimed.store(false, Ordering::Release);
            return Err(Error::ResourceBusy(direction));
        }
        Ok(())
    }

    fn release_dma(&self, direction: Direction) -> Result<()> {
        if self.claimed[direction.index()].swap(false, Ordering::AcqRel) {
            self.lock(direction, false)?;
        }
        Ok(())
    }

    fn set_loopback(&self, enabled: bool) -> Result<()> {
        let dma = sys::litepcie_ioctl_dma {
            loopback_enable: enabled as u8,
        };
        unsafe { sys::litepcie_ioctl_dma_set(self.fd(), &dma) }?;
        Ok(())
    }

    fn set_dma_enabled(&self, direction: Direction, enabled: bool) -> Result<DmaCounters> {
        let counters = self.dma_control(direction, enabled)?;
        self.enabled[direction.index()].store(enabled, Ordering::Release);
        Ok(counters)
    }

    fn dma_counters(&self, direction: Direction) -> Result<DmaCounters> {
        // The driver only reports counters through the enable request, so the
        // current enable state is repeated.
        let enabled = self.enabled[direction.index()].load(Ordering::Acquire);
        self.dma_control(direction, enabled)
    }

    fn publish_sw_count(&self, direction: Direction, sw_count: u64) -> Result<()> {
        let update = sys::litepcie_ioctl_mmap_dma_update {
            sw_count: i64::try_from(sw_count)
                .map_err(|_| Error::integrity(direction, "software count overflow"))?,
        };
        match direction {
            Direction::Rx => unsafe {
                sys::litepcie_ioctl_mmap_dma_writer_update(self.fd(), &update)
            }?,
            Direction::Tx => unsafe {
                sys::litepcie_ioctl_mmap_dma_reader_update(self.fd(), &update)
            }?,
        };
        trace!(%direction, sw_count, "Published software count");
        Ok(())
    }

    fn map_ring(&self, direction: Direction, geometry: &DmaGeometry) -> Result<NonNull<u8>> {
        let length = NonZeroUsize::new(geometry.len()).ok_or_else(|| Error::Mapping {
            direction,
            reason: "empty ring".to_string(),
        })?;
        let offset = libc::off_t::try_from(geometry.offset).map_err(|_| Error::Mapping {
            direction,
            reason: format!("offset 0x{:x} does not fit off_t", geometry.offset),
        })?;
        let base = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &self.file,
                offset,
            )
        }
        .map_err(|errno| Error::Mapping {
            direction,
            reason: format!("mmap failed: {errno}"),
        })?;
        Ok(base.cast())
    }

    unsafe fn unmap_ring(
        &self,
        _direction: Direction,
        base: NonNull<u8>,
        len: usize,
    ) -> Result<()> {
        unsafe { munmap(base.cast(), len) }?;
        Ok(())
    }

    fn wait_ready(&self, direction: Direction, timeout: Duration) -> Result<bool> {
        let events = match direction {
            Direction::Rx => PollFlags::POLLIN,
            Direction::Tx => PollFlags::POLLOUT,
        };
        let mut fds = [PollFd::new(self.file.as_fd(), events)];
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let timeout = PollTimeout::try_from(timeout_ms).unwrap_or(PollTimeout::MAX);
        match poll(&mut fds, timeout) {
            Ok(ready) => Ok(ready > 0),
            Err(Errno::EINTR) => Ok(false),
            Err(errno) => Err(errno.into()),
        }
    }

    fn read_csr(&self, addr: u32) -> Result<u32> {
        let mut reg = sys::litepcie_ioctl_reg {
            addr,
            val: 0,
            is_write: 0,
        };
        unsafe { sys::litepcie_ioctl_reg_rw(self.fd(), &mut reg) }?;
        Ok(reg.val)
    }

    fn write_csr(&self, addr: u32, value: u32) -> Result<()> {
        let mut reg = sys::litepcie_ioctl_reg {
            addr,
            val: value,
            is_write: 1,
        };
        unsafe { sys::litepcie_ioctl_reg_rw(self.fd(), &mut reg) }?;
        Ok(())
    }
}

impl Drop for LitePcieDevice {
    fn drop(&mut self) {
        for direction in Direction::ALL {
            if self.enabled[direction.index()].load(Ordering::Acquire)
                && let Err(err) = self.dma_control(direction, false)
            {
                tracing::error!(%direction, "Failed to disable DMA on close: {:?}", err);
            }
            if let Err(err) = self.release_dma(direction) {
                tracing::error!(%direction, "Failed to release DMA on close: {:?}", err);
            }
        }
    }
}
