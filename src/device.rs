//! Device abstraction for planning.
//!
//! The scheduler never talks to a driver directly; everything it needs
//! from the GPU runtime goes through [`DeviceManager`]. The crate ships
//! [`HostDevice`], a host-side simulation with deterministic behavior,
//! used by tests and offline planning.

use std::sync::Mutex;

use log::debug;
use rustc_hash::FxHashMap;

use crate::error::{Result, SchedError};

/// Static resource description of one GPU.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub sm_count: u32,
    pub warps_per_sm: u32,
    pub bytes_free: u64,
}

impl DeviceInfo {
    /// Total concurrent warp budget of the device.
    pub fn warp_budget(&self) -> u32 {
        self.sm_count * self.warps_per_sm
    }
}

/// An address in the device's memory space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddress(pub u64);

impl DeviceAddress {
    pub fn offset(self, bytes: u64) -> DeviceAddress {
        DeviceAddress(self.0 + bytes)
    }
}

/// Handle describing an exported buffer, exchangeable across ranks.
#[derive(Debug, Clone, Copy)]
pub struct IpcHandle {
    pub addr: DeviceAddress,
    pub bytes: u64,
}

/// Everything the scheduler requires from the GPU runtime.
pub trait DeviceManager: Send + Sync {
    fn device_info(&self) -> DeviceInfo;

    /// Allocates one contiguous arena the planner subdivides.
    fn allocate_arena(&self, bytes: u64) -> Result<DeviceAddress>;

    /// Registers a local buffer range for access by other ranks.
    fn register_export(&self, sid: i32, addr: DeviceAddress, bytes: u64) -> Result<()>;

    /// Maps a remote buffer handle into this device's address space.
    fn resolve_import(&self, handle: &IpcHandle) -> Result<DeviceAddress>;

    /// Profiler hook: cycles taken by a one-off micro-kernel for the
    /// sequence `hash` at the given warp count over `bytes` of data.
    fn measure_cycles(&self, hash: u64, warps: u32, bytes: u64) -> Result<u64>;
}

/// A deterministic host-side device simulation.
///
/// Arena allocation is a bump allocator over a fictional address space;
/// imports map to the remote address unchanged; measured cycles follow a
/// fixed bandwidth model so schedules are reproducible.
pub struct HostDevice {
    info: DeviceInfo,
    next_base: Mutex<u64>,
    exports: Mutex<FxHashMap<i32, IpcHandle>>,
    profiler_stalled: bool,
}

/// Base of the simulated device address space.
const HOST_ARENA_BASE: u64 = 0x1000_0000;

impl HostDevice {
    pub fn new(info: DeviceInfo) -> Self {
        HostDevice {
            info,
            next_base: Mutex::new(HOST_ARENA_BASE),
            exports: Mutex::new(FxHashMap::default()),
            profiler_stalled: false,
        }
    }

    /// A device whose `measure_cycles` always times out. Test helper for
    /// the profiler's heuristic fallback.
    pub fn with_stalled_profiler(info: DeviceInfo) -> Self {
        HostDevice {
            profiler_stalled: true,
            ..HostDevice::new(info)
        }
    }
}

impl DeviceManager for HostDevice {
    fn device_info(&self) -> DeviceInfo {
        self.info
    }

    fn allocate_arena(&self, bytes: u64) -> Result<DeviceAddress> {
        if bytes > self.info.bytes_free {
            return Err(SchedError::OutOfDeviceMemory {
                needed: bytes,
                available: self.info.bytes_free,
            });
        }
        let mut next = self.next_base.lock().unwrap();
        let addr = DeviceAddress(*next);
        // Keep arenas page-aligned and non-overlapping.
        *next += (bytes + 4095) / 4096 * 4096;
        debug!("host device: arena of {bytes} bytes at {addr:?}");
        Ok(addr)
    }

    fn register_export(&self, sid: i32, addr: DeviceAddress, bytes: u64) -> Result<()> {
        self.exports
            .lock()
            .unwrap()
            .insert(sid, IpcHandle { addr, bytes });
        Ok(())
    }

    fn resolve_import(&self, handle: &IpcHandle) -> Result<DeviceAddress> {
        Ok(handle.addr)
    }

    fn measure_cycles(&self, hash: u64, warps: u32, bytes: u64) -> Result<u64> {
        if self.profiler_stalled {
            return Err(SchedError::ProfilerTimeout { hash, warps });
        }
        // Fixed-bandwidth model: launch overhead plus bytes moved per warp.
        Ok(1000 + bytes / u64::from(warps.max(1)))
    }
}
