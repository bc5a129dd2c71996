//! Cross-rank transport abstraction.
//!
//! The planner publishes exported buffers and resolves imported ones
//! through [`IpcTransport`]; the real transport (RDMA or shared-memory
//! IPC) lives in the executor. [`LocalHub`] is the in-process variant
//! that lets several ranks scheduled in one process find each other,
//! which is all the tests need.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use log::debug;
use rustc_hash::FxHashMap;

use crate::device::IpcHandle;
use crate::error::{Result, SchedError};

/// Publish/lookup of exported buffer handles across ranks.
///
/// `lookup` blocks up to `deadline`; the scheduler treats it as a
/// synchronous call with a bounded retry window.
pub trait IpcTransport: Send + Sync {
    fn publish(&self, sid: i32, handle: IpcHandle) -> Result<()>;
    fn lookup(&self, rank: i32, sid: i32, deadline: Duration) -> Result<IpcHandle>;
}

type Registry = RwLock<FxHashMap<(i32, i32), IpcHandle>>;

/// In-process exchange point shared by the transports of all local ranks.
#[derive(Default)]
pub struct LocalHub {
    registry: Registry,
}

impl LocalHub {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalHub::default())
    }

    /// The transport endpoint of one rank.
    pub fn transport_for(self: &Arc<Self>, rank: i32) -> LocalTransport {
        LocalTransport {
            hub: Arc::clone(self),
            rank,
        }
    }
}

/// One rank's endpoint of a [`LocalHub`].
pub struct LocalTransport {
    hub: Arc<LocalHub>,
    rank: i32,
}

impl IpcTransport for LocalTransport {
    fn publish(&self, sid: i32, handle: IpcHandle) -> Result<()> {
        debug!("rank {}: publish sid {sid} at {:?}", self.rank, handle.addr);
        self.hub
            .registry
            .write()
            .unwrap()
            .insert((self.rank, sid), handle);
        Ok(())
    }

    fn lookup(&self, rank: i32, sid: i32, deadline: Duration) -> Result<IpcHandle> {
        let start = Instant::now();
        loop {
            if let Some(&handle) = self.hub.registry.read().unwrap().get(&(rank, sid)) {
                debug!(
                    "rank {}: resolved import (rank {rank}, sid {sid}) at {:?}",
                    self.rank, handle.addr
                );
                return Ok(handle);
            }
            if start.elapsed() >= deadline {
                return Err(SchedError::ImportUnresolved {
                    rank,
                    sid,
                    waited_ms: start.elapsed().as_millis() as u64,
                });
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
