//! Kernel-mode WMI Core
//!
//! The WMI core connects data providers (drivers and user-mode processes
//! that expose instrumentation) with consumers that query data blocks,
//! set them, run methods on them, or subscribe to their events.
//!
//! # Architecture
//!
//! ```text
//!   consumers                      providers
//! ┌───────────────┐            ┌────────────────────┐
//! │ guid objects  │            │ ProviderTransport  │
//! │ (query/events)│            │  (IRP dispatch)    │
//! └──────┬────────┘            └─────────▲──────────┘
//!        │      ┌─────────────────────┐  │
//!        └─────►│ Wmi                 │──┘ reginfo fetch, queries,
//!               │  catalog lock:      │    enable/disable
//!               │   guid entries      │
//!               │   instance sets     │◄── fire_event
//!               │   data sources      │
//!               │   mof resources     │
//!               │   consumer objects  │
//!               │  trace lock         │
//!               └─────────────────────┘
//! ```
//!
//! All catalog state lives behind one `spin::Mutex`. Objects are kept in
//! chunked pools ([`chunk`]) and addressed by generation-checked handles;
//! reference counts decide when an object is retired. Cleanup that must
//! call out (notifications, provider disables) runs after the lock is
//! dropped. Tracing enable and disable take a separate lock that is always
//! acquired before the catalog lock.
//!
//! Based on Windows Server 2003 base/ntos/wmi/

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod catalog;
pub mod chunk;
pub mod config;
pub mod consumer;
pub mod datasource;
pub mod enable;
pub mod error;
pub mod guid;
pub mod instance;
pub mod mailbox;
pub mod notify;
pub mod query;
pub mod register;
pub mod reginfo;
pub mod stats;
pub mod transport;
pub mod wnode;

#[cfg(test)]
mod testing;

pub use catalog::{Catalog, GuidEntryHandle, GuidObjectHandle};
pub use config::WmiConfig;
pub use consumer::{EventPriority, ObjectKind, ReceiveRequest};
pub use error::{Result, WmiError};
pub use guid::Guid;
pub use query::GuidInfo;
pub use register::{Executor, InlineExecutor, RegistrationWork, UserRegistration};
pub use stats::{WmiStatistics, WmiStats};
pub use transport::{AccessCheck, AccessRights, AllowAll, ProviderTransport, RequestKind};

use crate::catalog::GuidEntryFlags;
use crate::guid::{ENUMERATE_GUIDS_GUID, INSTANCE_INFO_GUID};
use crate::reginfo::{RegGuidSpec, RegInfoBuilder};
use alloc::collections::VecDeque;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use log::info;

/// The WMI core
pub struct Wmi {
    /// Guid entries, instance sets, data sources, MOF resources, objects
    pub(crate) catalog: spin::Mutex<Catalog>,
    /// Serializes trace enable and disable; taken before `catalog`
    pub(crate) trace_lock: spin::Mutex<()>,
    pub(crate) transport: Arc<dyn ProviderTransport>,
    pub(crate) access: Arc<dyn AccessCheck>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) config: WmiConfig,
    pub(crate) stats: WmiStats,
    pub(crate) reg_queue: spin::Mutex<VecDeque<RegistrationWork>>,
    /// Queued work plus one until `start` releases the latch
    pub(crate) reg_work_count: AtomicU32,
    pub(crate) started: AtomicBool,
    clock: AtomicI64,
    pub(crate) next_user_provider_id: AtomicU32,
}

impl Wmi {
    /// Create a core whose deferred registration work runs inline
    pub fn new(
        config: WmiConfig,
        transport: Arc<dyn ProviderTransport>,
        access: Arc<dyn AccessCheck>,
    ) -> Result<Arc<Self>> {
        Self::with_executor(config, transport, access, Arc::new(InlineExecutor))
    }

    pub fn with_executor(
        config: WmiConfig,
        transport: Arc<dyn ProviderTransport>,
        access: Arc<dyn AccessCheck>,
        executor: Arc<dyn Executor>,
    ) -> Result<Arc<Self>> {
        let wmi = Arc::new(Self {
            catalog: spin::Mutex::new(Catalog::new(&config)),
            trace_lock: spin::Mutex::new(()),
            transport,
            access,
            executor,
            config,
            stats: WmiStats::new(),
            reg_queue: spin::Mutex::new(VecDeque::new()),
            reg_work_count: AtomicU32::new(1),
            started: AtomicBool::new(false),
            clock: AtomicI64::new(0),
            next_user_provider_id: AtomicU32::new(register::FIRST_USER_PROVIDER_ID),
        });
        wmi.register_internal_guids()?;
        info!("WMI: core initialized");
        Ok(wmi)
    }

    /// The core answers instance-info and guid enumeration itself
    fn register_internal_guids(&self) -> Result<()> {
        let internal = [INSTANCE_INFO_GUID, ENUMERATE_GUIDS_GUID];
        let mut builder = RegInfoBuilder::new();
        for guid in internal {
            builder = builder.guid(RegGuidSpec::new(guid, 1));
        }
        self.register_internal(&builder.build()?)?;

        let mut cat = self.catalog.lock();
        for h in cat.guid_list.iter().copied().collect::<alloc::vec::Vec<_>>() {
            if let Some(entry) = cat.guid_entries.get_mut(h) {
                if internal.contains(&entry.guid) {
                    entry.flags |= GuidEntryFlags::INTERNAL;
                }
            }
        }
        Ok(())
    }

    pub fn config(&self) -> &WmiConfig {
        &self.config
    }

    pub fn stats(&self) -> WmiStatistics {
        self.stats.snapshot()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Monotonic event timestamp
    pub(crate) fn next_timestamp(&self) -> i64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }
}
