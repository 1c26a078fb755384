//! Data Source Registry
//!
//! A data source is one provider (a kernel-mode driver, a user-mode
//! process, or the core itself) together with the instance sets it owns
//! and the MOF resources describing its schema. Providers are keyed by
//! provider id through a [`RegEntry`] that tracks the registration state
//! machine:
//!
//! ```text
//! Unregistered ──first contact──► RegistrationInProgress
//!                                        │ blob fetched and linked
//!                                        ▼
//!            ┌──────── update ──────► Registered
//!            └───────────────────────────┤ deregister
//!                                        ▼
//!                                 RundownInProgress ──► Unregistered
//! ```
//!
//! `Unregistered` is the absence of an entry.

use crate::catalog::{DataSourceHandle, GuidObjectHandle, InstanceSetHandle, MofResourceHandle};
use alloc::string::String;
use alloc::vec::Vec;

bitflags::bitflags! {
    /// Data source flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DataSourceFlags: u32 {
        /// Provider is a kernel-mode driver
        const KERNEL_MODE = 0x0000_0001;
        /// Provider is a user-mode process reached through a request object
        const USER_MODE = 0x0000_0002;
        /// Served by the core
        const INTERNAL = 0x0000_0004;
        /// Deregistration has started
        const RUNDOWN = 0x0000_0008;
        /// Queries of this provider's guids need no access check
        const ALLOW_ALL_ACCESS = 0x0000_0010;
    }
}

/// Where a provider lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderMode {
    Kernel,
    User,
    Internal,
}

impl ProviderMode {
    pub fn data_source_flags(self) -> DataSourceFlags {
        match self {
            ProviderMode::Kernel => DataSourceFlags::KERNEL_MODE,
            ProviderMode::User => DataSourceFlags::USER_MODE,
            ProviderMode::Internal => DataSourceFlags::INTERNAL | DataSourceFlags::KERNEL_MODE,
        }
    }
}

/// A registered provider
#[derive(Debug, Clone)]
pub struct DataSource {
    pub provider_id: u32,
    pub flags: DataSourceFlags,
    /// Owned instance sets, in registration order
    pub instance_sets: Vec<InstanceSetHandle>,
    /// Referenced MOF resources
    pub mof_resources: Vec<MofResourceHandle>,
    pub registry_path: Option<String>,
    /// Request object of a user-mode provider
    pub request_object: Option<GuidObjectHandle>,
}

impl DataSource {
    pub fn new(provider_id: u32, mode: ProviderMode) -> Self {
        Self {
            provider_id,
            flags: mode.data_source_flags(),
            instance_sets: Vec::new(),
            mof_resources: Vec::new(),
            registry_path: None,
            request_object: None,
        }
    }

    pub fn is_user_mode(&self) -> bool {
        self.flags.contains(DataSourceFlags::USER_MODE)
    }

    pub fn is_internal(&self) -> bool {
        self.flags.contains(DataSourceFlags::INTERNAL)
    }

    pub fn allows_all_access(&self) -> bool {
        self.flags.contains(DataSourceFlags::ALLOW_ALL_ACCESS)
    }
}

/// Where a MOF resource's image path came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MofLocation {
    /// User-mode provider image
    ImagePath,
    /// Kernel-mode driver service key
    RegistryPath,
}

/// Schema metadata blob named by a provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MofResource {
    /// Registry path or image path the resource lives in
    pub image_path: String,
    pub resource_name: String,
    pub location: MofLocation,
}

impl MofResource {
    /// Resources are shared when both path and name match
    pub fn matches(&self, image_path: &str, resource_name: &str) -> bool {
        self.image_path == image_path && self.resource_name == resource_name
    }
}

/// Registration state of one provider id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegState {
    RegistrationInProgress,
    Registered,
    RundownInProgress,
}

/// Registry entry for one provider id
#[derive(Debug, Clone)]
pub struct RegEntry {
    pub provider_id: u32,
    pub state: RegState,
    pub mode: ProviderMode,
    pub data_source: Option<DataSourceHandle>,
}

impl RegEntry {
    pub fn new(provider_id: u32, mode: ProviderMode) -> Self {
        Self {
            provider_id,
            state: RegState::RegistrationInProgress,
            mode,
            data_source: None,
        }
    }
}
