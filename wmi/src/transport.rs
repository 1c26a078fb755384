//! Provider Transport and Capability Check
//!
//! The WMI core never talks to a driver directly. Requests to providers
//! (registration fetch, queries, enable/disable) go through a
//! [`ProviderTransport`], which in a kernel is the IRP_MJ_SYSTEM_CONTROL
//! dispatch path. Access decisions are delegated to an [`AccessCheck`].
//!
//! Both calls may block for an unbounded time; the core never invokes
//! them while holding the catalog lock.

use crate::error::{Result, WmiError};
use crate::guid::Guid;

/// Request codes understood by providers (IRP_MN_* minor functions)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    QueryAllData = 0x00,
    QuerySingleInstance = 0x01,
    ChangeSingleInstance = 0x02,
    ChangeSingleItem = 0x03,
    EnableEvents = 0x04,
    DisableEvents = 0x05,
    EnableCollection = 0x06,
    DisableCollection = 0x07,
    /// Fetch the provider's WMIREGINFO
    RegInfo = 0x08,
    ExecuteMethod = 0x09,
}

impl RequestKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(RequestKind::QueryAllData),
            0x01 => Some(RequestKind::QuerySingleInstance),
            0x02 => Some(RequestKind::ChangeSingleInstance),
            0x03 => Some(RequestKind::ChangeSingleItem),
            0x04 => Some(RequestKind::EnableEvents),
            0x05 => Some(RequestKind::DisableEvents),
            0x06 => Some(RequestKind::EnableCollection),
            0x07 => Some(RequestKind::DisableCollection),
            0x08 => Some(RequestKind::RegInfo),
            0x09 => Some(RequestKind::ExecuteMethod),
            _ => None,
        }
    }

    pub fn is_enable_disable(self) -> bool {
        matches!(
            self,
            RequestKind::EnableEvents
                | RequestKind::DisableEvents
                | RequestKind::EnableCollection
                | RequestKind::DisableCollection
        )
    }
}

/// Delivers requests to providers
pub trait ProviderTransport: Send + Sync {
    /// Send `kind` for `guid` to the provider.
    ///
    /// `buffer` carries the request record on entry (zero-filled for
    /// RegInfo) and the provider's response on return. On success the
    /// number of response bytes is returned; a response that does not
    /// fit must be reported as [`WmiError::BufferTooSmall`] with the
    /// required size.
    fn send_request(
        &self,
        provider_id: u32,
        kind: RequestKind,
        guid: &Guid,
        buffer: &mut [u8],
    ) -> Result<usize>;
}

bitflags::bitflags! {
    /// Rights requested on a guid
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AccessRights: u32 {
        const QUERY = 0x0001;
        const SET = 0x0002;
        const NOTIFICATION = 0x0004;
        const READ_DESCRIPTION = 0x0008;
        const EXECUTE = 0x0010;
        const REGISTER_GUIDS = 0x0800;
    }
}

/// Security policy hook
pub trait AccessCheck: Send + Sync {
    /// Return the granted rights, or `AccessDenied`
    fn check_access(&self, guid: &Guid, desired: AccessRights) -> Result<AccessRights>;
}

/// Grants every request
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl AccessCheck for AllowAll {
    fn check_access(&self, _guid: &Guid, desired: AccessRights) -> Result<AccessRights> {
        Ok(desired)
    }
}

/// Transport for an embedding with no kernel-mode providers
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProviders;

impl ProviderTransport for NoProviders {
    fn send_request(
        &self,
        provider_id: u32,
        _kind: RequestKind,
        _guid: &Guid,
        _buffer: &mut [u8],
    ) -> Result<usize> {
        Err(WmiError::ProviderNotFound(provider_id))
    }
}
