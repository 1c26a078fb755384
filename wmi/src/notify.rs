//! Internal Notifications
//!
//! The core reports its own catalog changes as ordinary events, so any
//! consumer can open the well-known guids and watch them:
//!
//! | Guid                        | Fired when                              |
//! |-----------------------------|-----------------------------------------|
//! | `GUID_REGISTRATION_INFO`    | guids are added, removed or rebuilt     |
//! | `GUID_MOF_RESOURCE_ADDED`   | a new MOF resource or binary MOF appears |
//! | `GUID_MOF_RESOURCE_REMOVED` | the last user of a MOF resource leaves  |
//!
//! MOF notifications are single instance event records whose provider id
//! field carries the action code and whose data block is the counted image
//! path followed by the counted resource name.

use crate::catalog::{Catalog, InstanceSetHandle, MofResourceHandle};
use crate::consumer::EventPriority;
use crate::datasource::{MofLocation, MofResource};
use crate::error::{Result, WmiError};
use crate::guid::{Guid, GUID_MOF_RESOURCE_ADDED, GUID_MOF_RESOURCE_REMOVED, GUID_REGISTRATION_INFO};
use crate::wnode::{self, WnodeFlags};
use crate::Wmi;
use alloc::string::String;
use alloc::vec::Vec;
use log::{debug, trace};

/// Instance name of registration change events
pub const REGUPDATE_INSTANCE_NAME: &str = "REGUPDATEINFO";

/// Operation code of a registration change event
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationOp {
    Add = 1,
    Delete = 2,
    Update = 4,
}

/// Action code of a MOF notification
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MofAction {
    ImagePath = 0,
    RegistryPath = 1,
    BinaryMof = 3,
}

impl From<MofLocation> for MofAction {
    fn from(location: MofLocation) -> Self {
        match location {
            MofLocation::ImagePath => MofAction::ImagePath,
            MofLocation::RegistryPath => MofAction::RegistryPath,
        }
    }
}

/// Payload of a registration change event: operation, count, guids
pub fn registration_update_data(op: RegistrationOp, guids: &[Guid]) -> Vec<u8> {
    let mut data = Vec::with_capacity(8 + guids.len() * crate::guid::GUID_SIZE);
    data.extend_from_slice(&(op as u32).to_le_bytes());
    data.extend_from_slice(&(guids.len() as u32).to_le_bytes());
    for guid in guids {
        data.extend_from_slice(&guid.to_bytes());
    }
    data
}

fn mof_record(guid: Guid, action: MofAction, image_path: &str, resource_name: &str) -> Result<Vec<u8>> {
    let mut data = Vec::new();
    wnode::write_counted_string(&mut data, image_path)?;
    wnode::write_counted_string(&mut data, resource_name)?;
    wnode::single_instance(guid, action as u32, WnodeFlags::EVENT_ITEM, Some(""), 0, &data)
}

impl Catalog {
    /// Reference the resource named by (`image_path`, `resource_name`),
    /// creating it if needed. Returns the handle and whether it is new.
    pub(crate) fn add_mof_resource(
        &mut self,
        image_path: &str,
        resource_name: &str,
        location: MofLocation,
    ) -> Result<(MofResourceHandle, bool)> {
        let existing = self.mof_resource_list.iter().copied().find(|&h| {
            self.mof_resources
                .get(h)
                .is_some_and(|mof| mof.matches(image_path, resource_name))
        });
        if let Some(handle) = existing {
            if self.mof_resources.reference(handle) {
                return Ok((handle, false));
            }
        }
        let handle = self.mof_resources.allocate(MofResource {
            image_path: String::from(image_path),
            resource_name: String::from(resource_name),
            location,
        })?;
        self.mof_resource_list.push(handle);
        Ok((handle, true))
    }
}

impl Wmi {
    /// Fire a core-generated event at high priority. Nobody listening is
    /// not an error.
    pub(crate) fn fire_internal(&self, mut record: Vec<u8>) {
        if let Err(e) = wnode::set_timestamp(&mut record, self.next_timestamp()) {
            debug!("WMI: malformed internal notification: {}", e);
            return;
        }
        match self.process_event(record, EventPriority::High) {
            Ok(()) | Err(WmiError::GuidNotFound(_)) => {}
            Err(e) => debug!("WMI: internal notification not delivered: {}", e),
        }
    }

    /// Announce guids added, removed or rebuilt
    pub(crate) fn send_guid_update(&self, op: RegistrationOp, guids: &[Guid]) {
        if guids.is_empty() {
            return;
        }
        let data = registration_update_data(op, guids);
        match wnode::single_instance(
            GUID_REGISTRATION_INFO,
            0,
            WnodeFlags::EVENT_ITEM,
            Some(REGUPDATE_INSTANCE_NAME),
            0,
            &data,
        ) {
            Ok(record) => {
                trace!("WMI: registration {:?} for {} guid(s)", op, guids.len());
                self.fire_internal(record);
            }
            Err(e) => debug!("WMI: cannot build registration notification: {}", e),
        }
    }

    pub(crate) fn mof_resource_added(&self, mof: &MofResource) {
        self.mof_notification(GUID_MOF_RESOURCE_ADDED, mof);
    }

    /// Called when the last data source using `mof` goes away
    pub(crate) fn mof_resource_removed(&self, mof: &MofResource) {
        self.mof_notification(GUID_MOF_RESOURCE_REMOVED, mof);
    }

    fn mof_notification(&self, guid: Guid, mof: &MofResource) {
        match mof_record(guid, mof.location.into(), &mof.image_path, &mof.resource_name) {
            Ok(record) => self.fire_internal(record),
            Err(e) => debug!("WMI: cannot build MOF notification: {}", e),
        }
    }

    /// One notification per instance of a binary MOF guid set; each
    /// instance name is a resource name
    pub(crate) fn binary_mof_notification(&self, set: InstanceSetHandle, added: bool) {
        let names = self
            .catalog
            .lock()
            .instance_sets
            .get(set)
            .map(|s| s.instance_names())
            .unwrap_or_default();
        let guid = if added {
            GUID_MOF_RESOURCE_ADDED
        } else {
            GUID_MOF_RESOURCE_REMOVED
        };
        for name in names {
            match mof_record(guid, MofAction::BinaryMof, "", &name) {
                Ok(record) => self.fire_internal(record),
                Err(e) => debug!("WMI: cannot build binary MOF notification: {}", e),
            }
        }
    }

    /// Every MOF resource currently referenced by a data source
    pub fn enumerate_mof_resources(&self) -> Vec<MofResource> {
        let cat = self.catalog.lock();
        cat.mof_resource_list
            .iter()
            .filter_map(|&h| cat.mof_resources.get(h).cloned())
            .collect()
    }
}
