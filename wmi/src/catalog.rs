//! Guid Catalog
//!
//! The catalog is the arena every WMI object lives in, guarded by the single
//! catalog lock (`Wmi::catalog`). It maps guids to [`GuidEntry`] records,
//! each aggregating the instance sets that implement the guid, the consumer
//! objects open against it, and the event/collection enable counts.
//!
//! # Ownership
//!
//! Objects reference each other by [`Handle`]. Who holds a reference:
//!
//! | Object       | Held by                                              |
//! |--------------|------------------------------------------------------|
//! | GuidEntry    | each linked instance set, each open object, lookups |
//! | InstanceSet  | its data source's list                               |
//! | DataSource   | registry membership, each of its instance sets      |
//! | MofResource  | each data source naming it                           |
//! | GuidObject   | the open handle, pending work, request objects      |
//!
//! # Teardown
//!
//! Dropping the last reference happens under the lock: the object is
//! unlinked from its in-use list and moved out of its slot as a
//! [`Retired`] value. Type-specific cleanup (which may call providers or
//! fire notifications) runs after the lock is dropped, then the slot is
//! released under the lock again.

use crate::chunk::{ChunkPool, Handle, SlotFlags};
use crate::config::WmiConfig;
use crate::consumer::GuidObject;
use crate::datasource::{DataSource, DataSourceFlags, MofResource, RegEntry};
use crate::error::{Result, WmiError};
use crate::guid::Guid;
use crate::instance::{InstanceSet, InstanceSetFlags};
use crate::Wmi;
use alloc::collections::{BTreeMap, VecDeque};
use alloc::vec::Vec;
use log::{trace, warn};

pub type GuidEntryHandle = Handle<GuidEntry>;
pub type InstanceSetHandle = Handle<InstanceSet>;
pub type DataSourceHandle = Handle<DataSource>;
pub type MofResourceHandle = Handle<MofResource>;
pub type GuidObjectHandle = Handle<GuidObject>;

/// Pool signatures
pub const GUID_ENTRY_SIGNATURE: u32 = u32::from_le_bytes(*b"WmiG");
pub const INSTANCE_SET_SIGNATURE: u32 = u32::from_le_bytes(*b"WmiI");
pub const DATA_SOURCE_SIGNATURE: u32 = u32::from_le_bytes(*b"WmiD");
pub const MOF_RESOURCE_SIGNATURE: u32 = u32::from_le_bytes(*b"WmiM");
pub const GUID_OBJECT_SIGNATURE: u32 = u32::from_le_bytes(*b"WmiO");

bitflags::bitflags! {
    /// Guid entry flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GuidEntryFlags: u32 {
        /// Served by the core; never sent enable/disable requests
        const INTERNAL = 0x0000_0001;
        /// Event enable/disable fan-out is running without the lock
        const NOTIFICATION_IN_PROGRESS = 0x0000_0002;
        /// Collection enable/disable fan-out is running without the lock
        const COLLECTION_IN_PROGRESS = 0x0000_0004;
        /// A trace logger is attached
        const TRACE_ENABLED = 0x0000_0008;
    }
}

/// All instance sets and consumers of one guid
#[derive(Debug, Clone)]
pub struct GuidEntry {
    pub guid: Guid,
    pub flags: GuidEntryFlags,
    /// Linked instance sets, in registration order
    pub instance_sets: Vec<InstanceSetHandle>,
    /// Open consumer objects, in open order
    pub objects: Vec<GuidObjectHandle>,
    pub event_ref_count: u32,
    pub collect_ref_count: u32,
    pub logger_context: u64,
}

impl GuidEntry {
    pub fn new(guid: Guid) -> Self {
        Self {
            guid,
            flags: GuidEntryFlags::empty(),
            instance_sets: Vec::new(),
            objects: Vec::new(),
            event_ref_count: 0,
            collect_ref_count: 0,
            logger_context: 0,
        }
    }

    pub fn instance_set_count(&self) -> usize {
        self.instance_sets.len()
    }

    pub fn is_internal(&self) -> bool {
        self.flags.contains(GuidEntryFlags::INTERNAL)
    }
}

/// An object whose last reference is gone, awaiting cleanup and release
pub(crate) enum Retired {
    GuidEntry(GuidEntryHandle, GuidEntry),
    InstanceSet(InstanceSetHandle, InstanceSet),
    DataSource(DataSourceHandle, DataSource),
    MofResource(MofResourceHandle, MofResource),
    GuidObject(GuidObjectHandle, GuidObject),
}

/// Work to finish once the catalog lock is dropped
pub(crate) type Deferred = Vec<Retired>;

fn drop_reference<T>(pool: &mut ChunkPool<T>, handle: Handle<T>) -> Option<T> {
    match pool.unreference(handle) {
        Ok(true) => match pool.take(handle) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!("WMI: cannot retire slot {:?}: {}", handle, e);
                None
            }
        },
        Ok(false) => None,
        Err(e) => {
            warn!("WMI: unreference of {:?} failed: {}", handle, e);
            None
        }
    }
}

/// The catalog arena
pub struct Catalog {
    pub guid_entries: ChunkPool<GuidEntry>,
    pub instance_sets: ChunkPool<InstanceSet>,
    pub data_sources: ChunkPool<DataSource>,
    pub mof_resources: ChunkPool<MofResource>,
    pub objects: ChunkPool<GuidObject>,
    /// Guid entries, most recently found first
    pub guid_list: VecDeque<GuidEntryHandle>,
    pub data_source_list: Vec<DataSourceHandle>,
    pub mof_resource_list: Vec<MofResourceHandle>,
    pub reg_entries: BTreeMap<u32, RegEntry>,
}

impl Catalog {
    pub fn new(config: &WmiConfig) -> Self {
        let slots = config.chunk_slots;
        Self {
            guid_entries: ChunkPool::new(
                GUID_ENTRY_SIGNATURE,
                slots.guid_entries,
                SlotFlags::ON_INUSE_LIST,
            ),
            instance_sets: ChunkPool::new(
                INSTANCE_SET_SIGNATURE,
                slots.instance_sets,
                SlotFlags::empty(),
            ),
            data_sources: ChunkPool::new(
                DATA_SOURCE_SIGNATURE,
                slots.data_sources,
                SlotFlags::ON_INUSE_LIST,
            ),
            mof_resources: ChunkPool::new(
                MOF_RESOURCE_SIGNATURE,
                slots.mof_resources,
                SlotFlags::ON_INUSE_LIST,
            ),
            objects: ChunkPool::new(GUID_OBJECT_SIGNATURE, slots.guid_objects, SlotFlags::empty()),
            guid_list: VecDeque::new(),
            data_source_list: Vec::new(),
            mof_resource_list: Vec::new(),
            reg_entries: BTreeMap::new(),
        }
    }

    // ========================================================================
    // Guid entries
    // ========================================================================

    /// Find the entry for `guid` and take a reference on it.
    ///
    /// With `promote` the entry moves to the front of the list.
    pub fn find_guid_entry(&mut self, guid: &Guid, promote: bool) -> Option<GuidEntryHandle> {
        let position = self.guid_list.iter().position(|&h| {
            self.guid_entries.is_live(h)
                && self.guid_entries.get(h).is_some_and(|ge| ge.guid == *guid)
        })?;
        let handle = self.guid_list[position];
        if !self.guid_entries.reference(handle) {
            return None;
        }
        if promote && position != 0 {
            self.guid_list.remove(position);
            self.guid_list.push_front(handle);
        }
        Some(handle)
    }

    /// Allocate a fresh entry at the front of the list. The caller owns
    /// the initial reference.
    pub fn create_guid_entry(&mut self, guid: Guid) -> Result<GuidEntryHandle> {
        let handle = self.guid_entries.allocate(GuidEntry::new(guid))?;
        self.guid_list.push_front(handle);
        trace!("WMI: created guid entry for {}", guid);
        Ok(handle)
    }

    /// Referenced entry for `guid`, created on demand
    pub fn find_or_create_guid_entry(&mut self, guid: Guid) -> Result<GuidEntryHandle> {
        match self.find_guid_entry(&guid, false) {
            Some(handle) => Ok(handle),
            None => self.create_guid_entry(guid),
        }
    }

    /// Instance sets currently exposing the entry's guid, minus `exclude`
    pub fn peers(
        &self,
        guid_entry: Option<GuidEntryHandle>,
        exclude: Option<InstanceSetHandle>,
    ) -> Vec<&InstanceSet> {
        let Some(ge) = guid_entry.and_then(|h| self.guid_entries.get(h)) else {
            return Vec::new();
        };
        ge.instance_sets
            .iter()
            .filter(|&&h| Some(h) != exclude)
            .filter_map(|&h| self.instance_sets.get(h))
            .collect()
    }

    /// Map an instance name to the set exposing it and the index within
    /// that set
    pub fn resolve_instance(
        &self,
        guid_entry: GuidEntryHandle,
        name: &str,
    ) -> Option<(InstanceSetHandle, u32)> {
        let ge = self.guid_entries.get(guid_entry)?;
        ge.instance_sets.iter().find_map(|&h| {
            let set = self.instance_sets.get(h)?;
            set.find_instance(name).map(|index| (h, index))
        })
    }

    /// Instance set of `guid_entry` owned by `provider_id`
    pub fn set_for_provider(
        &self,
        guid_entry: GuidEntryHandle,
        provider_id: u32,
    ) -> Option<InstanceSetHandle> {
        let ge = self.guid_entries.get(guid_entry)?;
        ge.instance_sets.iter().copied().find(|&h| {
            self.instance_sets
                .get(h)
                .is_some_and(|set| set.provider_id == provider_id)
        })
    }

    /// Instance set for `guid` in a data source's list
    pub fn set_in_source(&self, data_source: DataSourceHandle, guid: &Guid) -> Option<InstanceSetHandle> {
        let ds = self.data_sources.get(data_source)?;
        ds.instance_sets.iter().copied().find(|&h| {
            self.instance_sets
                .get(h)
                .is_some_and(|set| set.guid == *guid)
        })
    }

    /// Registered, non-rundown data source of a provider
    pub fn data_source_for(&self, provider_id: u32) -> Option<DataSourceHandle> {
        let handle = self.reg_entries.get(&provider_id)?.data_source?;
        let ds = self.data_sources.get(handle)?;
        (!ds.flags.contains(DataSourceFlags::RUNDOWN)).then_some(handle)
    }

    /// Count of instance sets whose back link names `guid_entry`
    pub fn sets_pointing_at(&self, guid_entry: GuidEntryHandle) -> usize {
        self.instance_sets
            .iter()
            .filter(|(_, set)| set.guid_entry == Some(guid_entry))
            .count()
    }

    // ========================================================================
    // Instance set linkage
    // ========================================================================

    /// Link a built set under `data_source`, creating its guid entry on
    /// demand. The set takes references on both.
    pub(crate) fn link_instance_set(
        &mut self,
        mut set: InstanceSet,
        data_source: DataSourceHandle,
        deferred: &mut Deferred,
    ) -> Result<InstanceSetHandle> {
        let ge = self.find_or_create_guid_entry(set.guid)?;
        if !self.data_sources.reference(data_source) {
            self.unreference_guid_entry(ge, deferred);
            return Err(WmiError::InvalidHandle);
        }
        set.guid_entry = Some(ge);
        set.data_source = Some(data_source);

        let handle = match self.instance_sets.allocate(set) {
            Ok(handle) => handle,
            Err(e) => {
                self.unreference_guid_entry(ge, deferred);
                self.unreference_data_source(data_source, deferred);
                return Err(e);
            }
        };
        if let Some(entry) = self.guid_entries.get_mut(ge) {
            entry.instance_sets.push(handle);
        }
        if let Some(ds) = self.data_sources.get_mut(data_source) {
            ds.instance_sets.push(handle);
        }
        Ok(handle)
    }

    /// Swap `old` for `new` in place on both its guid entry and data
    /// source lists. Enable state carries over; links and their references
    /// move to the new set.
    pub(crate) fn replace_instance_set(
        &mut self,
        old: InstanceSetHandle,
        mut new: InstanceSet,
        deferred: &mut Deferred,
    ) -> Result<InstanceSetHandle> {
        let current = self.instance_sets.get(old).ok_or(WmiError::InvalidHandle)?;
        let (ge, ds) = (current.guid_entry, current.data_source);
        new.flags |= current.flags
            & (InstanceSetFlags::ENABLE_EVENT
                | InstanceSetFlags::ENABLE_COLLECTION
                | InstanceSetFlags::TRACE_ENABLED);
        new.guid_entry = ge;
        new.data_source = ds;

        let handle = self.instance_sets.allocate(new)?;
        if let Some(current) = self.instance_sets.get_mut(old) {
            current.guid_entry = None;
            current.data_source = None;
        }
        if let Some(entry) = ge.and_then(|ge| self.guid_entries.get_mut(ge)) {
            for slot in entry.instance_sets.iter_mut().filter(|h| **h == old) {
                *slot = handle;
            }
        }
        if let Some(source) = ds.and_then(|ds| self.data_sources.get_mut(ds)) {
            for slot in source.instance_sets.iter_mut().filter(|h| **h == old) {
                *slot = handle;
            }
        }
        self.unreference_instance_set(old, deferred);
        Ok(handle)
    }

    /// Detach a set from its guid entry and data source and drop the
    /// data source's list reference on it
    pub(crate) fn unlink_instance_set(&mut self, handle: InstanceSetHandle, deferred: &mut Deferred) {
        let Some(set) = self.instance_sets.get_mut(handle) else {
            return;
        };
        let ge = set.guid_entry.take();
        let ds = set.data_source;

        if let Some(ge) = ge {
            if let Some(entry) = self.guid_entries.get_mut(ge) {
                entry.instance_sets.retain(|&h| h != handle);
            }
            self.unreference_guid_entry(ge, deferred);
        }
        let listed = ds
            .and_then(|ds| self.data_sources.get_mut(ds))
            .is_some_and(|source| {
                let before = source.instance_sets.len();
                source.instance_sets.retain(|&h| h != handle);
                source.instance_sets.len() != before
            });
        if listed {
            self.unreference_instance_set(handle, deferred);
        }
    }

    // ========================================================================
    // Reference dropping
    // ========================================================================

    pub(crate) fn unreference_guid_entry(&mut self, handle: GuidEntryHandle, deferred: &mut Deferred) {
        if let Some(value) = drop_reference(&mut self.guid_entries, handle) {
            self.guid_list.retain(|&h| h != handle);
            self.guid_entries.clear_flags(handle, SlotFlags::ON_INUSE_LIST);
            deferred.push(Retired::GuidEntry(handle, value));
        }
    }

    pub(crate) fn unreference_instance_set(
        &mut self,
        handle: InstanceSetHandle,
        deferred: &mut Deferred,
    ) {
        if let Some(value) = drop_reference(&mut self.instance_sets, handle) {
            deferred.push(Retired::InstanceSet(handle, value));
        }
    }

    pub(crate) fn unreference_data_source(&mut self, handle: DataSourceHandle, deferred: &mut Deferred) {
        if let Some(value) = drop_reference(&mut self.data_sources, handle) {
            self.data_source_list.retain(|&h| h != handle);
            self.data_sources.clear_flags(handle, SlotFlags::ON_INUSE_LIST);
            deferred.push(Retired::DataSource(handle, value));
        }
    }

    pub(crate) fn unreference_mof_resource(
        &mut self,
        handle: MofResourceHandle,
        deferred: &mut Deferred,
    ) {
        if let Some(value) = drop_reference(&mut self.mof_resources, handle) {
            self.mof_resource_list.retain(|&h| h != handle);
            self.mof_resources.clear_flags(handle, SlotFlags::ON_INUSE_LIST);
            deferred.push(Retired::MofResource(handle, value));
        }
    }

    pub(crate) fn unreference_object(&mut self, handle: GuidObjectHandle, deferred: &mut Deferred) {
        if let Some(value) = drop_reference(&mut self.objects, handle) {
            deferred.push(Retired::GuidObject(handle, value));
        }
    }

    fn release<T>(pool: &mut ChunkPool<T>, handle: Handle<T>) {
        if let Err(e) = pool.release(handle) {
            warn!("WMI: release of {:?} failed: {}", handle, e);
        }
    }
}

// ============================================================================
// Deferred cleanup
// ============================================================================

impl Wmi {
    /// Run cleanup for retired objects, then give their slots back.
    ///
    /// Must be called without the catalog lock held.
    pub(crate) fn finish(&self, deferred: Deferred) {
        for retired in deferred {
            self.retire(retired);
        }
    }

    fn retire(&self, retired: Retired) {
        match retired {
            Retired::GuidEntry(handle, entry) => {
                debug_assert!(entry.instance_sets.is_empty());
                trace!("WMI: guid entry {} released", entry.guid);
                Catalog::release(&mut self.catalog.lock().guid_entries, handle);
            }
            Retired::InstanceSet(handle, set) => {
                let mut deferred = Deferred::new();
                {
                    let mut cat = self.catalog.lock();
                    if let Some(ge) = set.guid_entry {
                        // Still linked: drop the link and its reference
                        if let Some(entry) = cat.guid_entries.get_mut(ge) {
                            entry.instance_sets.retain(|&h| h != handle);
                        }
                        cat.unreference_guid_entry(ge, &mut deferred);
                    }
                    if let Some(ds) = set.data_source {
                        cat.unreference_data_source(ds, &mut deferred);
                    }
                    Catalog::release(&mut cat.instance_sets, handle);
                }
                self.finish(deferred);
            }
            Retired::DataSource(handle, ds) => {
                let mut deferred = Deferred::new();
                {
                    let mut cat = self.catalog.lock();
                    for &mr in ds.mof_resources.iter() {
                        cat.unreference_mof_resource(mr, &mut deferred);
                    }
                    Catalog::release(&mut cat.data_sources, handle);
                }
                trace!("WMI: data source {} released", ds.provider_id);
                self.finish(deferred);
            }
            Retired::MofResource(handle, mof) => {
                self.mof_resource_removed(&mof);
                Catalog::release(&mut self.catalog.lock().mof_resources, handle);
            }
            Retired::GuidObject(handle, object) => {
                self.delete_object(handle, object);
                Catalog::release(&mut self.catalog.lock().objects, handle);
            }
        }
    }
}
