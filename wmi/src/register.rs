//! Provider Registration
//!
//! Registration turns a provider's WMIREGINFO chain into data sources and
//! instance sets linked under the catalog.
//!
//! ```text
//! register_provider(pid)
//!   ├─ reg entry: RegistrationInProgress
//!   ├─ fetch WMIREGINFO            (transport, no lock, retried on
//!   │                               BufferTooSmall)
//!   ├─ per block: add_data_source  (lock: build + link each guid)
//!   │    └─ after unlock: MOF notifications, enables for new sets,
//!   │       registration Add notification
//!   └─ reg entry: Registered       (or removed on failure)
//! ```
//!
//! A record that fails to build is logged and skipped; a block succeeds if
//! any of its records was linked, and a chain succeeds if any block did.
//!
//! # Work queue
//!
//! Kernel providers usually register from contexts that must not wait for
//! the transport, so [`Wmi::queue_registration`] hands the work to a
//! single drain task run by the embedding's [`Executor`]. A pending count
//! starts at one; that extra count is a latch released by [`Wmi::start`],
//! so work queued during early boot waits until the core is ready.

use crate::catalog::{Catalog, Deferred, DataSourceHandle, GuidObjectHandle, InstanceSetHandle};
use crate::datasource::{DataSource, DataSourceFlags, MofLocation, MofResource, ProviderMode, RegEntry, RegState};
use crate::error::{Result, WmiError};
use crate::guid::{Guid, BINARY_MOF_GUID};
use crate::instance::{build_instance_set, InstanceSetFlags};
use crate::notify::RegistrationOp;
use crate::reginfo::{RegFlags, RegInfoBlock, RegInfoChain, RegNaming, WmiRegGuid};
use crate::stats::WmiStats;
use crate::transport::{AccessRights, RequestKind};
use crate::Wmi;
use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;
use log::{debug, info, trace, warn};

/// Provider ids handed to user-mode registrations start here
pub const FIRST_USER_PROVIDER_ID: u32 = 0x8000_0000;

/// Provider id of the core's own data source
pub const INTERNAL_PROVIDER_ID: u32 = 0;

/// Queued registration work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationWork {
    Register(u32),
    Update(u32),
    Deregister(u32),
}

/// Runs deferred jobs, a system worker thread in a kernel
pub trait Executor: Send + Sync {
    fn spawn(&self, job: Box<dyn FnOnce() + Send + 'static>);
}

/// Runs each job on the calling thread
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn spawn(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        job()
    }
}

/// Result of a user-mode registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRegistration {
    /// Object the provider receives its requests on
    pub request_object: GuidObjectHandle,
    pub provider_id: u32,
    /// Context of a trace logger already enabled for the control guid
    pub logger_context: u64,
}

/// Who a reginfo chain is being registered for
#[derive(Debug, Clone, Copy)]
struct Registrant {
    provider_id: u32,
    mode: ProviderMode,
    request_object: Option<GuidObjectHandle>,
}

/// Sets to announce once the catalog lock is dropped
#[derive(Default)]
struct Changes {
    added: Vec<(InstanceSetHandle, Guid)>,
    modified: Vec<(InstanceSetHandle, Guid)>,
    removed: Vec<(InstanceSetHandle, Guid)>,
    new_mof: Option<MofResource>,
}

fn decode_records(block: &RegInfoBlock<'_>) -> Result<Vec<(WmiRegGuid, Result<RegNaming>)>> {
    let mut records = Vec::new();
    records
        .try_reserve(block.guid_count())
        .map_err(|_| WmiError::InsufficientResources)?;
    for reg in block.reg_guids() {
        let reg = reg?;
        let naming = block.naming(&reg);
        records.push((reg, naming));
    }
    Ok(records)
}

/// Traced guids without a control guid are owned by the trace logger
fn skip_record(flags: RegFlags) -> bool {
    flags.contains(RegFlags::TRACED_GUID) && !flags.contains(RegFlags::TRACE_CONTROL_GUID)
}

impl Catalog {
    /// Reference the block's MOF resource from `ds`. Returns the resource
    /// if it is new to the system.
    fn attach_mof_resource(
        &mut self,
        ds: DataSourceHandle,
        image_path: Option<&str>,
        resource_name: Option<&str>,
        mode: ProviderMode,
        deferred: &mut Deferred,
    ) -> Result<Option<MofResource>> {
        let (Some(path), Some(name)) = (image_path, resource_name) else {
            return Ok(None);
        };
        if path.is_empty() || name.is_empty() {
            return Ok(None);
        }
        let location = match mode {
            ProviderMode::User => MofLocation::ImagePath,
            ProviderMode::Kernel | ProviderMode::Internal => MofLocation::RegistryPath,
        };
        let (mr, new) = self.add_mof_resource(path, name, location)?;
        let listed = match self.data_sources.get_mut(ds) {
            Some(source) if !source.mof_resources.contains(&mr) => {
                source.mof_resources.push(mr);
                true
            }
            _ => false,
        };
        if !listed {
            self.unreference_mof_resource(mr, deferred);
        }
        Ok(if new { self.mof_resources.get(mr).cloned() } else { None })
    }
}

impl Wmi {
    // ========================================================================
    // Kernel-mode providers
    // ========================================================================

    /// Register a kernel-mode provider, fetching its WMIREGINFO through
    /// the transport
    pub fn register_provider(&self, provider_id: u32) -> Result<()> {
        self.begin_registration(provider_id, ProviderMode::Kernel)?;
        let registrant = Registrant {
            provider_id,
            mode: ProviderMode::Kernel,
            request_object: None,
        };
        let result = self
            .fetch_reginfo(provider_id)
            .and_then(|blob| self.process_reginfo(&registrant, &blob));
        self.end_registration(provider_id, result)
    }

    /// Re-read a registered provider's WMIREGINFO and apply the changes
    pub fn update_provider(&self, provider_id: u32) -> Result<()> {
        {
            let cat = self.catalog.lock();
            match cat.reg_entries.get(&provider_id).map(|e| e.state) {
                Some(RegState::Registered) => {}
                Some(RegState::RegistrationInProgress) => {
                    return Err(WmiError::RegistrationInProgress(provider_id))
                }
                _ => return Err(WmiError::ProviderNotFound(provider_id)),
            }
        }
        let blob = self.fetch_reginfo(provider_id)?;
        let mut updated = false;
        let mut first_error = None;
        for block in RegInfoChain::new(&blob) {
            match block.and_then(|b| self.update_data_source(provider_id, &b)) {
                Ok(()) => updated = true,
                Err(e) => {
                    warn!("WMI: update of provider {} failed: {}", provider_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if updated {
            WmiStats::bump(&self.stats.updates);
            Ok(())
        } else {
            Err(first_error.unwrap_or(WmiError::InvalidParameter("empty reginfo")))
        }
    }

    /// Remove a provider and everything it registered
    pub fn deregister_provider(&self, provider_id: u32) -> Result<()> {
        self.remove_data_source(provider_id)
    }

    /// Register the core's own guids
    pub(crate) fn register_internal(&self, reginfo: &[u8]) -> Result<()> {
        self.begin_registration(INTERNAL_PROVIDER_ID, ProviderMode::Internal)?;
        let registrant = Registrant {
            provider_id: INTERNAL_PROVIDER_ID,
            mode: ProviderMode::Internal,
            request_object: None,
        };
        let result = self.process_reginfo(&registrant, reginfo);
        self.end_registration(INTERNAL_PROVIDER_ID, result)
    }

    // ========================================================================
    // User-mode providers
    // ========================================================================

    /// Register a user-mode provider from a WMIREGINFO chain it supplied.
    ///
    /// The provider receives enable, disable and mailbox requests on the
    /// returned request object; closing it deregisters the provider.
    pub fn register_user_guids(&self, reginfo: &[u8], cookie: u64) -> Result<UserRegistration> {
        let control_guid = RegInfoBlock::parse(reginfo)?
            .reg_guid(0)
            .map_or(Guid::zero(), |reg| reg.guid);
        self.access
            .check_access(&control_guid, AccessRights::REGISTER_GUIDS)?;

        let provider_id = self.next_user_provider_id.fetch_add(1, Ordering::Relaxed);
        let request_object = self.create_request_object(control_guid, provider_id, cookie)?;
        let registrant = Registrant {
            provider_id,
            mode: ProviderMode::User,
            request_object: Some(request_object),
        };

        let result = self
            .begin_registration(provider_id, ProviderMode::User)
            .and_then(|()| {
                let result = self.process_reginfo(&registrant, reginfo);
                self.end_registration(provider_id, result)
            });
        if let Err(e) = result {
            if let Err(close_error) = self.close(request_object) {
                warn!(
                    "WMI: request object of failed provider {:#x} not closed: {}",
                    provider_id, close_error
                );
            }
            return Err(e);
        }

        let logger_context = self.logger_context(control_guid).unwrap_or(0);
        info!(
            "WMI: user-mode provider {:#x} registered, control guid {}",
            provider_id, control_guid
        );
        Ok(UserRegistration {
            request_object,
            provider_id,
            logger_context,
        })
    }

    // ========================================================================
    // Registration state
    // ========================================================================

    fn begin_registration(&self, provider_id: u32, mode: ProviderMode) -> Result<()> {
        let mut cat = self.catalog.lock();
        match cat.reg_entries.get(&provider_id).map(|e| e.state) {
            Some(RegState::RegistrationInProgress) => Err(WmiError::RegistrationInProgress(provider_id)),
            Some(_) => Err(WmiError::AlreadyRegistered(provider_id)),
            None => {
                cat.reg_entries.insert(provider_id, RegEntry::new(provider_id, mode));
                Ok(())
            }
        }
    }

    fn end_registration(&self, provider_id: u32, result: Result<()>) -> Result<()> {
        let mut cat = self.catalog.lock();
        match result {
            Ok(()) => {
                if let Some(entry) = cat.reg_entries.get_mut(&provider_id) {
                    entry.state = RegState::Registered;
                }
                drop(cat);
                WmiStats::bump(&self.stats.registrations);
                debug!("WMI: provider {} registered", provider_id);
                Ok(())
            }
            Err(e) => {
                cat.reg_entries.remove(&provider_id);
                drop(cat);
                warn!("WMI: registration of provider {} failed: {}", provider_id, e);
                Err(e)
            }
        }
    }

    /// Fetch a provider's WMIREGINFO, growing the buffer as asked
    fn fetch_reginfo(&self, provider_id: u32) -> Result<Vec<u8>> {
        let mut size = self.config.initial_reginfo_size;
        loop {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(size)
                .map_err(|_| WmiError::InsufficientResources)?;
            buffer.resize(size, 0);
            match self
                .transport
                .send_request(provider_id, RequestKind::RegInfo, &Guid::zero(), &mut buffer)
            {
                Ok(used) => {
                    buffer.truncate(used);
                    return Ok(buffer);
                }
                Err(WmiError::BufferTooSmall { required }) if required > size => {
                    trace!("WMI: provider {} reginfo needs {} bytes", provider_id, required);
                    size = required;
                }
                Err(WmiError::BufferTooSmall { .. }) => {
                    return Err(WmiError::InvalidParameter("provider reported a bad reginfo size"))
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn process_reginfo(&self, registrant: &Registrant, blob: &[u8]) -> Result<()> {
        let mut added = false;
        let mut first_error = None;
        for block in RegInfoChain::new(blob) {
            match block.and_then(|b| self.add_data_source(registrant, &b)) {
                Ok(()) => added = true,
                Err(e) => {
                    warn!("WMI: reginfo block from provider {} rejected: {}", registrant.provider_id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if added {
            Ok(())
        } else {
            Err(first_error.unwrap_or(WmiError::InvalidParameter("empty reginfo")))
        }
    }

    // ========================================================================
    // Add
    // ========================================================================

    fn add_data_source(&self, registrant: &Registrant, block: &RegInfoBlock<'_>) -> Result<()> {
        let registry_path = block.registry_path()?;
        let mof_name = block.mof_resource_name()?;
        let records = decode_records(block)?;
        let provider_id = registrant.provider_id;
        let open = records
            .iter()
            .any(|(reg, _)| reg.reg_flags().contains(RegFlags::ALLOW_ALL_ACCESS));

        let mut deferred = Deferred::new();
        let mut changes = Changes::default();
        let result = {
            let mut cat = self.catalog.lock();
            let existing = cat
                .reg_entries
                .get(&provider_id)
                .ok_or(WmiError::ProviderNotFound(provider_id))?
                .data_source;
            let (ds, new) = match existing {
                Some(ds) => (ds, false),
                None => {
                    let mut source = DataSource::new(provider_id, registrant.mode);
                    source.registry_path = registry_path.clone();
                    source.request_object = registrant.request_object;
                    (cat.data_sources.allocate(source)?, true)
                }
            };
            if open {
                if let Some(source) = cat.data_sources.get_mut(ds) {
                    source.flags |= DataSourceFlags::ALLOW_ALL_ACCESS;
                }
            }

            let mut first_error = None;
            for (reg, naming) in records {
                let flags = reg.reg_flags();
                if flags.contains(RegFlags::REMOVE_GUID) || skip_record(flags) {
                    continue;
                }
                let linked = naming.and_then(|naming| {
                    if cat.set_in_source(ds, &reg.guid).is_some() {
                        return Err(WmiError::InvalidParameter("guid registered twice"));
                    }
                    let ge = cat.find_guid_entry(&reg.guid, false);
                    let built = build_instance_set(
                        &reg,
                        naming,
                        provider_id,
                        cat.peers(ge, None),
                        self.config.max_name_suffix_len,
                    );
                    if let Some(ge) = ge {
                        cat.unreference_guid_entry(ge, &mut deferred);
                    }
                    cat.link_instance_set(built?, ds, &mut deferred)
                });
                match linked {
                    Ok(h) => changes.added.push((h, reg.guid)),
                    Err(e) => {
                        warn!("WMI: provider {} guid {} not registered: {}", provider_id, reg.guid, e);
                        WmiStats::bump(&self.stats.invalid_records);
                        first_error.get_or_insert(e);
                    }
                }
            }

            match first_error {
                Some(e) if new && changes.added.is_empty() => {
                    cat.unreference_data_source(ds, &mut deferred);
                    Err(e)
                }
                _ => {
                    if new {
                        cat.data_source_list.push(ds);
                        if let Some(entry) = cat.reg_entries.get_mut(&provider_id) {
                            entry.data_source = Some(ds);
                        }
                    }
                    match cat.attach_mof_resource(
                        ds,
                        registry_path.as_deref(),
                        mof_name.as_deref(),
                        registrant.mode,
                        &mut deferred,
                    ) {
                        Ok(mof) => changes.new_mof = mof,
                        Err(e) => warn!("WMI: MOF resource of provider {} not added: {}", provider_id, e),
                    }
                    Ok(())
                }
            }
        };
        self.finish(deferred);
        result?;
        self.announce(changes);
        Ok(())
    }

    // ========================================================================
    // Update
    // ========================================================================

    fn update_data_source(&self, provider_id: u32, block: &RegInfoBlock<'_>) -> Result<()> {
        let records = decode_records(block)?;
        let mof_name = block.mof_resource_name()?;
        let registry_path = block.registry_path()?;

        let mut deferred = Deferred::new();
        let mut changes = Changes::default();
        {
            let mut cat = self.catalog.lock();
            let ds = cat
                .data_source_for(provider_id)
                .ok_or(WmiError::ProviderNotFound(provider_id))?;
            let mode = cat
                .reg_entries
                .get(&provider_id)
                .map_or(ProviderMode::Kernel, |e| e.mode);

            for (reg, naming) in records {
                let flags = reg.reg_flags();
                let current = cat.set_in_source(ds, &reg.guid);
                if flags.contains(RegFlags::REMOVE_GUID) {
                    if let Some(h) = current {
                        changes.removed.push((h, reg.guid));
                    }
                    continue;
                }
                if skip_record(flags) {
                    continue;
                }

                let result = naming.and_then(|naming| match current {
                    Some(old) => {
                        let ge = cat.instance_sets.get(old).and_then(|s| s.guid_entry);
                        let mut rebuilt = build_instance_set(
                            &reg,
                            naming,
                            provider_id,
                            cat.peers(ge, Some(old)),
                            self.config.max_name_suffix_len,
                        )?;
                        rebuilt.flags.remove(InstanceSetFlags::NEWLY_REGISTERED);
                        if cat.instance_sets.get(old).is_some_and(|s| s.is_equal(&rebuilt)) {
                            return Ok(());
                        }
                        let h = cat.replace_instance_set(old, rebuilt, &mut deferred)?;
                        changes.modified.push((h, reg.guid));
                        Ok(())
                    }
                    None => {
                        let ge = cat.find_guid_entry(&reg.guid, false);
                        let built = build_instance_set(
                            &reg,
                            naming,
                            provider_id,
                            cat.peers(ge, None),
                            self.config.max_name_suffix_len,
                        );
                        if let Some(ge) = ge {
                            cat.unreference_guid_entry(ge, &mut deferred);
                        }
                        let h = cat.link_instance_set(built?, ds, &mut deferred)?;
                        changes.added.push((h, reg.guid));
                        Ok(())
                    }
                });
                if let Err(e) = result {
                    warn!("WMI: provider {} update of {} skipped: {}", provider_id, reg.guid, e);
                    WmiStats::bump(&self.stats.invalid_records);
                }
            }

            match cat.attach_mof_resource(
                ds,
                registry_path.as_deref(),
                mof_name.as_deref(),
                mode,
                &mut deferred,
            ) {
                Ok(mof) => changes.new_mof = mof,
                Err(e) => warn!("WMI: MOF resource of provider {} not added: {}", provider_id, e),
            }
        }
        self.finish(deferred);
        self.announce(changes);
        Ok(())
    }

    /// Notifications and enable fan-out for a batch of set changes
    fn announce(&self, changes: Changes) {
        if !changes.removed.is_empty() {
            for &(h, guid) in changes.removed.iter() {
                if guid == BINARY_MOF_GUID {
                    self.binary_mof_notification(h, false);
                }
                self.disable_for_removed_set(h);
                let mut deferred = Deferred::new();
                self.catalog.lock().unlink_instance_set(h, &mut deferred);
                self.finish(deferred);
            }
            let guids: Vec<Guid> = changes.removed.iter().map(|&(_, g)| g).collect();
            self.send_guid_update(RegistrationOp::Delete, &guids);
        }

        if !changes.modified.is_empty() {
            for &(h, guid) in changes.modified.iter() {
                if guid == BINARY_MOF_GUID {
                    self.binary_mof_notification(h, true);
                }
            }
            let guids: Vec<Guid> = changes.modified.iter().map(|&(_, g)| g).collect();
            self.send_guid_update(RegistrationOp::Update, &guids);
        }

        if let Some(mof) = changes.new_mof.as_ref() {
            self.mof_resource_added(mof);
        }

        if !changes.added.is_empty() {
            for &(h, guid) in changes.added.iter() {
                if guid == BINARY_MOF_GUID {
                    self.binary_mof_notification(h, true);
                }
                self.enable_for_new_set(h);
            }
            let guids: Vec<Guid> = changes.added.iter().map(|&(_, g)| g).collect();
            self.send_guid_update(RegistrationOp::Add, &guids);
        }
    }

    // ========================================================================
    // Remove
    // ========================================================================

    fn remove_data_source(&self, provider_id: u32) -> Result<()> {
        let (ds, sets) = {
            let mut cat = self.catalog.lock();
            let entry = cat
                .reg_entries
                .get_mut(&provider_id)
                .ok_or(WmiError::ProviderNotFound(provider_id))?;
            match entry.state {
                RegState::RegistrationInProgress => {
                    return Err(WmiError::RegistrationInProgress(provider_id))
                }
                RegState::RundownInProgress => return Err(WmiError::ProviderNotFound(provider_id)),
                RegState::Registered => entry.state = RegState::RundownInProgress,
            }
            let ds = entry.data_source;
            let mut sets = Vec::new();
            if let Some(source) = ds.and_then(|h| cat.data_sources.get_mut(h)) {
                source.flags |= DataSourceFlags::RUNDOWN;
                sets = source.instance_sets.clone();
            }
            let sets: Vec<(InstanceSetHandle, Guid)> = sets
                .into_iter()
                .filter_map(|h| cat.instance_sets.get(h).map(|s| (h, s.guid)))
                .collect();
            (ds, sets)
        };

        for &(h, guid) in sets.iter() {
            if guid == BINARY_MOF_GUID {
                self.binary_mof_notification(h, false);
            }
            self.disable_for_removed_set(h);
        }

        let mut deferred = Deferred::new();
        {
            let mut cat = self.catalog.lock();
            for &(h, _) in sets.iter() {
                cat.unlink_instance_set(h, &mut deferred);
            }
            if let Some(ds) = ds {
                cat.data_source_list.retain(|&h| h != ds);
                cat.unreference_data_source(ds, &mut deferred);
            }
            cat.reg_entries.remove(&provider_id);
        }
        self.finish(deferred);

        let guids: Vec<Guid> = sets.iter().map(|&(_, g)| g).collect();
        self.send_guid_update(RegistrationOp::Delete, &guids);
        WmiStats::bump(&self.stats.deregistrations);
        debug!("WMI: provider {} deregistered", provider_id);
        Ok(())
    }

    // ========================================================================
    // Work queue
    // ========================================================================

    /// Queue registration work for the drain task
    pub fn queue_registration(self: &Arc<Self>, work: RegistrationWork) {
        self.reg_queue.lock().push_back(work);
        if self.reg_work_count.fetch_add(1, Ordering::AcqRel) + 1 == 1 {
            self.kick_registration_worker();
        }
    }

    /// Release the startup latch. Work queued earlier starts draining.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("WMI: started");
        if self.reg_work_count.fetch_sub(1, Ordering::AcqRel) - 1 > 0 {
            self.kick_registration_worker();
        }
    }

    fn kick_registration_worker(self: &Arc<Self>) {
        let wmi = Arc::clone(self);
        self.executor
            .spawn(Box::new(move || wmi.run_registration_worker()));
    }

    fn run_registration_worker(&self) {
        loop {
            let work = self.reg_queue.lock().pop_front();
            if let Some(work) = work {
                self.process_registration_work(work);
            }
            if self.reg_work_count.fetch_sub(1, Ordering::AcqRel) == 1 {
                break;
            }
        }
    }

    fn process_registration_work(&self, work: RegistrationWork) {
        let result = match work {
            RegistrationWork::Register(pid) => self.register_provider(pid),
            RegistrationWork::Update(pid) => self.update_provider(pid),
            RegistrationWork::Deregister(pid) => self.deregister_provider(pid),
        };
        if let Err(e) = result {
            warn!("WMI: {:?} failed: {}", work, e);
        }
    }

    /// Registry path a provider registered with
    pub fn registry_path(&self, provider_id: u32) -> Option<String> {
        let cat = self.catalog.lock();
        let ds = cat.data_source_for(provider_id)?;
        cat.data_sources.get(ds)?.registry_path.clone()
    }
}
