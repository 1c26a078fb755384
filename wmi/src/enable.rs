//! Event and Collection Enable
//!
//! Each guid entry counts consumers wanting events (`event_ref_count`) and
//! consumers wanting expensive data collection (`collect_ref_count`). The
//! first consumer enables every eligible instance set under the entry and
//! the last one disables them.
//!
//! # Two-phase transitions
//!
//! Providers are called without the catalog lock, so a transition runs in
//! two phases:
//!
//! ```text
//! begin_transition     lock: mark entry IN_PROGRESS, flip set flags,
//!                      collect provider requests
//! (deliver)            no lock: call providers
//! complete_transition  lock: compare flags with the ref count again;
//!                      anything changed meanwhile starts another round,
//!                      otherwise IN_PROGRESS is cleared
//! ```
//!
//! A count change made while another thread owns the transition only
//! adjusts the count; the owner picks it up in `complete_transition`, so a
//! disable racing an enable is never lost.

use crate::catalog::{
    Catalog, Deferred, GuidEntryFlags, GuidEntryHandle, GuidObjectHandle, InstanceSetHandle,
};
use crate::consumer::{EventPriority, ObjectKind};
use crate::error::{Result, WmiError};
use crate::guid::Guid;
use crate::instance::{InstanceSet, InstanceSetFlags};
use crate::stats::WmiStats;
use crate::transport::RequestKind;
use crate::wnode::{self, WnodeFlags, WnodeHeader, WNODE_HEADER_SIZE};
use crate::Wmi;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// Which ref count a consumer contributes to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EnableClass {
    Events,
    Collection,
}

impl EnableClass {
    pub(crate) fn for_kind(kind: ObjectKind) -> Option<Self> {
        match kind {
            ObjectKind::Events => Some(EnableClass::Events),
            ObjectKind::QuerySet => Some(EnableClass::Collection),
            ObjectKind::Request | ObjectKind::Reply => None,
        }
    }

    fn in_progress(self) -> GuidEntryFlags {
        match self {
            EnableClass::Events => GuidEntryFlags::NOTIFICATION_IN_PROGRESS,
            EnableClass::Collection => GuidEntryFlags::COLLECTION_IN_PROGRESS,
        }
    }

    fn set_flag(self) -> InstanceSetFlags {
        match self {
            EnableClass::Events => InstanceSetFlags::ENABLE_EVENT,
            EnableClass::Collection => InstanceSetFlags::ENABLE_COLLECTION,
        }
    }

    fn request(self, enable: bool) -> RequestKind {
        match (self, enable) {
            (EnableClass::Events, true) => RequestKind::EnableEvents,
            (EnableClass::Events, false) => RequestKind::DisableEvents,
            (EnableClass::Collection, true) => RequestKind::EnableCollection,
            (EnableClass::Collection, false) => RequestKind::DisableCollection,
        }
    }

    /// Whether `set` takes part in this class of fan-out
    fn eligible(self, set: &InstanceSet) -> bool {
        if set.flags.contains(InstanceSetFlags::TRACED) {
            return false;
        }
        match self {
            EnableClass::Events => true,
            EnableClass::Collection => {
                set.flags.contains(InstanceSetFlags::EXPENSIVE)
                    && !set.flags.contains(InstanceSetFlags::EVENT_ONLY)
            }
        }
    }
}

/// One enable or disable call owed to a provider
#[derive(Debug, Clone)]
pub(crate) struct ProviderRequest {
    pub provider_id: u32,
    pub guid: Guid,
    pub kind: RequestKind,
    /// Set for user-mode providers, which are reached through their
    /// request object
    pub request_object: Option<GuidObjectHandle>,
    pub user_mode: bool,
    /// Trace logger context carried by trace enables
    pub logger_context: u64,
}

impl Catalog {
    fn provider_request(&self, set: InstanceSetHandle, kind: RequestKind) -> Option<ProviderRequest> {
        let set = self.instance_sets.get(set)?;
        let ds = set.data_source.and_then(|h| self.data_sources.get(h));
        if ds.is_some_and(|ds| ds.is_internal()) {
            return None;
        }
        Some(ProviderRequest {
            provider_id: set.provider_id,
            guid: set.guid,
            kind,
            request_object: ds.and_then(|ds| ds.request_object),
            user_mode: ds.is_some_and(|ds| ds.is_user_mode()),
            logger_context: 0,
        })
    }

    /// Flip set flags toward the entry's current ref count. Returns the
    /// provider calls the flips require.
    fn collect_transitions(&mut self, ge: GuidEntryHandle, class: EnableClass) -> Vec<ProviderRequest> {
        let Some(entry) = self.guid_entries.get(ge) else {
            return Vec::new();
        };
        let wanted = match class {
            EnableClass::Events => entry.event_ref_count > 0,
            EnableClass::Collection => entry.collect_ref_count > 0,
        };
        let sets = entry.instance_sets.clone();
        let flag = class.set_flag();

        let mut requests = Vec::new();
        for h in sets {
            let Some(set) = self.instance_sets.get_mut(h) else {
                continue;
            };
            if !class.eligible(set) || set.flags.contains(flag) == wanted {
                continue;
            }
            set.flags.set(flag, wanted);
            if let Some(request) = self.provider_request(h, class.request(wanted)) {
                requests.push(request);
            }
        }
        requests
    }

    /// Phase one. Returns `None` when another thread owns the transition
    /// or the entry is gone.
    fn begin_transition(
        &mut self,
        ge: GuidEntryHandle,
        class: EnableClass,
    ) -> Option<Vec<ProviderRequest>> {
        let entry = self.guid_entries.get_mut(ge)?;
        if entry.flags.contains(class.in_progress()) {
            return None;
        }
        entry.flags |= class.in_progress();
        Some(self.collect_transitions(ge, class))
    }

    /// Phase two. Returns the next round of requests, or `None` once flags
    /// match the count and the entry is released.
    fn complete_transition(
        &mut self,
        ge: GuidEntryHandle,
        class: EnableClass,
    ) -> Option<Vec<ProviderRequest>> {
        let requests = self.collect_transitions(ge, class);
        if requests.is_empty() {
            if let Some(entry) = self.guid_entries.get_mut(ge) {
                entry.flags.remove(class.in_progress());
            }
            None
        } else {
            Some(requests)
        }
    }
}

impl Wmi {
    /// Deliver enable and disable calls. Failures are logged; the
    /// consumer-side accounting stands regardless.
    pub(crate) fn deliver_requests(&self, requests: Vec<ProviderRequest>) {
        for request in requests {
            match request.kind {
                RequestKind::EnableEvents | RequestKind::EnableCollection => {
                    WmiStats::bump(&self.stats.enable_requests)
                }
                _ => WmiStats::bump(&self.stats.disable_requests),
            }
            let result = if request.user_mode {
                self.send_to_request_object(&request)
            } else {
                self.send_to_kernel_provider(&request)
            };
            match result {
                Ok(()) => trace!(
                    "WMI: {:?} sent to provider {} for {}",
                    request.kind,
                    request.provider_id,
                    request.guid
                ),
                Err(e) => warn!(
                    "WMI: {:?} to provider {} for {} failed: {}",
                    request.kind, request.provider_id, request.guid, e
                ),
            }
        }
    }

    fn send_to_kernel_provider(&self, request: &ProviderRequest) -> Result<()> {
        let mut buffer = vec![0u8; WNODE_HEADER_SIZE];
        let mut header = WnodeHeader::new(request.guid, request.provider_id, WnodeFlags::empty());
        header.buffer_size = WNODE_HEADER_SIZE as u32;
        // The version and linkage words carry the logger context
        header.version = request.logger_context as u32;
        header.linkage = (request.logger_context >> 32) as u32;
        header.write(&mut buffer)?;
        self.transport
            .send_request(request.provider_id, request.kind, &request.guid, &mut buffer)
            .map(|_| ())
    }

    fn send_to_request_object(&self, request: &ProviderRequest) -> Result<()> {
        let object = request
            .request_object
            .ok_or(WmiError::ProviderNotFound(request.provider_id))?;
        let record = wnode::internal(request.guid, request.kind as u32, 0, &[])?;
        let delivery = self
            .catalog
            .lock()
            .write_wnode_to_object(object, &record, EventPriority::High);
        match delivery {
            Ok(crate::consumer::Delivery::Lost) => Err(WmiError::InsufficientResources),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run a transition to completion, calling providers between rounds
    fn drive_transition(&self, ge: GuidEntryHandle, class: EnableClass) {
        let Some(mut requests) = self.catalog.lock().begin_transition(ge, class) else {
            return;
        };
        loop {
            self.deliver_requests(requests);
            match self.catalog.lock().complete_transition(ge, class) {
                Some(next) => requests = next,
                None => break,
            }
        }
    }

    /// Count `object` as a consumer of `ge` and enable providers on the
    /// first.
    ///
    /// The object is marked in the same critical section that counts it,
    /// so a close racing the enable always withdraws the count.
    pub(crate) fn enable_collect_or_event(
        &self,
        ge: GuidEntryHandle,
        kind: ObjectKind,
        object: GuidObjectHandle,
    ) {
        let Some(class) = EnableClass::for_kind(kind) else {
            return;
        };
        {
            let mut cat = self.catalog.lock();
            if cat.guid_entries.get(ge).map_or(true, |entry| entry.is_internal()) {
                return;
            }
            match cat.objects.get_mut(object) {
                Some(object) if !object.is_closed() => object.enable_request_sent = true,
                _ => return,
            }
            if let Some(entry) = cat.guid_entries.get_mut(ge) {
                match class {
                    EnableClass::Events => entry.event_ref_count += 1,
                    EnableClass::Collection => entry.collect_ref_count += 1,
                }
            }
        }
        self.drive_transition(ge, class);
    }

    /// Withdraw a consumer's count and disable providers on the last
    pub(crate) fn disable_collect_or_event(&self, ge: GuidEntryHandle, kind: ObjectKind) {
        let Some(class) = EnableClass::for_kind(kind) else {
            return;
        };
        {
            let mut cat = self.catalog.lock();
            let Some(entry) = cat.guid_entries.get_mut(ge) else {
                return;
            };
            let count = match class {
                EnableClass::Events => &mut entry.event_ref_count,
                EnableClass::Collection => &mut entry.collect_ref_count,
            };
            if *count == 0 {
                warn!("WMI: {:?} disable on {} with no enables outstanding", class, entry.guid);
                return;
            }
            *count -= 1;
        }
        self.drive_transition(ge, class);
    }

    /// Bring a freshly linked set up to its entry's enable state
    pub(crate) fn enable_for_new_set(&self, set: InstanceSetHandle) {
        let (ge, trace_request) = {
            let mut cat = self.catalog.lock();
            let Some(s) = cat.instance_sets.get_mut(set) else {
                return;
            };
            s.flags.remove(InstanceSetFlags::NEWLY_REGISTERED);
            let traced = s.is_traced();
            let Some(ge) = s.guid_entry else {
                return;
            };
            let Some(entry) = cat.guid_entries.get(ge) else {
                return;
            };
            let trace_request = if traced && entry.flags.contains(GuidEntryFlags::TRACE_ENABLED) {
                Some(entry.logger_context)
            } else {
                None
            };
            (ge, trace_request)
        };

        match trace_request {
            Some(logger_context) => {
                let _trace = self.trace_lock.lock();
                let request = {
                    let mut cat = self.catalog.lock();
                    if let Some(s) = cat.instance_sets.get_mut(set) {
                        s.flags |= InstanceSetFlags::TRACE_ENABLED;
                    }
                    cat.provider_request(set, RequestKind::EnableEvents)
                };
                if let Some(mut request) = request {
                    request.logger_context = logger_context;
                    self.deliver_requests(vec![request]);
                }
            }
            None => {
                self.drive_transition(ge, EnableClass::Events);
                self.drive_transition(ge, EnableClass::Collection);
            }
        }
    }

    /// Disable a set that is about to be unlinked
    pub(crate) fn disable_for_removed_set(&self, set: InstanceSetHandle) {
        let requests = {
            let mut cat = self.catalog.lock();
            let Some(s) = cat.instance_sets.get_mut(set) else {
                return;
            };
            let mut kinds = Vec::new();
            if s.flags.contains(InstanceSetFlags::ENABLE_EVENT) {
                kinds.push(RequestKind::DisableEvents);
            }
            if s.flags.contains(InstanceSetFlags::ENABLE_COLLECTION) {
                kinds.push(RequestKind::DisableCollection);
            }
            s.flags.remove(InstanceSetFlags::ENABLE_EVENT | InstanceSetFlags::ENABLE_COLLECTION);
            kinds
                .into_iter()
                .filter_map(|kind| cat.provider_request(set, kind))
                .collect::<Vec<_>>()
        };
        if !requests.is_empty() {
            debug!("WMI: disabling {} request(s) for a removed instance set", requests.len());
            self.deliver_requests(requests);
        }
    }

    // ========================================================================
    // Tracing
    // ========================================================================

    /// Enable every traced set of `guid` for a trace logger
    pub fn enable_trace(&self, guid: Guid, logger_context: u64) -> Result<()> {
        self.set_trace(guid, Some(logger_context))
    }

    pub fn disable_trace(&self, guid: Guid) -> Result<()> {
        self.set_trace(guid, None)
    }

    fn set_trace(&self, guid: Guid, logger_context: Option<u64>) -> Result<()> {
        let _trace = self.trace_lock.lock();
        let mut deferred = Deferred::new();
        let requests = {
            let mut cat = self.catalog.lock();
            let ge = cat
                .find_guid_entry(&guid, false)
                .ok_or(WmiError::GuidNotFound(guid))?;
            let mut requests = Vec::new();
            if let Some(entry) = cat.guid_entries.get_mut(ge) {
                entry.flags.set(GuidEntryFlags::TRACE_ENABLED, logger_context.is_some());
                entry.logger_context = logger_context.unwrap_or(0);
                let sets = entry.instance_sets.clone();
                let enable = logger_context.is_some();
                for h in sets {
                    let flip = match cat.instance_sets.get_mut(h) {
                        Some(set)
                            if set.is_traced()
                                && set.flags.contains(InstanceSetFlags::TRACE_ENABLED) != enable =>
                        {
                            set.flags.set(InstanceSetFlags::TRACE_ENABLED, enable);
                            true
                        }
                        _ => false,
                    };
                    let kind = if enable {
                        RequestKind::EnableEvents
                    } else {
                        RequestKind::DisableEvents
                    };
                    if let Some(mut request) = flip.then(|| cat.provider_request(h, kind)).flatten() {
                        request.logger_context = logger_context.unwrap_or(0);
                        requests.push(request);
                    }
                }
            }
            cat.unreference_guid_entry(ge, &mut deferred);
            requests
        };
        self.finish(deferred);
        self.deliver_requests(requests);
        Ok(())
    }

    /// Logger context recorded by the last trace enable of `guid`
    pub fn logger_context(&self, guid: Guid) -> Result<u64> {
        let mut deferred = Deferred::new();
        let context = {
            let mut cat = self.catalog.lock();
            let ge = cat
                .find_guid_entry(&guid, false)
                .ok_or(WmiError::GuidNotFound(guid))?;
            let context = cat.guid_entries.get(ge).map(|e| e.logger_context).unwrap_or(0);
            cat.unreference_guid_entry(ge, &mut deferred);
            context
        };
        self.finish(deferred);
        Ok(context)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guid::INSTANCE_INFO_GUID;
    use crate::instance::InstanceNaming;
    use crate::reginfo::{RegFlags, RegGuidSpec, RegInfoBuilder};
    use crate::testing::{drain, wmi_with, RecordingTransport};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicBool, Ordering};

    const G: Guid = Guid::new(0xe1, 0, 0, [1; 8]);
    const H: Guid = Guid::new(0xe2, 0, 0, [2; 8]);
    const T: Guid = Guid::new(0xe3, 0, 0, [3; 8]);

    fn block(specs: Vec<RegGuidSpec>) -> Vec<u8> {
        specs
            .into_iter()
            .fold(RegInfoBuilder::new(), |b, spec| b.guid(spec))
            .build()
            .unwrap()
    }

    fn named(guid: Guid) -> RegGuidSpec {
        RegGuidSpec::new(guid, 0).with_names(["a"])
    }

    fn traced(guid: Guid) -> RegGuidSpec {
        RegGuidSpec::new(guid, 1).with_flags(RegFlags::TRACED_GUID | RegFlags::TRACE_CONTROL_GUID)
    }

    fn events_enabled(wmi: &Wmi, guid: Guid) -> bool {
        wmi.enumerate_guids()
            .iter()
            .any(|info| info.guid == guid && info.events_enabled)
    }

    fn set(flags: InstanceSetFlags) -> InstanceSet {
        InstanceSet {
            guid: Guid::zero(),
            provider_id: 1,
            count: 1,
            flags,
            naming: InstanceNaming::Dynamic,
            data_source: None,
            guid_entry: None,
        }
    }

    #[test]
    fn test_eligibility() {
        let plain = set(InstanceSetFlags::empty());
        let expensive = set(InstanceSetFlags::EXPENSIVE);
        let traced = set(InstanceSetFlags::TRACED | InstanceSetFlags::EXPENSIVE);
        let event_only = set(InstanceSetFlags::EVENT_ONLY | InstanceSetFlags::EXPENSIVE);

        assert!(EnableClass::Events.eligible(&plain));
        assert!(EnableClass::Events.eligible(&event_only));
        assert!(!EnableClass::Events.eligible(&traced));

        assert!(!EnableClass::Collection.eligible(&plain));
        assert!(EnableClass::Collection.eligible(&expensive));
        assert!(!EnableClass::Collection.eligible(&traced));
        assert!(!EnableClass::Collection.eligible(&event_only));
    }

    #[test]
    fn test_request_kinds() {
        assert_eq!(EnableClass::Events.request(true), RequestKind::EnableEvents);
        assert_eq!(EnableClass::Collection.request(false), RequestKind::DisableCollection);
        assert_eq!(EnableClass::for_kind(ObjectKind::Reply), None);
    }

    #[test]
    fn test_first_and_last_consumer_toggle_events() {
        let transport = RecordingTransport::new();
        transport.set_reginfo(2, block(vec![named(G)]));
        let wmi = wmi_with(&transport);
        wmi.register_provider(2).unwrap();

        let first = wmi.open_events(G).unwrap();
        let second = wmi.open_events(G).unwrap();
        assert_eq!(transport.count_for(2, RequestKind::EnableEvents, G), 1);
        assert!(events_enabled(&wmi, G));

        wmi.close(first).unwrap();
        assert_eq!(transport.count(RequestKind::DisableEvents), 0);
        wmi.close(second).unwrap();
        assert_eq!(transport.count_for(2, RequestKind::DisableEvents, G), 1);
        assert!(!events_enabled(&wmi, G));

        let stats = wmi.stats();
        assert_eq!(stats.enable_requests, 1);
        assert_eq!(stats.disable_requests, 1);
    }

    #[test]
    fn test_collection_enabled_only_for_expensive_sets() {
        let transport = RecordingTransport::new();
        transport.set_reginfo(2, block(vec![named(G).with_flags(RegFlags::EXPENSIVE), named(H)]));
        let wmi = wmi_with(&transport);
        wmi.register_provider(2).unwrap();

        let expensive = wmi.open_query_set(G).unwrap();
        let cheap = wmi.open_query_set(H).unwrap();
        assert_eq!(transport.count_for(2, RequestKind::EnableCollection, G), 1);
        assert_eq!(transport.count_for(2, RequestKind::EnableCollection, H), 0);

        wmi.close(expensive).unwrap();
        wmi.close(cheap).unwrap();
        assert_eq!(
            transport.enable_sequence(),
            vec![RequestKind::EnableCollection, RequestKind::DisableCollection]
        );
    }

    #[test]
    fn test_consumer_waiting_before_registration() {
        let transport = RecordingTransport::new();
        transport.set_reginfo(2, block(vec![named(G)]));
        let wmi = wmi_with(&transport);

        let object = wmi.open_events(G).unwrap();
        assert!(transport.enable_sequence().is_empty());
        wmi.register_provider(2).unwrap();
        assert_eq!(transport.count_for(2, RequestKind::EnableEvents, G), 1);

        // A departing provider is disabled; closing afterwards sends nothing
        wmi.deregister_provider(2).unwrap();
        assert_eq!(transport.count_for(2, RequestKind::DisableEvents, G), 1);
        wmi.close(object).unwrap();
        assert_eq!(transport.count(RequestKind::DisableEvents), 1);
    }

    #[test]
    fn test_open_during_disable_reenables() {
        let transport = RecordingTransport::new();
        transport.set_reginfo(2, block(vec![named(G)]));
        let wmi = wmi_with(&transport);
        wmi.register_provider(2).unwrap();
        let first = wmi.open_events(G).unwrap();

        let weak = Arc::downgrade(&wmi);
        let reopened = Arc::new(spin::Mutex::new(None));
        let fired = AtomicBool::new(false);
        let slot = reopened.clone();
        transport.on_request(move |_, kind, _| {
            if kind == RequestKind::DisableEvents && !fired.swap(true, Ordering::SeqCst) {
                if let Some(wmi) = weak.upgrade() {
                    let object = wmi.open_events(G).unwrap();
                    *slot.lock() = Some(object);
                }
            }
        });

        wmi.close(first).unwrap();
        assert_eq!(
            transport.enable_sequence(),
            vec![
                RequestKind::EnableEvents,
                RequestKind::DisableEvents,
                RequestKind::EnableEvents,
            ]
        );
        assert!(events_enabled(&wmi, G));

        let second = reopened.lock().take().unwrap();
        wmi.close(second).unwrap();
        assert_eq!(transport.enable_sequence().last(), Some(&RequestKind::DisableEvents));
        assert!(!events_enabled(&wmi, G));
    }

    #[test]
    fn test_internal_guids_never_enabled() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let object = wmi.open_events(INSTANCE_INFO_GUID).unwrap();
        let query = wmi.open_query_set(INSTANCE_INFO_GUID).unwrap();
        wmi.close(object).unwrap();
        wmi.close(query).unwrap();
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_trace_enable_and_disable() {
        let transport = RecordingTransport::new();
        transport.set_reginfo(3, block(vec![traced(T)]));
        let wmi = wmi_with(&transport);
        wmi.register_provider(3).unwrap();

        // Traced guids are controlled by loggers, not consumers
        let object = wmi.open_events(T).unwrap();
        assert!(transport.enable_sequence().is_empty());
        wmi.close(object).unwrap();

        wmi.enable_trace(T, 0x1_0000_0002).unwrap();
        assert_eq!(transport.count_for(3, RequestKind::EnableEvents, T), 1);
        assert_eq!(wmi.logger_context(T), Ok(0x1_0000_0002));
        let header = WnodeHeader::read(&transport.last_enable_buffer().unwrap()).unwrap();
        assert_eq!(header.version, 2);
        assert_eq!(header.linkage, 1);

        wmi.enable_trace(T, 0x1_0000_0002).unwrap();
        assert_eq!(transport.count(RequestKind::EnableEvents), 1);

        wmi.disable_trace(T).unwrap();
        assert_eq!(transport.count_for(3, RequestKind::DisableEvents, T), 1);
        assert_eq!(wmi.logger_context(T), Ok(0));
        assert_eq!(wmi.enable_trace(H, 1), Err(WmiError::GuidNotFound(H)));
    }

    #[test]
    fn test_trace_enabled_before_user_registration() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let _watch = wmi.open_events(T).unwrap();
        wmi.enable_trace(T, 7).unwrap();

        let registration = wmi.register_user_guids(&block(vec![traced(T)]), 0).unwrap();
        assert_eq!(registration.logger_context, 7);
        let records = drain(&wmi, &[registration.request_object]);
        assert_eq!(records.len(), 1);
        let header = WnodeHeader::read(&records[0]).unwrap();
        assert_eq!(header.guid, T);
        assert_eq!(header.provider_id, RequestKind::EnableEvents as u32);
        assert!(header.wnode_flags().contains(WnodeFlags::INTERNAL));
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_user_provider_enabled_through_request_object() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let registration = wmi.register_user_guids(&block(vec![named(G)]), 0).unwrap();

        let object = wmi.open_events(G).unwrap();
        wmi.close(object).unwrap();
        let kinds: Vec<u32> = drain(&wmi, &[registration.request_object])
            .iter()
            .map(|r| WnodeHeader::read(r).unwrap().provider_id)
            .collect();
        assert_eq!(
            kinds,
            vec![RequestKind::EnableEvents as u32, RequestKind::DisableEvents as u32]
        );
        assert!(transport.requests().is_empty());
    }
}
