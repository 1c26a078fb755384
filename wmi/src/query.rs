//! Data Queries
//!
//! Query, set and method calls address a guid, and for single instance
//! operations an instance name. The name resolves to one instance set and
//! an index within it; the request goes to that set's provider.
//!
//! An all-data query visits every queryable set of the guid and chains the
//! per-provider records. If any provider reports that the buffer is too
//! small the call fails with the total size needed, so a retry with that
//! size can succeed in one step.
//!
//! Guids owned by the core's internal data source are answered locally.

use crate::catalog::{Deferred, GuidEntryHandle};
use crate::error::{Result, WmiError};
use crate::guid::{Guid, ENUMERATE_GUIDS_GUID, GUID_SIZE};
use crate::instance::{InstanceSet, InstanceSetFlags};
use crate::register::INTERNAL_PROVIDER_ID;
use crate::transport::{AccessRights, RequestKind};
use crate::wnode::{self, align8, WnodeFlags, WnodeHeader, WNODE_HEADER_SIZE};
use crate::Wmi;
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use log::{debug, trace, warn};

/// Summary of one registered guid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidInfo {
    pub guid: Guid,
    pub instance_set_count: usize,
    /// Total instances across all sets
    pub instance_count: u32,
    pub expensive: bool,
    pub event_only: bool,
    pub traced: bool,
    pub internal: bool,
    pub events_enabled: bool,
    pub collection_enabled: bool,
}

/// A set a query must visit, copied out of the catalog
#[derive(Debug, Clone)]
struct QueryTarget {
    provider_id: u32,
    index: u32,
    internal: bool,
    user_mode: bool,
    names: Vec<String>,
    pdo: bool,
}

impl QueryTarget {
    fn new(set: &InstanceSet, index: u32, internal: bool, user_mode: bool) -> Self {
        Self {
            provider_id: set.provider_id,
            index,
            internal,
            user_mode,
            names: set.instance_names(),
            pdo: set.flags.contains(InstanceSetFlags::PDO),
        }
    }
}

fn queryable(set: &InstanceSet) -> bool {
    !set.flags.intersects(InstanceSetFlags::TRACED | InstanceSetFlags::EVENT_ONLY)
}

/// Provider response with any static names the provider left out filled in
fn with_static_names(record: Vec<u8>, names: &[String], pdo: bool) -> Result<Vec<u8>> {
    let header = WnodeHeader::read_checked(&record)?;
    if header.wnode_flags().contains(WnodeFlags::STATIC_INSTANCE_NAMES) && !names.is_empty() {
        wnode::include_instance_names(&record, names, pdo)
    } else {
        Ok(record)
    }
}

/// Upper bound on what [`wnode::include_instance_names`] adds
fn names_size(names: &[String]) -> usize {
    if names.is_empty() {
        return 0;
    }
    8 + names
        .iter()
        .map(|n| wnode::counted_string_size(n) + 6)
        .sum::<usize>()
}

/// Request buffer holding `request`, zero-extended to `capacity`
fn request_buffer(request: Vec<u8>, capacity: usize) -> Result<Vec<u8>> {
    let mut buffer = request;
    let size = buffer.len().max(capacity);
    buffer
        .try_reserve(size - buffer.len())
        .map_err(|_| WmiError::InsufficientResources)?;
    buffer.resize(size, 0);
    Ok(buffer)
}

impl Wmi {
    /// Send one request to a provider. A reply record flagged TOO_SMALL
    /// becomes `BufferTooSmall` with the size the provider asked for.
    pub(crate) fn query_provider(
        &self,
        provider_id: u32,
        kind: RequestKind,
        guid: &Guid,
        buffer: &mut [u8],
    ) -> Result<usize> {
        let used = self.transport.send_request(provider_id, kind, guid, buffer)?;
        if used > buffer.len() {
            warn!(
                "WMI: provider {:#x} answered {:?} with {} bytes into {}",
                provider_id,
                kind,
                used,
                buffer.len()
            );
            return Err(WmiError::ProviderFailure);
        }
        if used < WNODE_HEADER_SIZE {
            return Ok(used);
        }
        match wnode::size_needed(&buffer[..used])? {
            Some(required) => {
                debug!("WMI: provider {:#x} needs {} bytes for {}", provider_id, required, guid);
                Err(WmiError::BufferTooSmall { required })
            }
            None => Ok(used),
        }
    }

    /// Rights check for a query. Skipped when every provider of `guid`
    /// registered it open to all callers.
    fn check_query_access(&self, guid: Guid, desired: AccessRights) -> Result<()> {
        if self.open_to_all(guid) {
            trace!("WMI: {} open to all callers", guid);
            return Ok(());
        }
        self.access.check_access(&guid, desired)?;
        Ok(())
    }

    fn open_to_all(&self, guid: Guid) -> bool {
        let cat = self.catalog.lock();
        let Some(entry) = cat
            .guid_list
            .iter()
            .filter(|&&h| cat.guid_entries.is_live(h))
            .filter_map(|&h| cat.guid_entries.get(h))
            .find(|e| e.guid == guid)
        else {
            return false;
        };
        let mut sources = entry
            .instance_sets
            .iter()
            .map(|&h| {
                cat.instance_sets
                    .get(h)
                    .and_then(|set| set.data_source)
                    .and_then(|ds| cat.data_sources.get(ds))
            })
            .peekable();
        sources.peek().is_some() && sources.all(|ds| ds.is_some_and(|ds| ds.allows_all_access()))
    }

    /// Find a guid's entry and copy out what a query needs
    fn query_targets<F>(&self, guid: Guid, mut select: F) -> Result<Vec<QueryTarget>>
    where
        F: FnMut(&crate::catalog::Catalog, GuidEntryHandle) -> Result<Vec<QueryTarget>>,
    {
        let mut deferred = Deferred::new();
        let result = {
            let mut cat = self.catalog.lock();
            let ge = cat
                .find_guid_entry(&guid, false)
                .ok_or(WmiError::GuidNotFound(guid))?;
            let count = cat.guid_entries.get(ge).map_or(0, |e| e.instance_set_count());
            let result = if count == 0 {
                Err(WmiError::Disconnected(guid))
            } else {
                select(&*cat, ge)
            };
            cat.unreference_guid_entry(ge, &mut deferred);
            result
        };
        self.finish(deferred);
        result
    }

    fn single_target(&self, guid: Guid, name: &str) -> Result<QueryTarget> {
        let mut targets = self.query_targets(guid, |cat, ge| {
            let (h, index) = cat
                .resolve_instance(ge, name)
                .ok_or(WmiError::InstanceNotFound)?;
            let set = cat.instance_sets.get(h).ok_or(WmiError::InstanceNotFound)?;
            let ds = set.data_source.and_then(|d| cat.data_sources.get(d));
            Ok(vec![QueryTarget::new(
                set,
                index,
                ds.is_some_and(|d| d.is_internal()),
                ds.is_some_and(|d| d.is_user_mode()),
            )])
        })?;
        let target = targets.pop().ok_or(WmiError::InstanceNotFound)?;
        if target.user_mode {
            return Err(WmiError::ProviderNotFound(target.provider_id));
        }
        Ok(target)
    }

    /// Every instance of `guid`, as chained WNODE_ALL_DATA records
    pub fn query_all_data(&self, guid: Guid, capacity: usize) -> Result<Vec<u8>> {
        self.check_query_access(guid, AccessRights::QUERY)?;
        let targets = self.query_targets(guid, |cat, ge| {
            let entry = cat.guid_entries.get(ge).ok_or(WmiError::GuidNotFound(guid))?;
            Ok(entry
                .instance_sets
                .iter()
                .filter_map(|&h| cat.instance_sets.get(h))
                .filter(|set| queryable(set))
                .map(|set| {
                    let ds = set.data_source.and_then(|d| cat.data_sources.get(d));
                    QueryTarget::new(
                        set,
                        0,
                        ds.is_some_and(|d| d.is_internal()),
                        ds.is_some_and(|d| d.is_user_mode()),
                    )
                })
                .collect())
        })?;
        if targets.is_empty() {
            return Err(WmiError::GuidNotFound(guid));
        }

        let mut records = Vec::new();
        let mut shortfall = 0usize;
        let mut first_error = None;
        for target in targets.iter() {
            if target.user_mode {
                debug!("WMI: skipping user-mode provider {:#x} in query of {}", target.provider_id, guid);
                continue;
            }
            let response = if target.internal {
                self.internal_all_data(guid)
            } else {
                wnode::all_data(guid, target.provider_id, &[])
                    .and_then(|request| request_buffer(request, capacity))
                    .and_then(|mut buffer| {
                        let used = self.query_provider(
                            target.provider_id,
                            RequestKind::QueryAllData,
                            &guid,
                            &mut buffer,
                        )?;
                        buffer.truncate(used);
                        with_static_names(buffer, &target.names, target.pdo)
                    })
            };
            match response {
                Ok(record) => records.push(record),
                Err(WmiError::BufferTooSmall { required }) => {
                    shortfall += align8(required + names_size(&target.names))
                }
                Err(e) => {
                    warn!("WMI: provider {} failed query of {}: {}", target.provider_id, guid, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if shortfall > 0 {
            let have: usize = records.iter().map(|r| align8(r.len())).sum();
            return Err(WmiError::BufferTooSmall {
                required: have + shortfall,
            });
        }
        if records.is_empty() {
            return Err(first_error.unwrap_or(WmiError::GuidNotFound(guid)));
        }
        let out = wnode::chain(&records)?;
        if out.len() > capacity {
            return Err(WmiError::BufferTooSmall { required: out.len() });
        }
        Ok(out)
    }

    /// One named instance of `guid`
    pub fn query_single_instance(&self, guid: Guid, name: &str, capacity: usize) -> Result<Vec<u8>> {
        self.check_query_access(guid, AccessRights::QUERY)?;
        let target = self.single_target(guid, name)?;
        let request = wnode::single_instance(
            guid,
            target.provider_id,
            WnodeFlags::empty(),
            Some(name),
            target.index,
            &[],
        )?;
        let mut buffer = request_buffer(request, capacity)?;
        let used = self.query_provider(
            target.provider_id,
            RequestKind::QuerySingleInstance,
            &guid,
            &mut buffer,
        )?;
        buffer.truncate(used);
        let names = target
            .names
            .get(target.index as usize)
            .cloned()
            .map_or_else(Vec::new, |n| vec![n]);
        let record = with_static_names(buffer, &names, target.pdo)?;
        if record.len() > capacity {
            return Err(WmiError::BufferTooSmall { required: record.len() });
        }
        Ok(record)
    }

    /// Replace the data block of one named instance
    pub fn set_single_instance(&self, guid: Guid, name: &str, data: &[u8]) -> Result<()> {
        self.check_query_access(guid, AccessRights::SET)?;
        let target = self.single_target(guid, name)?;
        let mut request = wnode::single_instance(
            guid,
            target.provider_id,
            WnodeFlags::empty(),
            Some(name),
            target.index,
            data,
        )?;
        self.query_provider(
            target.provider_id,
            RequestKind::ChangeSingleInstance,
            &guid,
            &mut request,
        )?;
        Ok(())
    }

    /// Run method `method_id` on one named instance. Returns the
    /// provider's output record.
    pub fn execute_method(
        &self,
        guid: Guid,
        name: &str,
        method_id: u32,
        input: &[u8],
        capacity: usize,
    ) -> Result<Vec<u8>> {
        self.check_query_access(guid, AccessRights::EXECUTE)?;
        let target = self.single_target(guid, name)?;
        let request = wnode::method_item(guid, target.provider_id, name, method_id, input)?;
        let mut buffer = request_buffer(request, capacity)?;
        let used = self.query_provider(
            target.provider_id,
            RequestKind::ExecuteMethod,
            &guid,
            &mut buffer,
        )?;
        buffer.truncate(used);
        Ok(buffer)
    }

    // ========================================================================
    // Catalog enumeration
    // ========================================================================

    /// Every guid that currently has at least one instance set
    pub fn enumerate_guids(&self) -> Vec<GuidInfo> {
        let cat = self.catalog.lock();
        cat.guid_list
            .iter()
            .filter_map(|&h| cat.guid_entries.get(h))
            .filter(|entry| entry.instance_set_count() > 0)
            .map(|entry| {
                let sets: Vec<&InstanceSet> = entry
                    .instance_sets
                    .iter()
                    .filter_map(|&h| cat.instance_sets.get(h))
                    .collect();
                let any = |flag: InstanceSetFlags| sets.iter().any(|s| s.flags.contains(flag));
                GuidInfo {
                    guid: entry.guid,
                    instance_set_count: sets.len(),
                    instance_count: sets.iter().map(|s| s.count).sum(),
                    expensive: any(InstanceSetFlags::EXPENSIVE),
                    event_only: sets.iter().all(|s| s.is_event_only()),
                    traced: any(InstanceSetFlags::TRACED),
                    internal: entry.is_internal(),
                    events_enabled: entry.event_ref_count > 0,
                    collection_enabled: entry.collect_ref_count > 0,
                }
            })
            .collect()
    }

    /// Resolved instance names of `guid` across all its sets
    pub fn instance_names(&self, guid: Guid) -> Result<Vec<String>> {
        let mut deferred = Deferred::new();
        let names = {
            let mut cat = self.catalog.lock();
            let ge = cat
                .find_guid_entry(&guid, false)
                .ok_or(WmiError::GuidNotFound(guid))?;
            let names: Vec<String> = cat
                .guid_entries
                .get(ge)
                .map(|entry| {
                    entry
                        .instance_sets
                        .iter()
                        .filter_map(|&h| cat.instance_sets.get(h))
                        .flat_map(|set| set.instance_names())
                        .collect()
                })
                .unwrap_or_default();
            cat.unreference_guid_entry(ge, &mut deferred);
            names
        };
        self.finish(deferred);
        Ok(names)
    }

    /// All-data answer for a guid served by the core
    fn internal_all_data(&self, guid: Guid) -> Result<Vec<u8>> {
        if guid == ENUMERATE_GUIDS_GUID {
            let guids = self.enumerate_guids();
            let mut list = Vec::new();
            list.try_reserve(guids.len() * GUID_SIZE)
                .map_err(|_| WmiError::InsufficientResources)?;
            for info in guids.iter().filter(|i| !i.internal) {
                list.extend_from_slice(&info.guid.to_bytes());
            }
            wnode::all_data(guid, INTERNAL_PROVIDER_ID, &[&list])
        } else {
            wnode::all_data(guid, INTERNAL_PROVIDER_ID, &[])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WmiConfig;
    use crate::guid::INSTANCE_INFO_GUID;
    use crate::instance::InstanceNaming;
    use crate::reginfo::{RegFlags, RegGuidSpec, RegInfoBuilder};
    use crate::testing::{records, wmi_with, DenyAll, RecordingTransport};
    use crate::wnode::{AllDataView, SingleInstanceView};
    use alloc::string::ToString;
    use alloc::sync::Arc;

    const G: Guid = Guid::new(0xa1, 0, 0, [1; 8]);
    const E: Guid = Guid::new(0xa2, 0, 0, [2; 8]);
    const U: Guid = Guid::new(0xa3, 0, 0, [3; 8]);

    fn names_block(guid: Guid, names: &[&str]) -> Vec<u8> {
        RegInfoBuilder::new()
            .guid(RegGuidSpec::new(guid, 0).with_names(names.iter().copied()))
            .build()
            .unwrap()
    }

    /// Provider 2 serves A and B, provider 3 serves C
    fn two_providers() -> (Arc<RecordingTransport>, Arc<Wmi>) {
        let transport = RecordingTransport::new();
        transport.set_reginfo(2, names_block(G, &["A", "B"]));
        transport.set_instances(2, G, vec![b"aaaa".to_vec(), b"bb".to_vec()]);
        transport.set_reginfo(3, names_block(G, &["C"]));
        transport.set_instances(3, G, vec![b"cccc".to_vec()]);
        let wmi = wmi_with(&transport);
        wmi.register_provider(2).unwrap();
        wmi.register_provider(3).unwrap();
        (transport, wmi)
    }

    fn set(flags: InstanceSetFlags) -> InstanceSet {
        InstanceSet {
            guid: Guid::zero(),
            provider_id: 3,
            count: 2,
            flags,
            naming: InstanceNaming::StaticNames(vec!["A".to_string(), "B".to_string()]),
            data_source: None,
            guid_entry: None,
        }
    }

    #[test]
    fn test_queryable_excludes_traced_and_event_only() {
        assert!(queryable(&set(InstanceSetFlags::EXPENSIVE)));
        assert!(!queryable(&set(InstanceSetFlags::TRACED)));
        assert!(!queryable(&set(InstanceSetFlags::EVENT_ONLY)));
    }

    #[test]
    fn test_static_names_included_when_flagged() {
        let target = QueryTarget::new(&set(InstanceSetFlags::empty()), 0, false, false);
        let mut record = wnode::all_data(Guid::zero(), 3, &[b"aaaa".as_slice(), b"bbbb".as_slice()]).unwrap();
        let plain = with_static_names(record.clone(), &target.names, false).unwrap();
        assert_eq!(plain, record);

        let mut header = WnodeHeader::read(&record).unwrap();
        header.flags |= WnodeFlags::STATIC_INSTANCE_NAMES.bits();
        header.write(&mut record).unwrap();
        let named = with_static_names(record, &target.names, false).unwrap();
        let view = wnode::AllDataView::parse(&named).unwrap();
        assert_eq!(view.instance_names().unwrap(), vec!["A".to_string(), "B".to_string()]);
    }

    #[test]
    fn test_request_buffer_extends_to_capacity() {
        let buffer = request_buffer(vec![1, 2, 3], 8).unwrap();
        assert_eq!(buffer, vec![1, 2, 3, 0, 0, 0, 0, 0]);
        assert_eq!(request_buffer(vec![1, 2, 3], 2).unwrap().len(), 3);
    }

    #[test]
    fn test_all_data_chains_every_provider() {
        let (transport, wmi) = two_providers();
        let out = wmi.query_all_data(G, 0x1000).unwrap();
        let chained = records(&out);
        assert_eq!(chained.len(), 2);

        let mut names = Vec::new();
        let mut data = Vec::new();
        for record in chained.iter() {
            let view = AllDataView::parse(record).unwrap();
            let record_names = view.instance_names().unwrap();
            for i in 0..record_names.len() {
                data.push(view.instance_data(i as u32).unwrap().to_vec());
            }
            names.extend(record_names);
        }
        names.sort();
        data.sort();
        assert_eq!(names, vec!["A".to_string(), "B".to_string(), "C".to_string()]);
        assert_eq!(data, vec![b"aaaa".to_vec(), b"bb".to_vec(), b"cccc".to_vec()]);
        assert_eq!(transport.count(RequestKind::QueryAllData), 2);
    }

    #[test]
    fn test_all_data_reports_size_for_retry() {
        let (_transport, wmi) = two_providers();
        let required = match wmi.query_all_data(G, 64) {
            Err(WmiError::BufferTooSmall { required }) => required,
            other => panic!("unexpected {:?}", other),
        };
        assert!(required > 64);
        let out = wmi.query_all_data(G, required).unwrap();
        assert!(out.len() <= required);
        assert_eq!(records(&out).len(), 2);
    }

    #[test]
    fn test_single_instance_routes_to_owner() {
        let (transport, wmi) = two_providers();
        let out = wmi.query_single_instance(G, "C", 0x1000).unwrap();
        let view = SingleInstanceView::parse(&out).unwrap();
        assert_eq!(view.instance_name().unwrap(), Some("C".to_string()));
        assert_eq!(view.data().unwrap(), b"cccc");
        assert_eq!(transport.count_for(3, RequestKind::QuerySingleInstance, G), 1);
        assert_eq!(transport.count_for(2, RequestKind::QuerySingleInstance, G), 0);

        assert_eq!(
            wmi.query_single_instance(G, "Z", 0x1000),
            Err(WmiError::InstanceNotFound)
        );
    }

    #[test]
    fn test_set_then_query() {
        let (transport, wmi) = two_providers();
        wmi.set_single_instance(G, "B", b"new!").unwrap();
        assert_eq!(transport.instance(2, G, 1), Some(b"new!".to_vec()));

        let out = wmi.query_single_instance(G, "B", 0x1000).unwrap();
        let view = SingleInstanceView::parse(&out).unwrap();
        assert_eq!(view.data().unwrap(), b"new!");
        assert_eq!(view.instance_index, 1);
    }

    #[test]
    fn test_execute_method_returns_provider_output() {
        let (transport, wmi) = two_providers();
        let expected = wnode::method_item(G, 2, "A", 7, b"in").unwrap();
        let out = wmi.execute_method(G, "A", 7, b"in", 0x100).unwrap();
        assert_eq!(out, expected);
        assert_eq!(transport.count_for(2, RequestKind::ExecuteMethod, G), 1);
    }

    #[test]
    fn test_unregistered_guids() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        assert_eq!(wmi.query_all_data(G, 0x100), Err(WmiError::GuidNotFound(G)));

        // An entry held open by a consumer has no provider to ask
        let object = wmi.open_events(G).unwrap();
        assert_eq!(wmi.query_all_data(G, 0x100), Err(WmiError::Disconnected(G)));
        assert_eq!(
            wmi.query_single_instance(G, "A", 0x100),
            Err(WmiError::Disconnected(G))
        );
        wmi.close(object).unwrap();
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_event_only_guid_not_queryable() {
        let transport = RecordingTransport::new();
        let block = RegInfoBuilder::new()
            .guid(RegGuidSpec::new(E, 0).with_names(["e"]).with_flags(RegFlags::EVENT_ONLY_GUID))
            .build()
            .unwrap();
        transport.set_reginfo(4, block);
        let wmi = wmi_with(&transport);
        wmi.register_provider(4).unwrap();

        assert_eq!(wmi.query_all_data(E, 0x100), Err(WmiError::GuidNotFound(E)));
        assert_eq!(wmi.open_query_set(E), Err(WmiError::GuidNotFound(E)));
        assert_eq!(transport.count(RequestKind::QueryAllData), 0);
    }

    #[test]
    fn test_user_mode_sets_not_queried() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let registration = wmi.register_user_guids(&names_block(U, &["u"]), 0).unwrap();

        assert_eq!(wmi.query_all_data(U, 0x100), Err(WmiError::GuidNotFound(U)));
        assert_eq!(
            wmi.query_single_instance(U, "u", 0x100),
            Err(WmiError::ProviderNotFound(registration.provider_id))
        );
        assert!(transport.requests().is_empty());
    }

    #[test]
    fn test_access_denied() {
        let transport = RecordingTransport::new();
        transport.set_reginfo(2, names_block(G, &["A"]));
        let wmi = Wmi::new(WmiConfig::new(), transport.clone(), Arc::new(DenyAll)).unwrap();
        wmi.register_provider(2).unwrap();

        assert_eq!(wmi.query_all_data(G, 0x100), Err(WmiError::AccessDenied));
        assert_eq!(wmi.query_single_instance(G, "A", 0x100), Err(WmiError::AccessDenied));
        assert_eq!(wmi.set_single_instance(G, "A", b"x"), Err(WmiError::AccessDenied));
        assert_eq!(wmi.execute_method(G, "A", 1, b"", 0x100), Err(WmiError::AccessDenied));
        assert_eq!(transport.count(RequestKind::RegInfo), 1);
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn test_too_small_reply_record_reports_size() {
        let (transport, wmi) = two_providers();
        transport.set_instances(3, G, vec![vec![7u8; 40]]);
        transport.reply_too_small(3);
        let needed = wnode::single_instance(G, 3, WnodeFlags::empty(), None, 0, &[7u8; 40])
            .unwrap()
            .len();

        assert_eq!(
            wmi.query_single_instance(G, "C", 0),
            Err(WmiError::BufferTooSmall { required: needed })
        );
        let out = wmi.query_single_instance(G, "C", needed + 0x40).unwrap();
        let view = SingleInstanceView::parse(&out).unwrap();
        assert_eq!(view.data().unwrap(), &[7u8; 40][..]);
    }

    #[test]
    fn test_open_provider_skips_access_check() {
        let transport = RecordingTransport::new();
        let open = RegInfoBuilder::new()
            .guid(
                RegGuidSpec::new(G, 0)
                    .with_names(["A"])
                    .with_flags(RegFlags::ALLOW_ALL_ACCESS),
            )
            .build()
            .unwrap();
        transport.set_reginfo(2, open);
        transport.set_instances(2, G, vec![b"open".to_vec()]);
        transport.set_reginfo(3, names_block(E, &["B"]));
        let wmi = Wmi::new(WmiConfig::new(), transport.clone(), Arc::new(DenyAll)).unwrap();
        wmi.register_provider(2).unwrap();
        wmi.register_provider(3).unwrap();

        let out = wmi.query_single_instance(G, "A", 0x100).unwrap();
        assert_eq!(SingleInstanceView::parse(&out).unwrap().data().unwrap(), b"open");
        assert!(wmi.query_all_data(G, 0x100).is_ok());
        assert_eq!(wmi.query_single_instance(E, "B", 0x100), Err(WmiError::AccessDenied));

        // A second provider without the flag brings the check back
        transport.set_reginfo(4, names_block(G, &["C"]));
        wmi.register_provider(4).unwrap();
        assert_eq!(wmi.query_single_instance(G, "A", 0x100), Err(WmiError::AccessDenied));
    }

    #[test]
    fn test_enumerate_guids() {
        let (_transport, wmi) = two_providers();
        let infos = wmi.enumerate_guids();
        let info = infos.iter().find(|i| i.guid == G).unwrap();
        assert_eq!(info.instance_set_count, 2);
        assert_eq!(info.instance_count, 3);
        assert!(!info.internal && !info.traced && !info.event_only);
        assert!(infos.iter().any(|i| i.guid == INSTANCE_INFO_GUID && i.internal));

        let names = wmi.instance_names(G).unwrap();
        assert_eq!(names.len(), 3);
    }

    #[test]
    fn test_enumerate_guids_answered_by_core() {
        let (transport, wmi) = two_providers();
        let requests = transport.requests().len();
        let out = wmi.query_all_data(ENUMERATE_GUIDS_GUID, 0x1000).unwrap();
        let view = AllDataView::parse(&out).unwrap();
        assert_eq!(view.instance_data(0).unwrap(), &G.to_bytes()[..]);
        assert_eq!(transport.requests().len(), requests);
    }
}
