//! Test doubles shared by the module tests

use crate::catalog::GuidObjectHandle;
use crate::config::WmiConfig;
use crate::consumer::ReceiveRequest;
use crate::error::{Result, WmiError};
use crate::guid::Guid;
use crate::register::Executor;
use crate::transport::{AccessCheck, AccessRights, AllowAll, ProviderTransport, RequestKind};
use crate::wnode::{self, SingleInstanceView, WnodeChain, WnodeFlags, WnodeHeader};
use crate::Wmi;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

type Hook = Arc<dyn Fn(u32, RequestKind, &Guid) + Send + Sync>;

/// Answers provider requests from in-memory tables and records every call
#[derive(Default)]
pub(crate) struct RecordingTransport {
    reginfo: spin::Mutex<BTreeMap<u32, Vec<u8>>>,
    instances: spin::Mutex<BTreeMap<(u32, Guid), Vec<Vec<u8>>>>,
    requests: spin::Mutex<Vec<(u32, RequestKind, Guid)>>,
    enable_buffers: spin::Mutex<Vec<Vec<u8>>>,
    hook: spin::Mutex<Option<Hook>>,
    too_small_replies: spin::Mutex<BTreeSet<u32>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_reginfo(&self, provider_id: u32, blob: Vec<u8>) {
        self.reginfo.lock().insert(provider_id, blob);
    }

    pub fn set_instances(&self, provider_id: u32, guid: Guid, data: Vec<Vec<u8>>) {
        self.instances.lock().insert((provider_id, guid), data);
    }

    pub fn instance(&self, provider_id: u32, guid: Guid, index: usize) -> Option<Vec<u8>> {
        self.instances
            .lock()
            .get(&(provider_id, guid))
            .and_then(|d| d.get(index).cloned())
    }

    /// Run `hook` after each request is recorded, outside the transport's
    /// own locks
    pub fn on_request<F>(&self, hook: F)
    where
        F: Fn(u32, RequestKind, &Guid) + Send + Sync + 'static,
    {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    /// Answer undersized requests to `provider_id` with a WNODE_TOO_SMALL
    /// record instead of an error
    pub fn reply_too_small(&self, provider_id: u32) {
        self.too_small_replies.lock().insert(provider_id);
    }

    pub fn requests(&self) -> Vec<(u32, RequestKind, Guid)> {
        self.requests.lock().clone()
    }

    pub fn count(&self, kind: RequestKind) -> usize {
        self.requests.lock().iter().filter(|r| r.1 == kind).count()
    }

    pub fn count_for(&self, provider_id: u32, kind: RequestKind, guid: Guid) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.0 == provider_id && r.1 == kind && r.2 == guid)
            .count()
    }

    /// Enable and disable requests in delivery order
    pub fn enable_sequence(&self) -> Vec<RequestKind> {
        self.requests
            .lock()
            .iter()
            .map(|r| r.1)
            .filter(|k| k.is_enable_disable())
            .collect()
    }

    pub fn last_enable_buffer(&self) -> Option<Vec<u8>> {
        self.enable_buffers.lock().last().cloned()
    }

    fn reply(&self, provider_id: u32, buffer: &mut [u8], record: &[u8]) -> Result<usize> {
        if record.len() > buffer.len() {
            if self.too_small_replies.lock().contains(&provider_id) {
                let too_small = wnode::too_small(record.len())?;
                if too_small.len() <= buffer.len() {
                    buffer[..too_small.len()].copy_from_slice(&too_small);
                    return Ok(too_small.len());
                }
            }
            return Err(WmiError::BufferTooSmall {
                required: record.len(),
            });
        }
        buffer[..record.len()].copy_from_slice(record);
        Ok(record.len())
    }

    fn answer(&self, provider_id: u32, kind: RequestKind, guid: &Guid, buffer: &mut [u8]) -> Result<usize> {
        match kind {
            RequestKind::RegInfo => {
                let blob = self
                    .reginfo
                    .lock()
                    .get(&provider_id)
                    .cloned()
                    .ok_or(WmiError::ProviderNotFound(provider_id))?;
                self.reply(provider_id, buffer, &blob)
            }
            RequestKind::QueryAllData => {
                let data = self
                    .instances
                    .lock()
                    .get(&(provider_id, *guid))
                    .cloned()
                    .unwrap_or_default();
                let refs: Vec<&[u8]> = data.iter().map(|d| d.as_slice()).collect();
                let mut record = wnode::all_data(*guid, provider_id, &refs)?;
                let mut header = WnodeHeader::read(&record)?;
                header.flags |= WnodeFlags::STATIC_INSTANCE_NAMES.bits();
                header.write(&mut record)?;
                self.reply(provider_id, buffer, &record)
            }
            RequestKind::QuerySingleInstance => {
                let index = SingleInstanceView::parse(buffer)?.instance_index;
                let data = self
                    .instance(provider_id, *guid, index as usize)
                    .ok_or(WmiError::InstanceNotFound)?;
                let record =
                    wnode::single_instance(*guid, provider_id, WnodeFlags::empty(), None, index, &data)?;
                self.reply(provider_id, buffer, &record)
            }
            RequestKind::ChangeSingleInstance => {
                let view = SingleInstanceView::parse(buffer)?;
                let index = view.instance_index as usize;
                let data = view.data()?.to_vec();
                let mut instances = self.instances.lock();
                let slots = instances.entry((provider_id, *guid)).or_default();
                if slots.len() <= index {
                    slots.resize(index + 1, Vec::new());
                }
                slots[index] = data;
                Ok(0)
            }
            RequestKind::ExecuteMethod => Ok(WnodeHeader::read(buffer)?.buffer_size as usize),
            _ => {
                self.enable_buffers.lock().push(buffer.to_vec());
                Ok(0)
            }
        }
    }
}

impl ProviderTransport for RecordingTransport {
    fn send_request(
        &self,
        provider_id: u32,
        kind: RequestKind,
        guid: &Guid,
        buffer: &mut [u8],
    ) -> Result<usize> {
        self.requests.lock().push((provider_id, kind, *guid));
        let result = self.answer(provider_id, kind, guid, buffer);
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(provider_id, kind, guid);
        }
        result
    }
}

/// Refuses everything
pub(crate) struct DenyAll;

impl AccessCheck for DenyAll {
    fn check_access(&self, _guid: &Guid, _desired: AccessRights) -> Result<AccessRights> {
        Err(WmiError::AccessDenied)
    }
}

/// Holds spawned jobs until the test runs them
#[derive(Default)]
pub(crate) struct DeferredExecutor {
    jobs: spin::Mutex<Vec<Box<dyn FnOnce() + Send + 'static>>>,
}

impl DeferredExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pending(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Run jobs, including ones spawned while running, until none remain
    pub fn run_all(&self) -> usize {
        let mut ran = 0;
        loop {
            let jobs = core::mem::take(&mut *self.jobs.lock());
            if jobs.is_empty() {
                return ran;
            }
            for job in jobs {
                job();
                ran += 1;
            }
        }
    }
}

impl Executor for DeferredExecutor {
    fn spawn(&self, job: Box<dyn FnOnce() + Send + 'static>) {
        self.jobs.lock().push(job);
    }
}

pub(crate) fn wmi_with(transport: &Arc<RecordingTransport>) -> Arc<Wmi> {
    wmi_with_config(transport, WmiConfig::new())
}

pub(crate) fn wmi_with_config(transport: &Arc<RecordingTransport>, config: WmiConfig) -> Arc<Wmi> {
    Wmi::new(config, transport.clone(), Arc::new(AllowAll)).unwrap()
}

/// Instance set count of a guid's entry, without taking a reference
pub(crate) fn instance_set_count(wmi: &Wmi, guid: &Guid) -> Option<usize> {
    let cat = wmi.catalog.lock();
    cat.guid_list
        .iter()
        .filter_map(|&h| cat.guid_entries.get(h).map(|e| (h, e)))
        .find(|(_, e)| e.guid == *guid)
        .map(|(h, e)| {
            assert_eq!(e.instance_set_count(), cat.sets_pointing_at(h));
            e.instance_set_count()
        })
}

/// Everything queued for `objects`, already drained
pub(crate) fn drain(wmi: &Wmi, objects: &[GuidObjectHandle]) -> Vec<Vec<u8>> {
    let request: ReceiveRequest = wmi.receive(objects, 0x10000).unwrap();
    match request.poll() {
        Some(Ok(chain)) => records(&chain),
        Some(Err(e)) => panic!("receive failed: {}", e),
        None => {
            wmi.cancel_receive(&request);
            Vec::new()
        }
    }
}

pub(crate) fn records(chain: &[u8]) -> Vec<Vec<u8>> {
    WnodeChain::new(chain).map(|r| r.unwrap().to_vec()).collect()
}
