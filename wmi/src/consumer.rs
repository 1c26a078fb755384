//! Consumer Objects and Event Delivery
//!
//! A consumer object ("guid object") is what a caller holds to query a
//! guid, receive its events, or (for user-mode providers) receive requests
//! and replies. Event-capable objects own two bounded queues, high and low
//! priority, each a chain of 8-byte aligned WNODE records linked by their
//! `linkage` field.
//!
//! # Delivery
//!
//! ```text
//! fire_event ─► process_event ─► guid entry ─► for each open object:
//!                                     kernel callback ──► invoked inline
//!                                     pending receive ──► completed
//!                                     otherwise ────────► hi/lo queue
//! ```
//!
//! A full queue drops the event and counts it; producers never block. The
//! next drain stamps the count into the high word of the first record's
//! `version` field.
//!
//! # Receiving
//!
//! [`Wmi::receive`] waits on several objects at once. Queued records are
//! merged by timestamp across objects, high priority first. If nothing is
//! queued the request stays pending until an event arrives, the request is
//! cancelled, or an object is closed.

use crate::catalog::{Catalog, Deferred, GuidEntryHandle, GuidObjectHandle};
use crate::config::LARGE_EVENT_BUFFER_SIZE;
use crate::error::{Result, WmiError};
use crate::guid::Guid;
use crate::instance::InstanceSetFlags;
use crate::stats::WmiStats;
use crate::transport::{AccessRights, RequestKind};
use crate::wnode::{
    self, align8, EventReference, SingleInstanceView, WnodeFlags, WnodeHeader,
};
use crate::Wmi;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use log::{debug, trace, warn};

/// Reply slots per request object
pub const MAX_REPLY_SLOTS: usize = 4;

/// Queries made to resolve one event reference, counting the first
const EVENT_REFERENCE_ATTEMPTS: usize = 2;

/// What an object was opened for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectKind {
    /// Query, set and method calls
    QuerySet,
    /// Event notifications
    Events,
    /// A user-mode provider's request channel
    Request,
    /// Receives mailbox replies
    Reply,
}

bitflags::bitflags! {
    /// Consumer object flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct GuidObjectFlags: u32 {
        /// Events are delivered through a callback
        const KERNEL_NOTIFICATION = 0x0000_0001;
        /// Object is closing; skip it on delivery
        const RECEIVE_NO_EVENTS = 0x0000_0002;
        const REQUEST_OBJECT = 0x0000_0004;
        const REPLY_OBJECT = 0x0000_0008;
        /// Handle has been closed
        const CLOSED = 0x0000_0010;
    }
}

/// Queue selection for a fired event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventPriority {
    High,
    Low,
}

/// Kernel-mode event callback
pub type NotificationCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;

// ============================================================================
// Event queue
// ============================================================================

/// Bounded chain of queued WNODE records
#[derive(Debug, Clone)]
pub struct EventQueue {
    buffer: Vec<u8>,
    max_size: usize,
    limit: usize,
    last: Option<usize>,
    events_lost: u32,
}

impl EventQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_size,
            limit: 0,
            last: None,
            events_lost: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    /// Bytes queued, always a multiple of 8
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn events_lost(&self) -> u32 {
        self.events_lost
    }

    /// Queued records in arrival order
    pub fn records(&self) -> wnode::WnodeChain<'_> {
        wnode::WnodeChain::new(&self.buffer)
    }

    /// Append a record. Returns false, counting the loss, when the queue
    /// cannot take it.
    pub fn push(&mut self, record: &[u8]) -> bool {
        let size = align8(record.len());
        if self.limit == 0 {
            // First use fixes the bound; a single oversized event widens it
            self.limit = if size > self.max_size {
                size.max(LARGE_EVENT_BUFFER_SIZE)
            } else {
                self.max_size
            };
        }
        if self.buffer.len() + size > self.limit || self.buffer.try_reserve(size).is_err() {
            self.events_lost = self.events_lost.saturating_add(1);
            return false;
        }

        let offset = self.buffer.len();
        self.buffer.extend_from_slice(record);
        self.buffer.resize(offset + size, 0);
        if let Err(e) = wnode::set_linkage(&mut self.buffer[offset..], 0) {
            warn!("WMI: record of {} bytes not queued: {}", record.len(), e);
            self.buffer.truncate(offset);
            self.events_lost = self.events_lost.saturating_add(1);
            return false;
        }
        if let Some(last) = self.last {
            if let Err(e) = wnode::set_linkage(&mut self.buffer[last..], (offset - last) as u32) {
                warn!("WMI: cannot link queued record at {}: {}", last, e);
            }
        }
        self.last = Some(offset);
        true
    }

    /// Move the lost count into the first queued record
    fn stamp_events_lost(&mut self) {
        if self.events_lost != 0 && !self.is_empty() {
            match wnode::set_events_lost(&mut self.buffer, self.events_lost) {
                Ok(()) => self.events_lost = 0,
                Err(e) => warn!("WMI: cannot record {} lost events: {}", self.events_lost, e),
            }
        }
    }

    fn reset(&mut self) {
        self.buffer = Vec::new();
        self.limit = 0;
        self.last = None;
    }
}

// ============================================================================
// Pending receives
// ============================================================================

enum ReceiveState {
    Waiting,
    Done(Result<Vec<u8>>),
    Taken,
}

/// A receive waiting on one or more objects
pub(crate) struct PendingReceive {
    objects: Vec<GuidObjectHandle>,
    capacity: usize,
    state: spin::Mutex<ReceiveState>,
}

impl PendingReceive {
    fn new(objects: Vec<GuidObjectHandle>, capacity: usize) -> Self {
        Self {
            objects,
            capacity,
            state: spin::Mutex::new(ReceiveState::Waiting),
        }
    }

    /// Complete a waiting request; false if it already finished
    fn complete(&self, result: Result<Vec<u8>>) -> bool {
        let mut state = self.state.lock();
        if matches!(*state, ReceiveState::Waiting) {
            *state = ReceiveState::Done(result);
            true
        } else {
            false
        }
    }
}

/// Caller side of a [`Wmi::receive`]
pub struct ReceiveRequest {
    inner: Arc<PendingReceive>,
}

impl ReceiveRequest {
    /// Result once the request finished. Returned exactly once.
    pub fn poll(&self) -> Option<Result<Vec<u8>>> {
        let mut state = self.inner.state.lock();
        match core::mem::replace(&mut *state, ReceiveState::Taken) {
            ReceiveState::Done(result) => Some(result),
            other => {
                *state = other;
                None
            }
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(*self.inner.state.lock(), ReceiveState::Waiting)
    }

    /// Spin until the request finishes
    pub fn wait(&self) -> Result<Vec<u8>> {
        loop {
            if let Some(result) = self.poll() {
                return result;
            }
            if matches!(*self.inner.state.lock(), ReceiveState::Taken) {
                return Err(WmiError::InvalidHandle);
            }
            core::hint::spin_loop();
        }
    }
}

// ============================================================================
// Guid object
// ============================================================================

/// A consumer object
pub struct GuidObject {
    pub guid: Guid,
    pub kind: ObjectKind,
    pub flags: GuidObjectFlags,
    /// Entry this object is listed on; holds a reference while set
    pub guid_entry: Option<GuidEntryHandle>,
    pub hi: EventQueue,
    pub lo: EventQueue,
    /// An enable request was sent on open and must be undone on delete
    pub enable_request_sent: bool,
    /// Owning provider of a request object
    pub provider_id: Option<u32>,
    pub cookie: u64,
    pub(crate) pending: Option<Arc<PendingReceive>>,
    pub(crate) callback: Option<NotificationCallback>,
    /// Request object: reply objects awaiting an answer
    pub(crate) reply_slots: [Option<GuidObjectHandle>; MAX_REPLY_SLOTS],
    /// Reply object: request objects holding it, by slot
    pub(crate) linked_requests: Vec<(GuidObjectHandle, usize)>,
}

impl GuidObject {
    pub fn new(guid: Guid, kind: ObjectKind, max_queue_size: usize) -> Self {
        let flags = match kind {
            ObjectKind::Request => GuidObjectFlags::REQUEST_OBJECT,
            ObjectKind::Reply => GuidObjectFlags::REPLY_OBJECT,
            ObjectKind::QuerySet | ObjectKind::Events => GuidObjectFlags::empty(),
        };
        Self {
            guid,
            kind,
            flags,
            guid_entry: None,
            hi: EventQueue::new(max_queue_size),
            lo: EventQueue::new(max_queue_size),
            enable_request_sent: false,
            provider_id: None,
            cookie: 0,
            pending: None,
            callback: None,
            reply_slots: [None; MAX_REPLY_SLOTS],
            linked_requests: Vec::new(),
        }
    }

    pub fn queue(&self, priority: EventPriority) -> &EventQueue {
        match priority {
            EventPriority::High => &self.hi,
            EventPriority::Low => &self.lo,
        }
    }

    pub fn queue_mut(&mut self, priority: EventPriority) -> &mut EventQueue {
        match priority {
            EventPriority::High => &mut self.hi,
            EventPriority::Low => &mut self.lo,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.flags.contains(GuidObjectFlags::CLOSED)
    }
}

impl fmt::Debug for GuidObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuidObject")
            .field("guid", &self.guid)
            .field("kind", &self.kind)
            .field("flags", &self.flags)
            .field("hi_bytes", &self.hi.len())
            .field("lo_bytes", &self.lo.len())
            .field("pending", &self.pending.is_some())
            .finish()
    }
}

/// How one open object takes an event
enum Target {
    /// Closing
    Skip,
    /// Kernel callback, run without the catalog lock
    Callback(NotificationCallback),
    Queue,
}

/// Outcome of writing one record to one object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Handed to a waiting receive
    Completed,
    /// Handed to a waiting receive as a too-small result and queued
    Requeued,
    Queued,
    Lost,
}

impl Catalog {
    /// Clear a finished request from every object it was waiting on
    fn detach_pending(&mut self, pending: &Arc<PendingReceive>) {
        for &h in pending.objects.iter() {
            if let Some(object) = self.objects.get_mut(h) {
                if object
                    .pending
                    .as_ref()
                    .is_some_and(|p| Arc::ptr_eq(p, pending))
                {
                    object.pending = None;
                }
            }
        }
    }

    /// Fail an object's pending receive, if any
    pub(crate) fn fail_pending(&mut self, object: GuidObjectHandle, error: WmiError) {
        let pending = self.objects.get_mut(object).and_then(|o| o.pending.take());
        if let Some(pending) = pending {
            pending.complete(Err(error));
            self.detach_pending(&pending);
        }
    }

    /// Give a record to an object: satisfy its pending receive or queue it
    pub(crate) fn write_wnode_to_object(
        &mut self,
        object: GuidObjectHandle,
        record: &[u8],
        priority: EventPriority,
    ) -> Result<Delivery> {
        let target = self.objects.get_mut(object).ok_or(WmiError::InvalidHandle)?;

        if let Some(pending) = target.pending.take() {
            let delivery = if record.len() > pending.capacity {
                pending.complete(Err(WmiError::BufferTooSmall {
                    required: record.len(),
                }));
                if target.queue_mut(priority).push(record) {
                    Delivery::Requeued
                } else {
                    Delivery::Lost
                }
            } else {
                let mut copy = record.to_vec();
                wnode::set_linkage(&mut copy, 0)?;
                pending.complete(Ok(copy));
                Delivery::Completed
            };
            self.detach_pending(&pending);
            return Ok(delivery);
        }

        if target.queue_mut(priority).push(record) {
            Ok(Delivery::Queued)
        } else {
            debug!("WMI: event queue full for object {:?}, event dropped", object);
            Ok(Delivery::Lost)
        }
    }

    /// Merge one priority class of queued records across `objects` into
    /// `out` in timestamp order, then empty those queues.
    ///
    /// `last` tracks the offset of the most recent record written to
    /// `out` so the caller can terminate the chain.
    pub(crate) fn copy_from_event_queues(
        &mut self,
        objects: &[GuidObjectHandle],
        priority: EventPriority,
        out: &mut Vec<u8>,
        last: &mut Option<usize>,
    ) {
        for &h in objects {
            if let Some(object) = self.objects.get_mut(h) {
                object.queue_mut(priority).stamp_events_lost();
            }
        }

        let mut cursors: Vec<(GuidObjectHandle, usize)> = objects
            .iter()
            .copied()
            .filter(|&h| self.objects.get(h).is_some_and(|o| !o.queue(priority).is_empty()))
            .map(|h| (h, 0))
            .collect();

        loop {
            let mut best: Option<(usize, i64)> = None;
            for (i, &(h, offset)) in cursors.iter().enumerate() {
                let Some(object) = self.objects.get(h) else {
                    continue;
                };
                let Ok(header) = WnodeHeader::read(&object.queue(priority).buffer[offset..]) else {
                    continue;
                };
                if best.map_or(true, |(_, ts)| header.timestamp < ts) {
                    best = Some((i, header.timestamp));
                }
            }
            let Some((index, _)) = best else {
                break;
            };

            let (h, offset) = cursors[index];
            let Some(object) = self.objects.get(h) else {
                cursors.remove(index);
                continue;
            };
            let queued = &object.queue(priority).buffer[offset..];
            let Ok(header) = WnodeHeader::read(queued) else {
                cursors.remove(index);
                continue;
            };
            let size = (header.buffer_size as usize).min(queued.len());

            out.resize(align8(out.len()), 0);
            let start = out.len();
            out.extend_from_slice(&queued[..size]);
            if let Err(e) = wnode::set_linkage(&mut out[start..], align8(size) as u32) {
                warn!("WMI: dropping short record from {:?}: {}", h, e);
                out.truncate(start);
                cursors.remove(index);
                continue;
            }
            *last = Some(start);

            if header.linkage == 0 {
                cursors.remove(index);
            } else {
                cursors[index].1 = offset + header.linkage as usize;
            }
        }

        for &h in objects {
            if let Some(object) = self.objects.get_mut(h) {
                object.queue_mut(priority).reset();
            }
        }
    }
}

// ============================================================================
// Object lifecycle
// ============================================================================

impl Wmi {
    fn open_object(
        &self,
        guid: Guid,
        kind: ObjectKind,
        callback: Option<NotificationCallback>,
    ) -> Result<GuidObjectHandle> {
        let desired = match kind {
            ObjectKind::QuerySet => AccessRights::QUERY,
            _ => AccessRights::NOTIFICATION,
        };
        self.access.check_access(&guid, desired)?;

        let mut deferred = Deferred::new();
        let result = self.link_new_object(guid, kind, callback, &mut deferred);
        self.finish(deferred);
        let (handle, ge) = result?;

        self.enable_collect_or_event(ge, kind, handle);
        trace!("WMI: opened {:?} object {:?} for {}", kind, handle, guid);
        Ok(handle)
    }

    fn link_new_object(
        &self,
        guid: Guid,
        kind: ObjectKind,
        callback: Option<NotificationCallback>,
        deferred: &mut Deferred,
    ) -> Result<(GuidObjectHandle, GuidEntryHandle)> {
        let mut cat = self.catalog.lock();
        let ge = match kind {
            ObjectKind::QuerySet => {
                let ge = cat
                    .find_guid_entry(&guid, false)
                    .ok_or(WmiError::GuidNotFound(guid))?;
                let (count, queryable) = {
                    let entry = cat.guid_entries.get(ge).ok_or(WmiError::GuidNotFound(guid))?;
                    let queryable = entry.instance_sets.iter().any(|&h| {
                        cat.instance_sets.get(h).is_some_and(|s| {
                            !s.flags.intersects(InstanceSetFlags::TRACED | InstanceSetFlags::EVENT_ONLY)
                        })
                    });
                    (entry.instance_set_count(), queryable)
                };
                if count == 0 || !queryable {
                    cat.unreference_guid_entry(ge, deferred);
                    return Err(if count == 0 {
                        WmiError::Disconnected(guid)
                    } else {
                        WmiError::GuidNotFound(guid)
                    });
                }
                ge
            }
            // Events may be opened before any provider registers the guid
            _ => cat.find_or_create_guid_entry(guid)?,
        };

        let mut object = GuidObject::new(guid, kind, self.config.max_event_buffer_size);
        object.guid_entry = Some(ge);
        if callback.is_some() {
            object.flags |= GuidObjectFlags::KERNEL_NOTIFICATION;
            object.callback = callback;
        }
        let handle = match cat.objects.allocate(object) {
            Ok(handle) => handle,
            Err(e) => {
                cat.unreference_guid_entry(ge, deferred);
                return Err(e);
            }
        };
        if let Some(entry) = cat.guid_entries.get_mut(ge) {
            entry.objects.push(handle);
        }
        Ok((handle, ge))
    }

    /// Open a guid for query, set and method calls
    pub fn open_query_set(&self, guid: Guid) -> Result<GuidObjectHandle> {
        self.open_object(guid, ObjectKind::QuerySet, None)
    }

    /// Open a guid for queued event delivery, creating its entry if no
    /// provider has registered it yet
    pub fn open_events(&self, guid: Guid) -> Result<GuidObjectHandle> {
        self.open_object(guid, ObjectKind::Events, None)
    }

    /// Open a guid for events delivered straight to `callback`
    pub fn open_kernel_notification<F>(&self, guid: Guid, callback: F) -> Result<GuidObjectHandle>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.open_object(guid, ObjectKind::Events, Some(Arc::new(callback)))
    }

    /// Open an object that only receives mailbox replies
    pub fn open_reply_object(&self, guid: Guid) -> Result<GuidObjectHandle> {
        let object = GuidObject::new(guid, ObjectKind::Reply, self.config.max_event_buffer_size);
        self.catalog.lock().objects.allocate(object)
    }

    pub(crate) fn create_request_object(
        &self,
        guid: Guid,
        provider_id: u32,
        cookie: u64,
    ) -> Result<GuidObjectHandle> {
        let mut object = GuidObject::new(guid, ObjectKind::Request, self.config.max_event_buffer_size);
        object.provider_id = Some(provider_id);
        object.cookie = cookie;
        self.catalog.lock().objects.allocate(object)
    }

    /// Close a handle. The object is destroyed once nothing else holds it.
    pub fn close(&self, handle: GuidObjectHandle) -> Result<()> {
        let mut deferred = Deferred::new();
        {
            let mut cat = self.catalog.lock();
            let object = cat.objects.get_mut(handle).ok_or(WmiError::InvalidHandle)?;
            if object.is_closed() {
                return Err(WmiError::InvalidHandle);
            }
            object.flags |= GuidObjectFlags::CLOSED | GuidObjectFlags::RECEIVE_NO_EVENTS;
            let links = core::mem::take(&mut object.linked_requests);
            cat.fail_pending(handle, WmiError::InvalidHandle);

            // A closing reply object drops out of every request slot
            for (request, slot) in links {
                let linked = match cat.objects.get_mut(request) {
                    Some(req) if req.reply_slots[slot] == Some(handle) => {
                        req.reply_slots[slot] = None;
                        true
                    }
                    _ => false,
                };
                if linked {
                    cat.unreference_object(handle, &mut deferred);
                }
            }
            cat.unreference_object(handle, &mut deferred);
        }
        self.finish(deferred);
        Ok(())
    }

    /// Stop delivering to an object that is about to be closed and fail
    /// its pending receive
    pub fn mark_handle_closed(&self, handle: GuidObjectHandle) -> Result<()> {
        let mut cat = self.catalog.lock();
        let object = cat.objects.get_mut(handle).ok_or(WmiError::InvalidHandle)?;
        object.flags |= GuidObjectFlags::RECEIVE_NO_EVENTS;
        cat.fail_pending(handle, WmiError::InvalidHandle);
        Ok(())
    }

    /// Cleanup for an object whose last reference is gone
    pub(crate) fn delete_object(&self, handle: GuidObjectHandle, object: GuidObject) {
        let mut deferred = Deferred::new();
        match object.kind {
            ObjectKind::Request => {
                let mut cat = self.catalog.lock();
                for (slot, reply) in object.reply_slots.iter().enumerate() {
                    let Some(reply) = *reply else {
                        continue;
                    };
                    let notice = wnode::internal(object.guid, crate::mailbox::ACTION_REQUEST_DIED, 0, &[])
                        .and_then(|record| cat.write_wnode_to_object(reply, &record, EventPriority::High));
                    match notice {
                        Ok(Delivery::Lost) => {
                            warn!("WMI: reply object {:?} full, request-died notice dropped", reply);
                            WmiStats::bump(&self.stats.replies_lost);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            warn!("WMI: request-died notice to {:?} failed: {}", reply, e);
                            WmiStats::bump(&self.stats.replies_lost);
                        }
                    }
                    if let Some(r) = cat.objects.get_mut(reply) {
                        r.linked_requests.retain(|&(req, s)| !(req == handle && s == slot));
                    }
                    cat.unreference_object(reply, &mut deferred);
                }
                if let Some(ds) = object
                    .provider_id
                    .and_then(|pid| cat.reg_entries.get(&pid))
                    .and_then(|entry| entry.data_source)
                {
                    if let Some(source) = cat.data_sources.get_mut(ds) {
                        source.request_object = None;
                    }
                }
                drop(cat);
                self.finish(deferred);

                if let Some(pid) = object.provider_id {
                    if let Err(e) = self.deregister_provider(pid) {
                        debug!("WMI: request object for provider {} closed: {}", pid, e);
                    }
                }
            }
            ObjectKind::Reply => {}
            ObjectKind::QuerySet | ObjectKind::Events => {
                if let Some(ge) = object.guid_entry {
                    if object.enable_request_sent {
                        self.disable_collect_or_event(ge, object.kind);
                    }
                    let mut cat = self.catalog.lock();
                    if let Some(entry) = cat.guid_entries.get_mut(ge) {
                        entry.objects.retain(|&h| h != handle);
                    }
                    cat.unreference_guid_entry(ge, &mut deferred);
                    drop(cat);
                    self.finish(deferred);
                }
            }
        }

        if let Some(pending) = object.pending {
            let mut cat = self.catalog.lock();
            pending.complete(Err(WmiError::InvalidHandle));
            cat.detach_pending(&pending);
        }
        trace!("WMI: object {:?} deleted", handle);
    }

    // ========================================================================
    // Receive
    // ========================================================================

    /// Wait for events on `objects`, returning chained records of at most
    /// `capacity` bytes
    pub fn receive(&self, objects: &[GuidObjectHandle], capacity: usize) -> Result<ReceiveRequest> {
        if objects.is_empty() {
            return Err(WmiError::InvalidParameter("no objects to wait on"));
        }
        let mut unique: Vec<GuidObjectHandle> = Vec::new();
        for &h in objects {
            if !unique.contains(&h) {
                unique.push(h);
            }
        }

        let mut cat = self.catalog.lock();
        for &h in unique.iter() {
            let object = cat.objects.get(h).ok_or(WmiError::InvalidHandle)?;
            if object.is_closed()
                || object.flags.contains(GuidObjectFlags::KERNEL_NOTIFICATION)
                || !cat.objects.is_live(h)
            {
                return Err(WmiError::InvalidHandle);
            }
        }

        // A new receive replaces any outstanding one
        for &h in unique.iter() {
            cat.fail_pending(h, WmiError::InvalidHandle);
        }

        let request = Arc::new(PendingReceive::new(unique.clone(), capacity));
        let queued: usize = unique
            .iter()
            .filter_map(|&h| cat.objects.get(h))
            .map(|o| o.hi.len() + o.lo.len())
            .sum();

        if queued == 0 {
            for &h in unique.iter() {
                if let Some(object) = cat.objects.get_mut(h) {
                    object.pending = Some(request.clone());
                }
            }
        } else if queued > capacity {
            request.complete(Err(WmiError::BufferTooSmall { required: queued }));
        } else {
            let mut out = Vec::new();
            let mut last = None;
            cat.copy_from_event_queues(&unique, EventPriority::High, &mut out, &mut last);
            cat.copy_from_event_queues(&unique, EventPriority::Low, &mut out, &mut last);
            let chain = match last {
                Some(last) => wnode::set_linkage(&mut out[last..], 0).map(|()| out),
                None => Ok(out),
            };
            request.complete(chain);
        }
        Ok(ReceiveRequest { inner: request })
    }

    /// Cancel a pending receive and detach it from its objects
    pub fn cancel_receive(&self, request: &ReceiveRequest) {
        let mut cat = self.catalog.lock();
        request.inner.complete(Err(WmiError::InvalidHandle));
        cat.detach_pending(&request.inner);
    }

    /// Events dropped on an object's queue since its last drain
    pub fn events_lost(&self, handle: GuidObjectHandle, priority: EventPriority) -> Result<u32> {
        let cat = self.catalog.lock();
        let object = cat.objects.get(handle).ok_or(WmiError::InvalidHandle)?;
        Ok(object.queue(priority).events_lost())
    }

    // ========================================================================
    // Event pipeline
    // ========================================================================

    /// Fire an event on behalf of a provider
    pub fn fire_event(&self, provider_id: u32, record: &[u8], priority: EventPriority) -> Result<()> {
        let mut header = WnodeHeader::read_checked(record)?;
        let size = header.buffer_size as usize;
        if size > self.config.max_wnode_event_size {
            warn!(
                "WMI: provider {} fired a {} byte event for {}, limit is {}",
                provider_id, size, header.guid, self.config.max_wnode_event_size
            );
            return Err(WmiError::InvalidParameter("event exceeds maximum size"));
        }

        let mut event = Vec::new();
        event
            .try_reserve(size)
            .map_err(|_| WmiError::InsufficientResources)?;
        event.extend_from_slice(&record[..size]);
        header.provider_id = provider_id;
        header.linkage = 0;
        if !header.wnode_flags().contains(WnodeFlags::USE_TIMESTAMP) {
            header.timestamp = self.next_timestamp();
        }
        header.write(&mut event)?;
        self.process_event(event, priority)
    }

    /// Deliver a record to every object open on its guid
    pub(crate) fn process_event(&self, record: Vec<u8>, priority: EventPriority) -> Result<()> {
        let mut record = record;
        let mut header = WnodeHeader::read_checked(&record)?;
        if header.wnode_flags().contains(WnodeFlags::EVENT_REFERENCE) {
            record = self.dereference_event(&record, &header)?;
            header = WnodeHeader::read_checked(&record)?;
        }
        if header.wnode_flags().contains(WnodeFlags::STATIC_INSTANCE_NAMES) {
            record = self.include_static_names(record, &header);
        }
        WmiStats::bump(&self.stats.events_fired);

        let mut targets = Vec::new();
        let ge = {
            let mut cat = self.catalog.lock();
            let ge = cat
                .find_guid_entry(&header.guid, true)
                .ok_or(WmiError::GuidNotFound(header.guid))?;
            let objects = cat.guid_entries.get(ge).map(|e| e.objects.clone()).unwrap_or_default();
            for h in objects {
                if !cat.objects.reference(h) {
                    continue;
                }
                let target = match cat.objects.get(h) {
                    Some(o) if o.flags.contains(GuidObjectFlags::RECEIVE_NO_EVENTS) => Target::Skip,
                    Some(o) => match o.callback.clone() {
                        Some(callback) => Target::Callback(callback),
                        None => Target::Queue,
                    },
                    None => Target::Skip,
                };
                targets.push((h, target));
            }
            ge
        };

        for (h, target) in targets.iter() {
            match target {
                Target::Skip => {}
                Target::Callback(callback) => {
                    callback(&record);
                    WmiStats::bump(&self.stats.events_delivered);
                }
                Target::Queue => {
                    let delivery = self.catalog.lock().write_wnode_to_object(*h, &record, priority);
                    self.account_delivery(delivery);
                }
            }
        }

        let mut deferred = Deferred::new();
        {
            let mut cat = self.catalog.lock();
            for (h, _) in targets {
                cat.unreference_object(h, &mut deferred);
            }
            cat.unreference_guid_entry(ge, &mut deferred);
        }
        self.finish(deferred);
        Ok(())
    }

    pub(crate) fn account_delivery(&self, delivery: Result<Delivery>) {
        match delivery {
            Ok(Delivery::Completed) | Ok(Delivery::Queued) | Ok(Delivery::Requeued) => {
                WmiStats::bump(&self.stats.events_delivered)
            }
            Ok(Delivery::Lost) => WmiStats::bump(&self.stats.events_lost),
            Err(e) => debug!("WMI: event delivery failed: {}", e),
        }
    }

    /// Fill in instance names the provider left out of an event
    fn include_static_names(&self, record: Vec<u8>, header: &WnodeHeader) -> Vec<u8> {
        let mut deferred = Deferred::new();
        let names = {
            let mut cat = self.catalog.lock();
            match cat.find_guid_entry(&header.guid, false) {
                Some(ge) => {
                    let names = cat
                        .set_for_provider(ge, header.provider_id)
                        .and_then(|h| cat.instance_sets.get(h))
                        .and_then(|set| {
                            let pdo = set.flags.contains(InstanceSetFlags::PDO);
                            if header.wnode_flags().contains(WnodeFlags::ALL_DATA) {
                                Some((set.instance_names(), pdo))
                            } else {
                                let index = SingleInstanceView::parse(&record).ok()?.instance_index;
                                set.instance_name(index).map(|n| (alloc::vec![n], pdo))
                            }
                        });
                    cat.unreference_guid_entry(ge, &mut deferred);
                    names
                }
                None => None,
            }
        };
        self.finish(deferred);

        match names {
            Some((names, pdo)) => match wnode::include_instance_names(&record, &names, pdo) {
                Ok(named) => named,
                Err(e) => {
                    debug!("WMI: cannot include instance names for {}: {}", header.guid, e);
                    record
                }
            },
            None => record,
        }
    }

    /// Replace an event reference with the referenced instance's data
    fn dereference_event(&self, record: &[u8], header: &WnodeHeader) -> Result<Vec<u8>> {
        let target = EventReference::parse(record)?;
        let (provider_id, name) = {
            let mut cat = self.catalog.lock();
            let ge = cat
                .find_guid_entry(&target.target_guid, false)
                .ok_or(WmiError::GuidNotFound(target.target_guid))?;
            let found = cat
                .set_for_provider(ge, header.provider_id)
                .and_then(|h| cat.instance_sets.get(h))
                .map(|set| (set.provider_id, set.instance_name(target.target_instance_index)));
            let mut deferred = Deferred::new();
            cat.unreference_guid_entry(ge, &mut deferred);
            drop(cat);
            self.finish(deferred);
            found.ok_or(WmiError::InstanceNotFound)?
        };

        let request = wnode::single_instance(
            target.target_guid,
            provider_id,
            WnodeFlags::empty(),
            name.as_deref(),
            target.target_instance_index,
            &[],
        )?;
        let mut size = request.len() + target.target_data_size as usize;
        let mut attempt = 1;
        let mut buffer = loop {
            let mut buffer = request.clone();
            buffer.resize(size, 0);
            match self.query_provider(
                provider_id,
                RequestKind::QuerySingleInstance,
                &target.target_guid,
                &mut buffer,
            ) {
                Ok(used) => {
                    buffer.truncate(used);
                    break buffer;
                }
                Err(WmiError::BufferTooSmall { required }) if attempt < EVENT_REFERENCE_ATTEMPTS => {
                    trace!(
                        "WMI: reference to {} needs {} bytes, asking again",
                        target.target_guid,
                        required
                    );
                    size = request.len() + required;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        };

        let mut out_header = WnodeHeader::read_checked(&buffer)?;
        out_header.flags |= WnodeFlags::EVENT_ITEM.bits();
        out_header.timestamp = header.timestamp;
        out_header.linkage = 0;
        out_header.write(&mut buffer)?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WmiConfig;
    use crate::reginfo::{RegGuidSpec, RegInfoBuilder};
    use crate::testing::{drain, instance_set_count, wmi_with, wmi_with_config, RecordingTransport};
    use crate::wnode::{event_item, WNODE_HEADER_SIZE};
    use core::sync::atomic::{AtomicUsize, Ordering};

    const G: Guid = Guid::new(0x77, 0, 0, [0; 8]);
    const H: Guid = Guid::new(0x78, 0, 0, [0; 8]);
    const E: Guid = Guid::new(0x79, 0, 0, [0; 8]);

    fn fire(wmi: &Wmi, guid: Guid, priority: EventPriority, payload: &[u8]) {
        let record = event_item(guid, 0, WnodeFlags::empty(), payload).unwrap();
        wmi.fire_event(1, &record, priority).unwrap();
    }

    fn payload(record: &[u8]) -> &[u8] {
        let size = WnodeHeader::read(record).unwrap().buffer_size as usize;
        &record[WNODE_HEADER_SIZE..size]
    }

    fn register_names(transport: &RecordingTransport, wmi: &Wmi, provider_id: u32, guid: Guid) {
        let block = RegInfoBuilder::new()
            .guid(RegGuidSpec::new(guid, 0).with_names(["First", "Second"]))
            .build()
            .unwrap();
        transport.set_reginfo(provider_id, block);
        wmi.register_provider(provider_id).unwrap();
    }

    fn event(ts: i64, payload: &[u8]) -> Vec<u8> {
        let mut record = event_item(G, 1, WnodeFlags::empty(), payload).unwrap();
        wnode::set_timestamp(&mut record, ts).unwrap();
        record
    }

    #[test]
    fn test_queue_overflow_keeps_earlier_events() {
        let mut queue = EventQueue::new(256);
        let payload = [0xabu8; 52];
        assert!(queue.push(&event(1, &payload)));
        assert!(queue.push(&event(2, &payload)));
        // 2 x 104 bytes used, a third does not fit in 256
        assert!(!queue.push(&event(3, &payload)));
        assert!(!queue.push(&event(4, &payload)));
        assert_eq!(queue.events_lost(), 2);

        let records: Vec<_> = queue.records().collect::<Result<_>>().unwrap();
        assert_eq!(records.len(), 2);
        for (i, r) in records.iter().enumerate() {
            let header = WnodeHeader::read(r).unwrap();
            assert_eq!(header.timestamp, i as i64 + 1);
            assert_eq!(&r[wnode::WNODE_HEADER_SIZE..], &payload);
        }
    }

    #[test]
    fn test_queue_widens_for_large_first_event() {
        let mut queue = EventQueue::new(64);
        let big = event(1, &[0u8; 200]);
        assert!(queue.push(&big));
        assert_eq!(queue.len(), align8(big.len()));
        assert!(queue.push(&event(2, b"small")));
    }

    #[test]
    fn test_stamp_events_lost_resets_counter() {
        let mut queue = EventQueue::new(64);
        assert!(queue.push(&event(1, b"")));
        assert!(!queue.push(&event(2, &[0u8; 64])));
        queue.stamp_events_lost();
        assert_eq!(queue.events_lost(), 0);
        let first = queue.records().next().unwrap().unwrap();
        assert_eq!(wnode::events_lost(&WnodeHeader::read(first).unwrap()), 1);
    }

    #[test]
    fn test_queue_rejects_truncated_record() {
        let mut queue = EventQueue::new(256);
        assert!(!queue.push(&[0u8; 8]));
        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.events_lost(), 1);
        assert!(queue.push(&event(1, b"ok")));
    }

    #[test]
    fn test_pending_receive_completes_once() {
        let pending = PendingReceive::new(Vec::new(), 16);
        assert!(pending.complete(Ok(alloc::vec![1])));
        assert!(!pending.complete(Err(WmiError::InvalidHandle)));
        let request = ReceiveRequest {
            inner: Arc::new(pending),
        };
        assert_eq!(request.poll(), Some(Ok(alloc::vec![1])));
        assert_eq!(request.poll(), None);
        assert_eq!(request.wait(), Err(WmiError::InvalidHandle));
    }

    #[test]
    fn test_event_delivered_to_open_object() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let object = wmi.open_events(G).unwrap();
        let before = wmi.stats();

        fire(&wmi, G, EventPriority::High, b"abc");
        let records = drain(&wmi, &[object]);
        assert_eq!(records.len(), 1);
        let header = WnodeHeader::read(&records[0]).unwrap();
        assert_eq!(header.guid, G);
        assert_eq!(header.provider_id, 1);
        assert!(header.timestamp > 0);
        assert_eq!(header.linkage, 0);
        assert_eq!(payload(&records[0]), b"abc");

        let after = wmi.stats();
        assert_eq!(after.events_fired - before.events_fired, 1);
        assert_eq!(after.events_delivered - before.events_delivered, 1);
    }

    #[test]
    fn test_fire_rejects_unknown_guid_and_oversize_events() {
        let transport = RecordingTransport::new();
        let mut config = WmiConfig::new();
        config.max_wnode_event_size = 64;
        let wmi = wmi_with_config(&transport, config);

        let small = event_item(G, 0, WnodeFlags::empty(), b"x").unwrap();
        assert_eq!(wmi.fire_event(1, &small, EventPriority::High), Err(WmiError::GuidNotFound(G)));

        let _object = wmi.open_events(G).unwrap();
        let big = event_item(G, 0, WnodeFlags::empty(), &[0u8; 100]).unwrap();
        assert!(matches!(
            wmi.fire_event(1, &big, EventPriority::High),
            Err(WmiError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_provider_timestamp_kept() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let object = wmi.open_events(G).unwrap();

        let mut record = event_item(G, 0, WnodeFlags::USE_TIMESTAMP, b"t").unwrap();
        wnode::set_timestamp(&mut record, 123_456).unwrap();
        wmi.fire_event(1, &record, EventPriority::Low).unwrap();
        let records = drain(&wmi, &[object]);
        assert_eq!(WnodeHeader::read(&records[0]).unwrap().timestamp, 123_456);
    }

    #[test]
    fn test_pending_receive_completed_by_event() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let object = wmi.open_events(G).unwrap();

        let request = wmi.receive(&[object], 4096).unwrap();
        assert!(request.is_pending());
        fire(&wmi, G, EventPriority::Low, b"wake");
        let record = request.poll().unwrap().unwrap();
        assert_eq!(payload(&record), b"wake");
        assert!(drain(&wmi, &[object]).is_empty());
    }

    #[test]
    fn test_small_pending_receive_requeues_event() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let object = wmi.open_events(G).unwrap();

        let request = wmi.receive(&[object], 16).unwrap();
        fire(&wmi, G, EventPriority::High, b"too big for sixteen bytes");
        assert!(matches!(
            request.poll(),
            Some(Err(WmiError::BufferTooSmall { required })) if required > 16
        ));
        let records = drain(&wmi, &[object]);
        assert_eq!(records.len(), 1);
        assert_eq!(payload(&records[0]), b"too big for sixteen bytes");
    }

    #[test]
    fn test_receive_reports_size_of_queued_events() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let object = wmi.open_events(G).unwrap();
        fire(&wmi, G, EventPriority::High, &[1u8; 40]);

        let request = wmi.receive(&[object], 32).unwrap();
        assert_eq!(request.poll(), Some(Err(WmiError::BufferTooSmall { required: 88 })));
        assert_eq!(drain(&wmi, &[object]).len(), 1);
    }

    #[test]
    fn test_receive_merges_by_timestamp_high_first() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let a = wmi.open_events(G).unwrap();
        let b = wmi.open_events(H).unwrap();

        fire(&wmi, G, EventPriority::Low, b"1");
        fire(&wmi, H, EventPriority::High, b"2");
        fire(&wmi, G, EventPriority::High, b"3");
        fire(&wmi, H, EventPriority::Low, b"4");
        fire(&wmi, G, EventPriority::High, b"5");

        let records = drain(&wmi, &[a, b, a]);
        let order: Vec<&[u8]> = records.iter().map(|r| payload(r)).collect();
        assert_eq!(order, [&b"2"[..], &b"3"[..], &b"5"[..], &b"1"[..], &b"4"[..]]);
    }

    #[test]
    fn test_overflow_counts_lost_events() {
        let transport = RecordingTransport::new();
        let mut config = WmiConfig::new();
        config.max_event_buffer_size = 256;
        let wmi = wmi_with_config(&transport, config);
        let object = wmi.open_events(G).unwrap();
        let before = wmi.stats();

        for _ in 0..3 {
            fire(&wmi, G, EventPriority::High, &[7u8; 100]);
        }
        assert_eq!(wmi.events_lost(object, EventPriority::High), Ok(2));
        assert_eq!(wmi.stats().events_lost - before.events_lost, 2);

        let records = drain(&wmi, &[object]);
        assert_eq!(records.len(), 1);
        assert_eq!(wnode::events_lost(&WnodeHeader::read(&records[0]).unwrap()), 2);
        assert_eq!(wmi.events_lost(object, EventPriority::High), Ok(0));
    }

    #[test]
    fn test_close_fails_pending_receive() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let object = wmi.open_events(G).unwrap();
        let request = wmi.receive(&[object], 4096).unwrap();

        wmi.close(object).unwrap();
        assert_eq!(request.poll(), Some(Err(WmiError::InvalidHandle)));
        assert_eq!(wmi.close(object), Err(WmiError::InvalidHandle));
        assert!(wmi.receive(&[object], 4096).is_err());
        // The entry goes away with its last object
        assert_eq!(instance_set_count(&wmi, &G), None);
    }

    #[test]
    fn test_cancelled_receive_leaves_events_queued() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let object = wmi.open_events(G).unwrap();
        let request = wmi.receive(&[object], 4096).unwrap();

        wmi.cancel_receive(&request);
        assert_eq!(request.poll(), Some(Err(WmiError::InvalidHandle)));
        fire(&wmi, G, EventPriority::High, b"later");
        assert_eq!(drain(&wmi, &[object]).len(), 1);
    }

    #[test]
    fn test_new_receive_replaces_pending_one() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let object = wmi.open_events(G).unwrap();
        let first = wmi.receive(&[object], 4096).unwrap();
        let second = wmi.receive(&[object], 4096).unwrap();

        assert_eq!(first.poll(), Some(Err(WmiError::InvalidHandle)));
        fire(&wmi, G, EventPriority::High, b"x");
        assert!(matches!(second.poll(), Some(Ok(_))));
    }

    #[test]
    fn test_marked_object_receives_nothing() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let object = wmi.open_events(G).unwrap();
        let request = wmi.receive(&[object], 4096).unwrap();

        wmi.mark_handle_closed(object).unwrap();
        assert_eq!(request.poll(), Some(Err(WmiError::InvalidHandle)));
        fire(&wmi, G, EventPriority::High, b"dropped");
        assert!(drain(&wmi, &[object]).is_empty());
        wmi.close(object).unwrap();
    }

    #[test]
    fn test_kernel_notification_callback() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let object = wmi
            .open_kernel_notification(G, move |record| {
                assert_eq!(WnodeHeader::read(record).unwrap().guid, G);
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        fire(&wmi, G, EventPriority::High, b"a");
        fire(&wmi, G, EventPriority::Low, b"b");
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(wmi.receive(&[object], 4096).err(), Some(WmiError::InvalidHandle));
        wmi.close(object).unwrap();
    }

    #[test]
    fn test_static_names_filled_into_events() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        register_names(&transport, &wmi, 4, G);
        let object = wmi.open_events(G).unwrap();

        let record = wnode::single_instance(G, 0, WnodeFlags::EVENT_ITEM, None, 1, b"zz").unwrap();
        wmi.fire_event(4, &record, EventPriority::High).unwrap();
        let records = drain(&wmi, &[object]);
        let view = SingleInstanceView::parse(&records[0]).unwrap();
        assert_eq!(view.instance_name().unwrap().as_deref(), Some("Second"));
        assert!(!view.header.wnode_flags().contains(WnodeFlags::STATIC_INSTANCE_NAMES));
        assert_eq!(view.data().unwrap(), b"zz");
    }

    #[test]
    fn test_event_reference_replaced_by_instance_data() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        register_names(&transport, &wmi, 4, G);
        transport.set_instances(4, G, alloc::vec![b"refdata!".to_vec()]);
        let object = wmi.open_events(G).unwrap();

        let reference = wnode::event_reference(E, 0, G, 8, 0).unwrap();
        wmi.fire_event(4, &reference, EventPriority::High).unwrap();
        assert_eq!(transport.count_for(4, RequestKind::QuerySingleInstance, G), 1);

        let records = drain(&wmi, &[object]);
        assert_eq!(records.len(), 1);
        let view = SingleInstanceView::parse(&records[0]).unwrap();
        assert!(view.header.wnode_flags().contains(WnodeFlags::EVENT_ITEM));
        assert_eq!(view.instance_name().unwrap().as_deref(), Some("First"));
        assert_eq!(view.data().unwrap(), b"refdata!");
    }

    #[test]
    fn test_event_reference_with_short_size_hint() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        register_names(&transport, &wmi, 4, G);
        transport.set_instances(4, G, alloc::vec![b"refdata-longer-than-hint".to_vec()]);
        let object = wmi.open_events(G).unwrap();

        let reference = wnode::event_reference(E, 0, G, 2, 0).unwrap();
        wmi.fire_event(4, &reference, EventPriority::High).unwrap();
        assert_eq!(transport.count_for(4, RequestKind::QuerySingleInstance, G), 2);

        let records = drain(&wmi, &[object]);
        assert_eq!(records.len(), 1);
        let view = SingleInstanceView::parse(&records[0]).unwrap();
        assert_eq!(view.data().unwrap(), b"refdata-longer-than-hint");
    }

    #[test]
    fn test_close_during_enable_disables_providers() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);
        register_names(&transport, &wmi, 4, G);
        let closer = wmi.clone();
        transport.on_request(move |_, kind, _| {
            if kind != RequestKind::EnableEvents {
                return;
            }
            let object = {
                let cat = closer.catalog.lock();
                cat.guid_list
                    .iter()
                    .filter_map(|&h| cat.guid_entries.get(h))
                    .find(|e| e.guid == G)
                    .and_then(|e| e.objects.first().copied())
            };
            closer.close(object.unwrap()).unwrap();
        });

        let object = wmi.open_events(G).unwrap();
        assert_eq!(
            transport.enable_sequence(),
            alloc::vec![RequestKind::EnableEvents, RequestKind::DisableEvents]
        );
        assert_eq!(wmi.close(object), Err(WmiError::InvalidHandle));
        let info = wmi.enumerate_guids().into_iter().find(|i| i.guid == G).unwrap();
        assert!(!info.events_enabled);
    }

    #[test]
    fn test_concurrent_fire_and_close() {
        let transport = RecordingTransport::new();
        let wmi = wmi_with(&transport);

        let firer = {
            let wmi = wmi.clone();
            std::thread::spawn(move || {
                for i in 0..500u32 {
                    let record = event_item(G, 0, WnodeFlags::empty(), &i.to_le_bytes()).unwrap();
                    let _ = wmi.fire_event(1, &record, EventPriority::High);
                }
            })
        };
        let closers: Vec<_> = (0..2)
            .map(|_| {
                let wmi = wmi.clone();
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let object = wmi.open_events(G).unwrap();
                        let _request = wmi.receive(&[object], 4096).unwrap();
                        wmi.close(object).unwrap();
                    }
                })
            })
            .collect();
        firer.join().unwrap();
        for closer in closers {
            closer.join().unwrap();
        }

        let cat = wmi.catalog.lock();
        assert_eq!(cat.objects.live_count(), 0);
        assert!(cat
            .guid_list
            .iter()
            .filter_map(|&h| cat.guid_entries.get(h))
            .all(|e| e.guid != G));
    }
}
