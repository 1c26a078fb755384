//! Mailbox Requests
//!
//! A consumer can post a message to every user-mode provider of a guid.
//! The message lands on each provider's request object as an internal
//! record. If the sender supplied a reply object, the request object holds
//! it in one of [`MAX_REPLY_SLOTS`] slots and the slot index travels in
//! the record's `version` field; the provider answers through
//! [`Wmi::mb_reply`] with that index.
//!
//! ```text
//! sender ── write_message_to_guid ──► request object [slot n ─► reply]
//!                                          │
//! reply object ◄──── mb_reply(n) ──────────┘
//! ```
//!
//! A request object that dies with replies outstanding sends each reply
//! object a record with action [`ACTION_REQUEST_DIED`].

use crate::catalog::{Catalog, Deferred, GuidObjectHandle};
use crate::consumer::{Delivery, EventPriority, ObjectKind, MAX_REPLY_SLOTS};
use crate::error::{Result, WmiError};
use crate::guid::Guid;
use crate::wnode;
use crate::Wmi;
use alloc::vec::Vec;
use log::{debug, trace};

/// Action code of a mailbox message record
pub const ACTION_MB_REQUEST: u32 = 0x20;

/// Action code sent to reply objects whose request object went away
pub const ACTION_REQUEST_DIED: u32 = 0x21;

impl Catalog {
    /// Wrap `message` in an internal record and queue it on `target`,
    /// linking `reply` into a free slot first
    pub(crate) fn write_mb_to_object(
        &mut self,
        target: GuidObjectHandle,
        reply: Option<GuidObjectHandle>,
        message: &[u8],
        deferred: &mut Deferred,
    ) -> Result<()> {
        let object = self.objects.get(target).ok_or(WmiError::InvalidHandle)?;
        if object.is_closed() {
            return Err(WmiError::InvalidHandle);
        }
        let guid = object.guid;

        let slot = match reply {
            Some(reply) => {
                let slot = object
                    .reply_slots
                    .iter()
                    .position(|s| s.is_none())
                    .ok_or(WmiError::InsufficientResources)?;
                let usable = self.objects.get(reply).is_some_and(|r| !r.is_closed());
                if !usable || !self.objects.reference(reply) {
                    return Err(WmiError::InvalidHandle);
                }
                if let Some(object) = self.objects.get_mut(target) {
                    object.reply_slots[slot] = Some(reply);
                }
                if let Some(r) = self.objects.get_mut(reply) {
                    r.linked_requests.push((target, slot));
                }
                Some((reply, slot))
            }
            None => None,
        };

        let version = slot.map_or(0, |(_, s)| s as u32);
        let delivery = wnode::internal(guid, ACTION_MB_REQUEST, version, message)
            .and_then(|record| self.write_wnode_to_object(target, &record, EventPriority::High));
        let result = match delivery {
            Ok(Delivery::Lost) => Err(WmiError::InsufficientResources),
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };

        if result.is_err() {
            if let Some((reply, slot)) = slot {
                if let Some(object) = self.objects.get_mut(target) {
                    object.reply_slots[slot] = None;
                }
                if let Some(r) = self.objects.get_mut(reply) {
                    r.linked_requests.retain(|&(req, s)| !(req == target && s == slot));
                }
                self.unreference_object(reply, deferred);
            }
        }
        result
    }
}

impl Wmi {
    /// Post `message` to the request object of every user-mode provider
    /// of `guid`. Returns how many providers it reached.
    pub fn write_message_to_guid(
        &self,
        guid: Guid,
        reply: Option<GuidObjectHandle>,
        message: &[u8],
    ) -> Result<usize> {
        let mut deferred = Deferred::new();
        let result = {
            let mut cat = self.catalog.lock();
            let ge = cat
                .find_guid_entry(&guid, false)
                .ok_or(WmiError::GuidNotFound(guid))?;
            let mut targets: Vec<GuidObjectHandle> = Vec::new();
            if let Some(entry) = cat.guid_entries.get(ge) {
                for &h in entry.instance_sets.iter() {
                    let request = cat
                        .instance_sets
                        .get(h)
                        .and_then(|set| set.data_source)
                        .and_then(|ds| cat.data_sources.get(ds))
                        .filter(|ds| ds.is_user_mode())
                        .and_then(|ds| ds.request_object);
                    if let Some(request) = request {
                        if !targets.contains(&request) {
                            targets.push(request);
                        }
                    }
                }
            }

            let mut written = 0;
            let mut first_error = None;
            for target in targets {
                match cat.write_mb_to_object(target, reply, message, &mut deferred) {
                    Ok(()) => written += 1,
                    Err(e) => {
                        debug!("WMI: mailbox write to {:?} failed: {}", target, e);
                        first_error.get_or_insert(e);
                    }
                }
            }
            cat.unreference_guid_entry(ge, &mut deferred);

            if written > 0 {
                Ok(written)
            } else {
                Err(first_error.unwrap_or(WmiError::NoUserProviders(guid)))
            }
        };
        self.finish(deferred);
        result
    }

    /// Route a provider's answer to the reply object in `slot`
    pub fn mb_reply(&self, request: GuidObjectHandle, slot: usize, message: &[u8]) -> Result<()> {
        if slot >= MAX_REPLY_SLOTS {
            return Err(WmiError::InvalidParameter("reply slot out of range"));
        }
        let mut deferred = Deferred::new();
        let result = {
            let mut cat = self.catalog.lock();
            let object = cat.objects.get_mut(request).ok_or(WmiError::InvalidHandle)?;
            if object.kind != ObjectKind::Request {
                return Err(WmiError::InvalidHandle);
            }
            let reply = object.reply_slots[slot]
                .take()
                .ok_or(WmiError::InvalidParameter("reply slot is empty"))?;
            if let Some(r) = cat.objects.get_mut(reply) {
                r.linked_requests.retain(|&(req, s)| !(req == request && s == slot));
            }
            let result = cat.write_mb_to_object(reply, None, message, &mut deferred);
            cat.unreference_object(reply, &mut deferred);
            result
        };
        self.finish(deferred);
        trace!("WMI: reply slot {} of {:?} answered", slot, request);
        result
    }
}
