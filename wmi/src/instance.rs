//! Instance Sets
//!
//! An instance set is one data source's contribution of instances to one
//! guid. Its naming mode is fixed when it is built:
//!
//! - **Static names**: an explicit list, one name per instance.
//! - **Base name**: `<base><index>` for `first_index..first_index+count`.
//!   When several providers share a base name for the same guid, each new
//!   set continues numbering after the highest index already in use.
//! - **Dynamic**: the provider names instances itself (or has none).
//!
//! Static names that collide with a name already exposed for the same
//! guid get a short alphabetic suffix (`A`..`Z`, then `AA`..`ZZ` and so on)
//! up to a configurable length; if every suffix is taken the set is
//! rejected with [`WmiError::NameCollision`].

use crate::catalog::{DataSourceHandle, GuidEntryHandle};
use crate::error::{Result, WmiError};
use crate::guid::Guid;
use crate::reginfo::{RegFlags, RegNaming, WmiRegGuid};
use alloc::format;
use alloc::string::String;
use alloc::vec::Vec;

bitflags::bitflags! {
    /// Instance set flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct InstanceSetFlags: u32 {
        /// Collection must be explicitly enabled
        const EXPENSIVE = 0x0000_0001;
        /// Guid is traced
        const TRACED = 0x0000_0002;
        /// Guid controls a trace provider
        const CONTROL_GUID = 0x0000_0004;
        /// Guid only fires events
        const EVENT_ONLY = 0x0000_0008;
        /// Base name is a device PDO name
        const PDO = 0x0000_0010;
        /// Provider has been told to fire events
        const ENABLE_EVENT = 0x0000_0100;
        /// Provider has been told to collect
        const ENABLE_COLLECTION = 0x0000_0200;
        /// Provider has been told to trace
        const TRACE_ENABLED = 0x0000_0400;
        /// Built by the current registration pass
        const NEWLY_REGISTERED = 0x0000_1000;
        /// Served by the core itself
        const INTERNAL = 0x0000_2000;
    }
}

impl InstanceSetFlags {
    /// Bits that track runtime state rather than registration content
    pub const STATE: Self = Self::ENABLE_EVENT
        .union(Self::ENABLE_COLLECTION)
        .union(Self::TRACE_ENABLED)
        .union(Self::NEWLY_REGISTERED);
}

/// How instance names are produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceNaming {
    StaticNames(Vec<String>),
    BaseName { base: String, first_index: u32 },
    Dynamic,
}

/// One provider's instances of one guid
#[derive(Debug, Clone)]
pub struct InstanceSet {
    pub guid: Guid,
    pub provider_id: u32,
    pub count: u32,
    pub flags: InstanceSetFlags,
    pub naming: InstanceNaming,
    /// Owning data source; holds a reference while set
    pub data_source: Option<DataSourceHandle>,
    /// Guid entry this set is linked into; holds a reference while set
    pub guid_entry: Option<GuidEntryHandle>,
}

impl InstanceSet {
    pub fn is_traced(&self) -> bool {
        self.flags.contains(InstanceSetFlags::TRACED)
    }

    pub fn is_event_only(&self) -> bool {
        self.flags.contains(InstanceSetFlags::EVENT_ONLY)
    }

    pub fn has_static_names(&self) -> bool {
        !matches!(self.naming, InstanceNaming::Dynamic)
    }

    /// Name of instance `index` (relative to this set)
    pub fn instance_name(&self, index: u32) -> Option<String> {
        if index >= self.count {
            return None;
        }
        match &self.naming {
            InstanceNaming::StaticNames(names) => names.get(index as usize).cloned(),
            InstanceNaming::BaseName { base, first_index } => {
                Some(format!("{}{}", base, first_index + index))
            }
            InstanceNaming::Dynamic => None,
        }
    }

    /// All names, empty for dynamic sets
    pub fn instance_names(&self) -> Vec<String> {
        (0..self.count).filter_map(|i| self.instance_name(i)).collect()
    }

    /// Map an instance name back to its index within this set
    pub fn find_instance(&self, name: &str) -> Option<u32> {
        match &self.naming {
            InstanceNaming::StaticNames(names) => {
                names.iter().position(|n| n == name).map(|i| i as u32)
            }
            InstanceNaming::BaseName { base, first_index } => {
                let digits = name.strip_prefix(base.as_str())?;
                if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                    return None;
                }
                // Reject "Dev01"-style aliases of "Dev1"
                if digits.len() > 1 && digits.starts_with('0') {
                    return None;
                }
                let index: u32 = digits.parse().ok()?;
                let relative = index.checked_sub(*first_index)?;
                (relative < self.count).then_some(relative)
            }
            InstanceNaming::Dynamic => None,
        }
    }

    /// Registration-level equality, ignoring runtime enable state.
    ///
    /// An update that produces an equal set leaves the registered one in
    /// place.
    pub fn is_equal(&self, other: &InstanceSet) -> bool {
        if (self.flags - InstanceSetFlags::STATE) != (other.flags - InstanceSetFlags::STATE) {
            return false;
        }
        match (&self.naming, &other.naming) {
            (
                InstanceNaming::BaseName { base: a, .. },
                InstanceNaming::BaseName { base: b, .. },
            ) => self.count == other.count && a == b,
            (InstanceNaming::StaticNames(a), InstanceNaming::StaticNames(b)) => {
                self.count == other.count && a == b
            }
            (InstanceNaming::Dynamic, InstanceNaming::Dynamic) => true,
            _ => false,
        }
    }
}

/// Next free index for `base` among the peer sets of a guid
pub fn determine_base_index<'a, I>(peers: I, base: &str) -> u32
where
    I: IntoIterator<Item = &'a InstanceSet>,
{
    peers
        .into_iter()
        .filter_map(|set| match &set.naming {
            InstanceNaming::BaseName {
                base: b,
                first_index,
            } if b == base => Some(first_index + set.count),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

fn name_taken<'a, I>(peers: I, name: &str) -> bool
where
    I: IntoIterator<Item = &'a InstanceSet>,
{
    peers.into_iter().any(|set| set.find_instance(name).is_some())
}

/// Produce a name not used by any peer set or by `taken`.
///
/// Suffixes are enumerated as a base-26 counter over `A`..`Z` of length
/// 1 up to `max_suffix_len`.
pub fn mangle_instance_name<'a, I>(
    peers: I,
    taken: &[String],
    name: &str,
    max_suffix_len: usize,
) -> Result<String>
where
    I: IntoIterator<Item = &'a InstanceSet> + Clone,
{
    let collides = |candidate: &str| {
        taken.iter().any(|t| t == candidate) || name_taken(peers.clone(), candidate)
    };
    if !collides(name) {
        return Ok(String::from(name));
    }

    let mut suffix: Vec<u8> = Vec::new();
    loop {
        // Increment the counter, growing by one letter on wrap
        let mut pos = suffix.len();
        loop {
            if pos == 0 {
                if suffix.len() == max_suffix_len {
                    return Err(WmiError::NameCollision);
                }
                suffix.insert(0, b'A');
                break;
            }
            pos -= 1;
            if suffix[pos] == b'Z' {
                suffix[pos] = b'A';
            } else {
                suffix[pos] += 1;
                break;
            }
        }

        let mut candidate = String::from(name);
        candidate.extend(suffix.iter().map(|&c| c as char));
        if !collides(&candidate) {
            return Ok(candidate);
        }
    }
}

/// Build an instance set from one validated registration record.
///
/// `peers` are the sets already exposing this guid (excluding any set the
/// new one replaces); they drive collision mangling and base index
/// continuation.
pub fn build_instance_set<'a, I>(
    reg: &WmiRegGuid,
    naming: RegNaming,
    provider_id: u32,
    peers: I,
    max_suffix_len: usize,
) -> Result<InstanceSet>
where
    I: IntoIterator<Item = &'a InstanceSet> + Clone,
{
    let reg_flags = reg.reg_flags();
    let mut flags = InstanceSetFlags::NEWLY_REGISTERED;
    if reg_flags.contains(RegFlags::EXPENSIVE) {
        flags |= InstanceSetFlags::EXPENSIVE;
    }
    if reg_flags.contains(RegFlags::TRACED_GUID) {
        flags |= InstanceSetFlags::TRACED;
        if reg_flags.contains(RegFlags::TRACE_CONTROL_GUID) {
            flags |= InstanceSetFlags::CONTROL_GUID;
        }
    }
    if reg_flags.contains(RegFlags::EVENT_ONLY_GUID) {
        flags |= InstanceSetFlags::EVENT_ONLY;
    }

    let (count, naming) = match naming {
        RegNaming::List(names) => {
            if names.len() != reg.instance_count as usize {
                return Err(WmiError::InvalidParameter("instance name count mismatch"));
            }
            let mut mangled: Vec<String> = Vec::new();
            mangled
                .try_reserve(names.len())
                .map_err(|_| WmiError::InsufficientResources)?;
            for name in names {
                let unique = mangle_instance_name(peers.clone(), &mangled, &name, max_suffix_len)?;
                mangled.push(unique);
            }
            (reg.instance_count, InstanceNaming::StaticNames(mangled))
        }
        RegNaming::BaseName { base, pdo } => {
            if pdo {
                flags |= InstanceSetFlags::PDO;
            }
            let first_index = determine_base_index(peers, &base);
            first_index
                .checked_add(reg.instance_count)
                .ok_or(WmiError::InvalidParameter("instance index overflows"))?;
            (reg.instance_count, InstanceNaming::BaseName { base, first_index })
        }
        RegNaming::Dynamic => (reg.instance_count, InstanceNaming::Dynamic),
    };

    Ok(InstanceSet {
        guid: reg.guid,
        provider_id,
        count,
        flags,
        naming,
        data_source: None,
        guid_entry: None,
    })
}
