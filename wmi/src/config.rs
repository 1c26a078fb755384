//! WMI Configuration
//!
//! Tunables for the WMI core. The defaults match the classic kernel
//! values; embedders override individual fields before calling
//! [`Wmi::new`](crate::Wmi::new).

/// Default per-queue consumer buffer (4KB)
pub const DEFAULT_MAX_EVENT_BUFFER_SIZE: usize = 0x1000;

/// Queue size used when the first queued event is larger than the bound
pub const LARGE_EVENT_BUFFER_SIZE: usize = 0x10000;

/// Largest event a provider may fire (64KB)
pub const DEFAULT_MAX_WNODE_EVENT_SIZE: usize = 0x10000;

/// First buffer size used to fetch a registration blob
pub const INITIAL_REGINFO_SIZE: usize = 8192;

/// Longest suffix appended to resolve an instance name collision
pub const MAX_BASE_NAME_SUFFIX_LENGTH: usize = 6;

/// Slots per chunk for each catalog object kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizes {
    pub guid_entries: usize,
    pub instance_sets: usize,
    pub data_sources: usize,
    pub mof_resources: usize,
    pub guid_objects: usize,
}

impl ChunkSizes {
    pub const fn new() -> Self {
        Self {
            guid_entries: 32,
            instance_sets: 32,
            data_sources: 16,
            mof_resources: 8,
            guid_objects: 16,
        }
    }
}

impl Default for ChunkSizes {
    fn default() -> Self {
        Self::new()
    }
}

/// WMI core configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WmiConfig {
    /// Bound on each consumer object's hi and lo event queue
    pub max_event_buffer_size: usize,
    /// Events larger than this are refused at fire time
    pub max_wnode_event_size: usize,
    /// Initial buffer for fetching provider registration info
    pub initial_reginfo_size: usize,
    /// Chunk pool geometry
    pub chunk_slots: ChunkSizes,
    /// Bound on instance name mangling suffixes
    pub max_name_suffix_len: usize,
}

impl WmiConfig {
    pub const fn new() -> Self {
        Self {
            max_event_buffer_size: DEFAULT_MAX_EVENT_BUFFER_SIZE,
            max_wnode_event_size: DEFAULT_MAX_WNODE_EVENT_SIZE,
            initial_reginfo_size: INITIAL_REGINFO_SIZE,
            chunk_slots: ChunkSizes::new(),
            max_name_suffix_len: MAX_BASE_NAME_SUFFIX_LENGTH,
        }
    }
}

impl Default for WmiConfig {
    fn default() -> Self {
        Self::new()
    }
}
