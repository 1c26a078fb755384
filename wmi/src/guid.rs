//! GUIDs
//!
//! Every data block, event class and internal notification in WMI is
//! named by a 128-bit GUID. The on-wire encoding is the little-endian
//! Windows layout used by WNODE headers and registration blobs.

use core::fmt;

/// Size of an encoded GUID
pub const GUID_SIZE: usize = 16;

/// 128-bit identifier for a schema class or event
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

impl Guid {
    pub const fn new(data1: u32, data2: u16, data3: u16, data4: [u8; 8]) -> Self {
        Self {
            data1,
            data2,
            data3,
            data4,
        }
    }

    pub const fn zero() -> Self {
        Self::new(0, 0, 0, [0; 8])
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::zero()
    }

    /// Decode a GUID from its 16-byte wire form.
    ///
    /// Returns `None` when fewer than 16 bytes are available.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let data = data.get(..GUID_SIZE)?;
        let mut data4 = [0u8; 8];
        data4.copy_from_slice(&data[8..16]);
        Some(Self {
            data1: u32::from_le_bytes([data[0], data[1], data[2], data[3]]),
            data2: u16::from_le_bytes([data[4], data[5]]),
            data3: u16::from_le_bytes([data[6], data[7]]),
            data4,
        })
    }

    /// Encode to the 16-byte wire form
    pub fn to_bytes(&self) -> [u8; GUID_SIZE] {
        let mut out = [0u8; GUID_SIZE];
        out[0..4].copy_from_slice(&self.data1.to_le_bytes());
        out[4..6].copy_from_slice(&self.data2.to_le_bytes());
        out[6..8].copy_from_slice(&self.data3.to_le_bytes());
        out[8..16].copy_from_slice(&self.data4);
        out
    }
}

impl PartialOrd for Guid {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Guid {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.data1
            .cmp(&other.data1)
            .then(self.data2.cmp(&other.data2))
            .then(self.data3.cmp(&other.data3))
            .then(self.data4.cmp(&other.data4))
    }
}

/// Registry format: `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx`
impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-",
            self.data1, self.data2, self.data3, self.data4[0], self.data4[1]
        )?;
        for b in &self.data4[2..] {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

// ============================================================================
// Well-known GUIDs
// ============================================================================

/// MSWmi_GuidRegistrationInfo: guid add/remove/update notifications
pub const GUID_REGISTRATION_INFO: Guid = Guid::new(
    0xb48d49a1,
    0xe777,
    0x11d0,
    [0xa5, 0x0c, 0x00, 0xa0, 0xc9, 0x06, 0x29, 0x10],
);

/// Fired when a new MOF resource becomes known
pub const GUID_MOF_RESOURCE_ADDED: Guid = Guid::new(
    0xb48d49a2,
    0xe777,
    0x11d0,
    [0xa5, 0x0c, 0x00, 0xa0, 0xc9, 0x06, 0x29, 0x10],
);

/// Fired when the last reference to a MOF resource goes away
pub const GUID_MOF_RESOURCE_REMOVED: Guid = Guid::new(
    0xb48d49a3,
    0xe777,
    0x11d0,
    [0xa5, 0x0c, 0x00, 0xa0, 0xc9, 0x06, 0x29, 0x10],
);

/// Instances of this guid name binary MOF resources
pub const BINARY_MOF_GUID: Guid = Guid::new(
    0x05901221,
    0xd566,
    0x11d1,
    [0xb2, 0xf0, 0x00, 0xa0, 0xc9, 0x06, 0x29, 0x10],
);

/// Internal: instance name information
pub const INSTANCE_INFO_GUID: Guid = Guid::new(
    0xc7bf35d2,
    0xaadb,
    0x11d1,
    [0xbf, 0x4a, 0x00, 0xa0, 0xc9, 0x06, 0x29, 0x10],
);

/// Internal: guid enumeration
pub const ENUMERATE_GUIDS_GUID: Guid = Guid::new(
    0xe3dff7bd,
    0x3915,
    0x11d2,
    [0x91, 0x03, 0x00, 0xc0, 0x4f, 0xb9, 0x98, 0xa2],
);
