//! WNODE Wire Records
//!
//! A WNODE is the self-describing record exchanged between the WMI core,
//! providers and consumers. Every record starts with a fixed 48-byte
//! [`WnodeHeader`]; the flags word selects the payload layout:
//!
//! ```text
//! WNODE_ALL_DATA          header | DataBlockOffset InstanceCount
//!                                  OffsetInstanceNameOffsets FixedInstanceSize
//!                                  (or OffsetInstanceDataAndLength[count])
//! WNODE_SINGLE_INSTANCE   header | OffsetInstanceName InstanceIndex
//!                                  DataBlockOffset SizeDataBlock
//! WNODE_METHOD_ITEM       header | OffsetInstanceName InstanceIndex MethodId
//!                                  DataBlockOffset SizeDataBlock
//! WNODE_EVENT_ITEM        header | opaque payload
//! WNODE_EVENT_REFERENCE   header | TargetGuid TargetDataBlockSize
//!                                  TargetInstanceIndex
//! WNODE_TOO_SMALL         header | SizeNeeded
//! ```
//!
//! Records are chained by the header `linkage` field, which holds the
//! byte distance to the next record (0 terminates the chain). Instance
//! names are counted strings: a u16 byte length followed by UTF-16LE.
//! All multi-byte fields are little-endian.

use crate::error::{Result, WmiError};
use crate::guid::{Guid, GUID_SIZE};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use static_assertions::const_assert_eq;

/// Round up to the 8-byte record alignment
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

// ============================================================================
// Header
// ============================================================================

bitflags::bitflags! {
    /// WNODE header flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct WnodeFlags: u32 {
        /// Data for all instances
        const ALL_DATA = 0x0000_0001;
        /// Data for one instance
        const SINGLE_INSTANCE = 0x0000_0002;
        /// One data item of one instance
        const SINGLE_ITEM = 0x0000_0004;
        /// Record is an event
        const EVENT_ITEM = 0x0000_0008;
        /// All instances in an ALL_DATA record have the same size
        const FIXED_INSTANCE_SIZE = 0x0000_0010;
        /// WNODE_TOO_SMALL
        const TOO_SMALL = 0x0000_0020;
        /// Instance names unchanged since last query
        const INSTANCES_SAME = 0x0000_0040;
        /// Provider left instance names for WMI to fill in
        const STATIC_INSTANCE_NAMES = 0x0000_0080;
        /// Internal record generated by the core
        const INTERNAL = 0x0000_0100;
        /// Provider supplied its own timestamp
        const USE_TIMESTAMP = 0x0000_0200;
        const PERSIST_EVENT = 0x0000_0400;
        /// Event names data the consumer must fetch
        const EVENT_REFERENCE = 0x0000_2000;
        const ANSI_INSTANCENAMES = 0x0000_4000;
        const METHOD_ITEM = 0x0000_8000;
        /// Instance names are device PDO names
        const PDO_INSTANCE_NAMES = 0x0001_0000;
        const SEVERITY_MASK = 0xff00_0000;
    }
}

/// WNODE_HEADER
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WnodeHeader {
    /// Size of the whole record including this header
    pub buffer_size: u32,
    /// Provider id, or an action code on internal records
    pub provider_id: u32,
    /// Low word: version; high word: events lost before this record
    pub version: u32,
    /// Distance to the next chained record, 0 when last
    pub linkage: u32,
    pub timestamp: i64,
    pub guid: Guid,
    pub client_context: u32,
    pub flags: u32,
}

const_assert_eq!(core::mem::size_of::<WnodeHeader>(), 48);
const_assert_eq!(core::mem::size_of::<Guid>(), GUID_SIZE);

pub const WNODE_HEADER_SIZE: usize = 48;
/// Fixed part of WNODE_ALL_DATA
pub const WNODE_ALL_DATA_SIZE: usize = 64;
/// Fixed part of WNODE_SINGLE_INSTANCE
pub const WNODE_SINGLE_INSTANCE_SIZE: usize = 64;
/// Fixed part of WNODE_METHOD_ITEM
pub const WNODE_METHOD_ITEM_SIZE: usize = 72;
/// WNODE_EVENT_REFERENCE carrying an instance index
pub const WNODE_EVENT_REFERENCE_SIZE: usize = 72;
/// WNODE_TOO_SMALL, padded to the header alignment
pub const WNODE_TOO_SMALL_SIZE: usize = 56;

// Payload field offsets
const ALL_DATA_DATA_BLOCK_OFFSET: usize = 48;
const ALL_DATA_INSTANCE_COUNT: usize = 52;
const ALL_DATA_NAME_OFFSETS: usize = 56;
const ALL_DATA_FIXED_SIZE: usize = 60;
const SI_OFFSET_INSTANCE_NAME: usize = 48;
const SI_INSTANCE_INDEX: usize = 52;
const SI_DATA_BLOCK_OFFSET: usize = 56;
const SI_SIZE_DATA_BLOCK: usize = 60;
const MI_METHOD_ID: usize = 56;
const MI_DATA_BLOCK_OFFSET: usize = 60;
const MI_SIZE_DATA_BLOCK: usize = 64;
const ER_TARGET_GUID: usize = 48;
const ER_TARGET_SIZE: usize = 64;
const ER_TARGET_INDEX: usize = 68;
const TS_SIZE_NEEDED: usize = 48;

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> Result<u32> {
    let bytes = buf
        .get(offset..offset + 4)
        .ok_or(WmiError::InvalidParameter("field past end of record"))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

pub(crate) fn write_u32(buf: &mut [u8], offset: usize, value: u32) -> Result<()> {
    let bytes = buf
        .get_mut(offset..offset + 4)
        .ok_or(WmiError::InvalidParameter("field past end of record"))?;
    bytes.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16> {
    let bytes = buf
        .get(offset..offset + 2)
        .ok_or(WmiError::InvalidParameter("field past end of record"))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn to_u32(n: usize) -> Result<u32> {
    u32::try_from(n).map_err(|_| WmiError::InvalidParameter("record exceeds 4GB"))
}

impl WnodeHeader {
    pub fn new(guid: Guid, provider_id: u32, flags: WnodeFlags) -> Self {
        Self {
            buffer_size: WNODE_HEADER_SIZE as u32,
            provider_id,
            guid,
            flags: flags.bits(),
            ..Self::default()
        }
    }

    pub fn wnode_flags(&self) -> WnodeFlags {
        WnodeFlags::from_bits_retain(self.flags)
    }

    /// Decode the header at the start of `buf`
    pub fn read(buf: &[u8]) -> Result<Self> {
        if buf.len() < WNODE_HEADER_SIZE {
            return Err(WmiError::InvalidParameter("record shorter than header"));
        }
        let mut ts = [0u8; 8];
        ts.copy_from_slice(&buf[16..24]);
        Ok(Self {
            buffer_size: read_u32(buf, 0)?,
            provider_id: read_u32(buf, 4)?,
            version: read_u32(buf, 8)?,
            linkage: read_u32(buf, 12)?,
            timestamp: i64::from_le_bytes(ts),
            guid: Guid::from_bytes(&buf[24..40])
                .ok_or(WmiError::InvalidParameter("record shorter than header"))?,
            client_context: read_u32(buf, 40)?,
            flags: read_u32(buf, 44)?,
        })
    }

    /// Decode a header and check `buffer_size` against the slice
    pub fn read_checked(buf: &[u8]) -> Result<Self> {
        let header = Self::read(buf)?;
        let size = header.buffer_size as usize;
        if size < WNODE_HEADER_SIZE || size > buf.len() {
            return Err(WmiError::InvalidParameter("bad record size"));
        }
        Ok(header)
    }

    /// Encode into the first 48 bytes of `buf`
    pub fn write(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < WNODE_HEADER_SIZE {
            return Err(WmiError::BufferTooSmall {
                required: WNODE_HEADER_SIZE,
            });
        }
        write_u32(buf, 0, self.buffer_size)?;
        write_u32(buf, 4, self.provider_id)?;
        write_u32(buf, 8, self.version)?;
        write_u32(buf, 12, self.linkage)?;
        buf[16..24].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[24..40].copy_from_slice(&self.guid.to_bytes());
        write_u32(buf, 40, self.client_context)?;
        write_u32(buf, 44, self.flags)
    }
}

pub fn set_linkage(record: &mut [u8], linkage: u32) -> Result<()> {
    write_u32(record, 12, linkage)
}

pub fn set_timestamp(record: &mut [u8], timestamp: i64) -> Result<()> {
    let field = record
        .get_mut(16..24)
        .ok_or(WmiError::InvalidParameter("record shorter than header"))?;
    field.copy_from_slice(&timestamp.to_le_bytes());
    Ok(())
}

/// Stash a lost-event count in the high word of `version`
pub fn set_events_lost(record: &mut [u8], lost: u32) -> Result<()> {
    let version = read_u32(record, 8)?;
    let lost = lost.min(0xffff);
    write_u32(record, 8, (version & 0xffff) | (lost << 16))
}

pub fn events_lost(header: &WnodeHeader) -> u32 {
    header.version >> 16
}

// ============================================================================
// Counted strings
// ============================================================================

/// Append a counted UTF-16LE string
pub fn write_counted_string(out: &mut Vec<u8>, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let bytes = u16::try_from(units.len() * 2)
        .map_err(|_| WmiError::InvalidParameter("string longer than 64KB"))?;
    out.extend_from_slice(&bytes.to_le_bytes());
    for unit in units {
        out.extend_from_slice(&unit.to_le_bytes());
    }
    Ok(())
}

/// Encoded size of a counted string
pub fn counted_string_size(s: &str) -> usize {
    2 + s.encode_utf16().count() * 2
}

/// Decode the counted string at `offset`. Returns the string and the
/// number of bytes it occupied.
pub fn read_counted_string(buf: &[u8], offset: usize) -> Result<(String, usize)> {
    let len = read_u16(buf, offset)? as usize;
    if len % 2 != 0 {
        return Err(WmiError::InvalidParameter("odd string length"));
    }
    let body = buf
        .get(offset + 2..offset + 2 + len)
        .ok_or(WmiError::InvalidParameter("string runs past buffer"))?;
    let units = body.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]]));
    let s = char::decode_utf16(units)
        .collect::<core::result::Result<String, _>>()
        .map_err(|_| WmiError::InvalidParameter("string is not UTF-16"))?;
    Ok((s, 2 + len))
}

fn pad_to(buf: &mut Vec<u8>, align: usize) {
    while buf.len() % align != 0 {
        buf.push(0);
    }
}

fn finish(mut record: Vec<u8>, header: &mut WnodeHeader) -> Result<Vec<u8>> {
    header.buffer_size = to_u32(record.len())?;
    header.write(&mut record)?;
    Ok(record)
}

// ============================================================================
// Builders
// ============================================================================

/// WNODE_EVENT_ITEM carrying an opaque payload
pub fn event_item(guid: Guid, provider_id: u32, flags: WnodeFlags, data: &[u8]) -> Result<Vec<u8>> {
    let mut record = vec![0u8; WNODE_HEADER_SIZE];
    record.extend_from_slice(data);
    let mut header = WnodeHeader::new(guid, provider_id, flags | WnodeFlags::EVENT_ITEM);
    finish(record, &mut header)
}

/// Internal record: header plus payload, used for action codes delivered
/// to request objects and core notifications
pub fn internal(guid: Guid, action: u32, version: u32, data: &[u8]) -> Result<Vec<u8>> {
    let mut record = vec![0u8; WNODE_HEADER_SIZE];
    record.extend_from_slice(data);
    let mut header = WnodeHeader::new(guid, action, WnodeFlags::INTERNAL);
    header.version = version;
    finish(record, &mut header)
}

/// WNODE_SINGLE_INSTANCE. A `None` name leaves the record flagged for
/// static instance names to be filled in later.
pub fn single_instance(
    guid: Guid,
    provider_id: u32,
    flags: WnodeFlags,
    name: Option<&str>,
    instance_index: u32,
    data: &[u8],
) -> Result<Vec<u8>> {
    let mut record = vec![0u8; WNODE_SINGLE_INSTANCE_SIZE];
    record.extend_from_slice(data);
    let mut flags = flags | WnodeFlags::SINGLE_INSTANCE;
    write_u32(&mut record, SI_INSTANCE_INDEX, instance_index)?;
    write_u32(&mut record, SI_DATA_BLOCK_OFFSET, WNODE_SINGLE_INSTANCE_SIZE as u32)?;
    write_u32(&mut record, SI_SIZE_DATA_BLOCK, to_u32(data.len())?)?;
    match name {
        Some(name) => {
            pad_to(&mut record, 2);
            let offset = to_u32(record.len())?;
            write_counted_string(&mut record, name)?;
            write_u32(&mut record, SI_OFFSET_INSTANCE_NAME, offset)?;
        }
        None => flags |= WnodeFlags::STATIC_INSTANCE_NAMES,
    }
    let mut header = WnodeHeader::new(guid, provider_id, flags);
    finish(record, &mut header)
}

/// WNODE_METHOD_ITEM addressed to a named instance
pub fn method_item(
    guid: Guid,
    provider_id: u32,
    name: &str,
    method_id: u32,
    input: &[u8],
) -> Result<Vec<u8>> {
    let mut record = vec![0u8; WNODE_METHOD_ITEM_SIZE];
    record.extend_from_slice(input);
    write_u32(&mut record, MI_METHOD_ID, method_id)?;
    write_u32(&mut record, MI_DATA_BLOCK_OFFSET, WNODE_METHOD_ITEM_SIZE as u32)?;
    write_u32(&mut record, MI_SIZE_DATA_BLOCK, to_u32(input.len())?)?;
    pad_to(&mut record, 2);
    let offset = to_u32(record.len())?;
    write_counted_string(&mut record, name)?;
    write_u32(&mut record, SI_OFFSET_INSTANCE_NAME, offset)?;
    let mut header = WnodeHeader::new(guid, provider_id, WnodeFlags::METHOD_ITEM);
    finish(record, &mut header)
}

/// WNODE_ALL_DATA over per-instance payloads. Equal-sized instances use
/// the fixed-size layout; otherwise an offset/length table is emitted.
pub fn all_data(guid: Guid, provider_id: u32, instances: &[&[u8]]) -> Result<Vec<u8>> {
    let count = instances.len();
    let fixed = instances.windows(2).all(|w| w[0].len() == w[1].len());
    let table_end = if fixed {
        WNODE_ALL_DATA_SIZE
    } else {
        ALL_DATA_FIXED_SIZE + 8 * count
    };
    let data_offset = align8(table_end);
    let mut record = vec![0u8; data_offset];

    let mut flags = WnodeFlags::ALL_DATA;
    if fixed {
        flags |= WnodeFlags::FIXED_INSTANCE_SIZE;
        let size = instances.first().map_or(0, |i| i.len());
        write_u32(&mut record, ALL_DATA_FIXED_SIZE, to_u32(size)?)?;
    }
    for (i, data) in instances.iter().enumerate() {
        let offset = record.len();
        record.extend_from_slice(data);
        pad_to(&mut record, 8);
        if !fixed {
            let entry = ALL_DATA_FIXED_SIZE + 8 * i;
            write_u32(&mut record, entry, to_u32(offset)?)?;
            write_u32(&mut record, entry + 4, to_u32(data.len())?)?;
        }
    }
    write_u32(&mut record, ALL_DATA_DATA_BLOCK_OFFSET, to_u32(data_offset)?)?;
    write_u32(&mut record, ALL_DATA_INSTANCE_COUNT, to_u32(count)?)?;
    let mut header = WnodeHeader::new(guid, provider_id, flags);
    finish(record, &mut header)
}

/// WNODE_TOO_SMALL carrying the size the caller must supply
pub fn too_small(size_needed: usize) -> Result<Vec<u8>> {
    let mut record = vec![0u8; WNODE_TOO_SMALL_SIZE];
    write_u32(&mut record, TS_SIZE_NEEDED, to_u32(size_needed)?)?;
    let mut header = WnodeHeader::new(Guid::zero(), 0, WnodeFlags::TOO_SMALL);
    finish(record, &mut header)
}

/// Size carried by a WNODE_TOO_SMALL record
pub fn size_needed(record: &[u8]) -> Result<Option<usize>> {
    let header = WnodeHeader::read(record)?;
    if !header.wnode_flags().contains(WnodeFlags::TOO_SMALL) {
        return Ok(None);
    }
    Ok(Some(read_u32(record, TS_SIZE_NEEDED)? as usize))
}

/// WNODE_EVENT_REFERENCE pointing at an instance the consumer must query
pub fn event_reference(
    guid: Guid,
    provider_id: u32,
    target_guid: Guid,
    target_data_size: u32,
    target_instance_index: u32,
) -> Result<Vec<u8>> {
    let mut record = vec![0u8; WNODE_EVENT_REFERENCE_SIZE];
    record[ER_TARGET_GUID..ER_TARGET_GUID + GUID_SIZE].copy_from_slice(&target_guid.to_bytes());
    write_u32(&mut record, ER_TARGET_SIZE, target_data_size)?;
    write_u32(&mut record, ER_TARGET_INDEX, target_instance_index)?;
    let mut header = WnodeHeader::new(
        guid,
        provider_id,
        WnodeFlags::EVENT_ITEM | WnodeFlags::EVENT_REFERENCE,
    );
    finish(record, &mut header)
}

// ============================================================================
// Views
// ============================================================================

/// Decoded WNODE_EVENT_REFERENCE target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventReference {
    pub target_guid: Guid,
    pub target_data_size: u32,
    pub target_instance_index: u32,
}

impl EventReference {
    pub fn parse(record: &[u8]) -> Result<Self> {
        if record.len() < WNODE_EVENT_REFERENCE_SIZE {
            return Err(WmiError::InvalidParameter("short event reference"));
        }
        Ok(Self {
            target_guid: Guid::from_bytes(&record[ER_TARGET_GUID..])
                .ok_or(WmiError::InvalidParameter("short event reference"))?,
            target_data_size: read_u32(record, ER_TARGET_SIZE)?,
            target_instance_index: read_u32(record, ER_TARGET_INDEX)?,
        })
    }
}

/// Borrowed view of a WNODE_SINGLE_INSTANCE (or SINGLE_ITEM) record
#[derive(Debug, Clone, Copy)]
pub struct SingleInstanceView<'a> {
    record: &'a [u8],
    pub header: WnodeHeader,
    pub instance_index: u32,
}

impl<'a> SingleInstanceView<'a> {
    pub fn parse(record: &'a [u8]) -> Result<Self> {
        let header = WnodeHeader::read_checked(record)?;
        let flags = header.wnode_flags();
        if !flags.intersects(WnodeFlags::SINGLE_INSTANCE | WnodeFlags::SINGLE_ITEM) {
            return Err(WmiError::InvalidParameter("not a single instance record"));
        }
        let record = &record[..header.buffer_size as usize];
        Ok(Self {
            record,
            header,
            instance_index: read_u32(record, SI_INSTANCE_INDEX)?,
        })
    }

    /// Instance name, if one is embedded
    pub fn instance_name(&self) -> Result<Option<String>> {
        let offset = read_u32(self.record, SI_OFFSET_INSTANCE_NAME)? as usize;
        if offset == 0 {
            return Ok(None);
        }
        Ok(Some(read_counted_string(self.record, offset)?.0))
    }

    pub fn data(&self) -> Result<&'a [u8]> {
        let offset = read_u32(self.record, SI_DATA_BLOCK_OFFSET)? as usize;
        let size = read_u32(self.record, SI_SIZE_DATA_BLOCK)? as usize;
        self.record
            .get(offset..offset + size)
            .ok_or(WmiError::InvalidParameter("data block past end of record"))
    }
}

/// Borrowed view of a WNODE_ALL_DATA record
#[derive(Debug, Clone, Copy)]
pub struct AllDataView<'a> {
    record: &'a [u8],
    pub header: WnodeHeader,
    pub instance_count: u32,
}

impl<'a> AllDataView<'a> {
    pub fn parse(record: &'a [u8]) -> Result<Self> {
        let header = WnodeHeader::read_checked(record)?;
        if !header.wnode_flags().contains(WnodeFlags::ALL_DATA) {
            return Err(WmiError::InvalidParameter("not an all data record"));
        }
        let record = &record[..header.buffer_size as usize];
        if record.len() < WNODE_ALL_DATA_SIZE {
            return Err(WmiError::InvalidParameter("short all data record"));
        }
        Ok(Self {
            record,
            header,
            instance_count: read_u32(record, ALL_DATA_INSTANCE_COUNT)?,
        })
    }

    /// Payload of instance `index`
    pub fn instance_data(&self, index: u32) -> Result<&'a [u8]> {
        if index >= self.instance_count {
            return Err(WmiError::InstanceNotFound);
        }
        let (offset, len) = if self.header.wnode_flags().contains(WnodeFlags::FIXED_INSTANCE_SIZE) {
            let size = read_u32(self.record, ALL_DATA_FIXED_SIZE)? as usize;
            let base = read_u32(self.record, ALL_DATA_DATA_BLOCK_OFFSET)? as usize;
            (base + index as usize * align8(size), size)
        } else {
            let entry = ALL_DATA_FIXED_SIZE + 8 * index as usize;
            (
                read_u32(self.record, entry)? as usize,
                read_u32(self.record, entry + 4)? as usize,
            )
        };
        self.record
            .get(offset..offset + len)
            .ok_or(WmiError::InvalidParameter("instance past end of record"))
    }

    /// Embedded instance names, empty when none were supplied
    pub fn instance_names(&self) -> Result<Vec<String>> {
        let table = read_u32(self.record, ALL_DATA_NAME_OFFSETS)? as usize;
        if table == 0 {
            return Ok(Vec::new());
        }
        (0..self.instance_count as usize)
            .map(|i| {
                let offset = read_u32(self.record, table + 4 * i)? as usize;
                Ok(read_counted_string(self.record, offset)?.0)
            })
            .collect()
    }
}

// ============================================================================
// Instance name inclusion
// ============================================================================

/// Append instance names to a record whose provider left them out.
///
/// ALL_DATA records take one name per instance (an offset table followed
/// by the strings); single instance, item and method records take exactly
/// one name.
pub fn include_instance_names(record: &[u8], names: &[String], pdo: bool) -> Result<Vec<u8>> {
    let mut header = WnodeHeader::read_checked(record)?;
    let mut out = Vec::new();
    let extra: usize = names.iter().map(|n| counted_string_size(n) + 6).sum();
    out.try_reserve(header.buffer_size as usize + extra + 8)
        .map_err(|_| WmiError::InsufficientResources)?;
    out.extend_from_slice(&record[..header.buffer_size as usize]);
    let flags = header.wnode_flags();

    if flags.contains(WnodeFlags::ALL_DATA) {
        let count = read_u32(&out, ALL_DATA_INSTANCE_COUNT)? as usize;
        if names.len() != count {
            return Err(WmiError::InvalidParameter("instance name count mismatch"));
        }
        pad_to(&mut out, 8);
        let table = out.len();
        out.resize(table + 4 * count, 0);
        for (i, name) in names.iter().enumerate() {
            pad_to(&mut out, 2);
            let offset = to_u32(out.len())?;
            write_counted_string(&mut out, name)?;
            write_u32(&mut out, table + 4 * i, offset)?;
        }
        write_u32(&mut out, ALL_DATA_NAME_OFFSETS, to_u32(table)?)?;
    } else if flags.intersects(
        WnodeFlags::SINGLE_INSTANCE | WnodeFlags::SINGLE_ITEM | WnodeFlags::METHOD_ITEM,
    ) {
        let [name] = names else {
            return Err(WmiError::InvalidParameter("instance name count mismatch"));
        };
        pad_to(&mut out, 2);
        let offset = to_u32(out.len())?;
        write_counted_string(&mut out, name)?;
        write_u32(&mut out, SI_OFFSET_INSTANCE_NAME, offset)?;
    } else {
        return Err(WmiError::InvalidParameter("record carries no instance names"));
    }

    let mut flags = flags - WnodeFlags::STATIC_INSTANCE_NAMES;
    if pdo {
        flags |= WnodeFlags::PDO_INSTANCE_NAMES;
    }
    header.flags = flags.bits();
    finish(out, &mut header)
}

// ============================================================================
// Chains
// ============================================================================

/// Iterator over records chained by `linkage`
pub struct WnodeChain<'a> {
    buf: &'a [u8],
    offset: Option<usize>,
}

impl<'a> WnodeChain<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: if buf.is_empty() { None } else { Some(0) },
        }
    }
}

impl<'a> Iterator for WnodeChain<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset.take()?;
        let rest = &self.buf[offset..];
        let header = match WnodeHeader::read_checked(rest) {
            Ok(h) => h,
            Err(e) => return Some(Err(e)),
        };
        let linkage = header.linkage as usize;
        if linkage != 0 {
            if linkage < header.buffer_size as usize || offset + linkage >= self.buf.len() {
                return Some(Err(WmiError::InvalidParameter("bad record linkage")));
            }
            self.offset = Some(offset + linkage);
        }
        Some(Ok(&rest[..header.buffer_size as usize]))
    }
}

/// Concatenate records into one chain, 8-byte aligned
pub fn chain(records: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut last = None;
    for record in records {
        pad_to(&mut out, 8);
        let offset = out.len();
        if let Some(prev) = last {
            set_linkage(&mut out[prev..], to_u32(offset - prev)?)?;
        }
        out.extend_from_slice(record);
        set_linkage(&mut out[offset..], 0)?;
        last = Some(offset);
    }
    Ok(out)
}
