//! Provider Registration Information (WMIREGINFO)
//!
//! A provider describes the guids it implements with one or more chained
//! WMIREGINFO blocks:
//!
//! ```text
//! +0   BufferSize          bytes in this block
//! +4   NextWmiRegInfo      offset of the next block from this one, 0 = last
//! +8   RegistryPath        offset of a counted string, 0 = none
//! +12  MofResourceName     offset of a counted string, 0 = none
//! +16  GuidCount
//! +20  WMIREGGUID[GuidCount]
//!        Guid  Flags  InstanceCount  InstanceInfo
//! ```
//!
//! `InstanceInfo` is the offset of either a run of `InstanceCount`
//! consecutive counted strings (`INSTANCE_LIST`) or a single base name
//! (`INSTANCE_BASENAME`). All offsets are relative to the start of the
//! block and are untrusted: they are checked against `BufferSize` before
//! anything is read, and per record so that one malformed guid does not
//! poison the others in the same block.

use crate::error::{Result, WmiError};
use crate::guid::{Guid, GUID_SIZE};
use crate::wnode::{align8, read_u32, write_counted_string, write_u32};
use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;
use static_assertions::assert_eq_size;

bitflags::bitflags! {
    /// WMIREGGUID flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RegFlags: u32 {
        /// Collection must be explicitly enabled
        const EXPENSIVE = 0x0000_0001;
        /// InstanceInfo is a list of static names
        const INSTANCE_LIST = 0x0000_0004;
        /// InstanceInfo is a base name
        const INSTANCE_BASENAME = 0x0000_0008;
        /// Base name is a PDO name
        const INSTANCE_PDO = 0x0000_0020;
        /// Guid only fires events, it has no data
        const EVENT_ONLY_GUID = 0x0000_0040;
        /// Guid controls a trace provider
        const TRACE_CONTROL_GUID = 0x0000_1000;
        /// Provider opens its guids to every caller
        const ALLOW_ALL_ACCESS = 0x0000_2000;
        /// Update: drop this guid
        const REMOVE_GUID = 0x0001_0000;
        /// Guid is traced rather than queried
        const TRACED_GUID = 0x0008_0000;
    }
}

/// WMIREGINFO fixed header
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WmiRegInfoHeader {
    pub buffer_size: u32,
    pub next_wmi_reg_info: u32,
    pub registry_path: u32,
    pub mof_resource_name: u32,
    pub guid_count: u32,
}

/// WMIREGGUID
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct WmiRegGuid {
    pub guid: Guid,
    pub flags: u32,
    pub instance_count: u32,
    pub instance_info: u32,
}

assert_eq_size!(WmiRegInfoHeader, [u8; 20]);
assert_eq_size!(WmiRegGuid, [u8; 28]);

pub const WMIREGINFO_SIZE: usize = 20;
pub const WMIREGGUID_SIZE: usize = 28;

/// Instance naming as described by a registration record
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegNaming {
    /// One static name per instance
    List(Vec<String>),
    /// Names are the base name followed by a running index
    BaseName { base: String, pdo: bool },
    /// Provider names instances dynamically (or has none)
    Dynamic,
}

impl WmiRegGuid {
    pub fn reg_flags(&self) -> RegFlags {
        RegFlags::from_bits_retain(self.flags)
    }
}

/// Validate and decode the counted string at `offset` within a block.
/// Offset 0 means the string is absent.
pub fn validate_string(block: &[u8], offset: u32) -> Result<Option<String>> {
    let offset = offset as usize;
    if offset == 0 {
        return Ok(None);
    }
    if offset > block.len() || offset % 2 != 0 {
        return Err(WmiError::InvalidParameter("string offset out of bounds"));
    }
    let (s, _) = crate::wnode::read_counted_string(block, offset)?;
    Ok(Some(s))
}

/// One validated WMIREGINFO block
#[derive(Debug, Clone, Copy)]
pub struct RegInfoBlock<'a> {
    block: &'a [u8],
    pub header: WmiRegInfoHeader,
}

impl<'a> RegInfoBlock<'a> {
    /// Check the block header and guid table against the buffer
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        if buf.len() < WMIREGINFO_SIZE {
            return Err(WmiError::InvalidParameter("reginfo shorter than header"));
        }
        let header = WmiRegInfoHeader {
            buffer_size: read_u32(buf, 0)?,
            next_wmi_reg_info: read_u32(buf, 4)?,
            registry_path: read_u32(buf, 8)?,
            mof_resource_name: read_u32(buf, 12)?,
            guid_count: read_u32(buf, 16)?,
        };
        let size = header.buffer_size as usize;
        if size < WMIREGINFO_SIZE || size > buf.len() {
            return Err(WmiError::InvalidParameter("reginfo size exceeds buffer"));
        }
        let table = (header.guid_count as usize)
            .checked_mul(WMIREGGUID_SIZE)
            .and_then(|n| n.checked_add(WMIREGINFO_SIZE))
            .ok_or(WmiError::InvalidParameter("guid count overflows"))?;
        if table > size {
            return Err(WmiError::InvalidParameter("guid table exceeds reginfo"));
        }
        Ok(Self {
            block: &buf[..size],
            header,
        })
    }

    pub fn registry_path(&self) -> Result<Option<String>> {
        validate_string(self.block, self.header.registry_path)
    }

    pub fn mof_resource_name(&self) -> Result<Option<String>> {
        validate_string(self.block, self.header.mof_resource_name)
    }

    pub fn guid_count(&self) -> usize {
        self.header.guid_count as usize
    }

    /// Guid record `index`; the table was bounds checked by `parse`
    pub fn reg_guid(&self, index: usize) -> Result<WmiRegGuid> {
        if index >= self.guid_count() {
            return Err(WmiError::InvalidParameter("guid index out of range"));
        }
        let base = WMIREGINFO_SIZE + index * WMIREGGUID_SIZE;
        Ok(WmiRegGuid {
            guid: Guid::from_bytes(&self.block[base..])
                .ok_or(WmiError::InvalidParameter("guid table exceeds reginfo"))?,
            flags: read_u32(self.block, base + GUID_SIZE)?,
            instance_count: read_u32(self.block, base + GUID_SIZE + 4)?,
            instance_info: read_u32(self.block, base + GUID_SIZE + 8)?,
        })
    }

    pub fn reg_guids(&self) -> impl Iterator<Item = Result<WmiRegGuid>> + '_ {
        (0..self.guid_count()).map(move |i| self.reg_guid(i))
    }

    /// Decode the instance naming of one record
    pub fn naming(&self, reg: &WmiRegGuid) -> Result<RegNaming> {
        let flags = reg.reg_flags();
        if flags.contains(RegFlags::INSTANCE_LIST) {
            if reg.instance_count as usize > self.block.len() / 2 {
                return Err(WmiError::InvalidParameter("instance count exceeds reginfo"));
            }
            let mut names = Vec::new();
            names
                .try_reserve(reg.instance_count as usize)
                .map_err(|_| WmiError::InsufficientResources)?;
            let mut offset = reg.instance_info;
            for _ in 0..reg.instance_count {
                let name = validate_string(self.block, offset)?
                    .ok_or(WmiError::InvalidParameter("missing instance name"))?;
                let used = crate::wnode::counted_string_size(&name) as u32;
                offset = offset
                    .checked_add(used)
                    .ok_or(WmiError::InvalidParameter("instance list overflows"))?;
                names.push(name);
            }
            Ok(RegNaming::List(names))
        } else if flags.contains(RegFlags::INSTANCE_BASENAME) {
            let base = validate_string(self.block, reg.instance_info)?
                .ok_or(WmiError::InvalidParameter("missing base name"))?;
            Ok(RegNaming::BaseName {
                base,
                pdo: flags.contains(RegFlags::INSTANCE_PDO),
            })
        } else {
            Ok(RegNaming::Dynamic)
        }
    }
}

/// Iterator over chained WMIREGINFO blocks
pub struct RegInfoChain<'a> {
    buf: &'a [u8],
    offset: Option<usize>,
}

impl<'a> RegInfoChain<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            offset: Some(0),
        }
    }
}

impl<'a> Iterator for RegInfoChain<'a> {
    type Item = Result<RegInfoBlock<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.offset.take()?;
        let block = match RegInfoBlock::parse(&self.buf[offset..]) {
            Ok(b) => b,
            Err(e) => return Some(Err(e)),
        };
        let next = block.header.next_wmi_reg_info as usize;
        if next != 0 {
            if offset + next >= self.buf.len() {
                return Some(Err(WmiError::InvalidParameter("next reginfo out of bounds")));
            }
            self.offset = Some(offset + next);
        }
        Some(Ok(block))
    }
}

// ============================================================================
// Serialization
// ============================================================================

/// Registration description for one guid
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegGuidSpec {
    pub guid: Guid,
    pub flags: RegFlags,
    pub instance_count: u32,
    pub naming: RegNaming,
}

impl RegGuidSpec {
    pub fn new(guid: Guid, instance_count: u32) -> Self {
        Self {
            guid,
            flags: RegFlags::empty(),
            instance_count,
            naming: RegNaming::Dynamic,
        }
    }

    /// Static names; the instance count follows the list
    pub fn with_names<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        self.instance_count = names.len() as u32;
        self.naming = RegNaming::List(names);
        self
    }

    pub fn with_base_name(mut self, base: &str, pdo: bool) -> Self {
        self.naming = RegNaming::BaseName {
            base: base.into(),
            pdo,
        };
        self
    }

    pub fn with_flags(mut self, flags: RegFlags) -> Self {
        self.flags |= flags;
        self
    }

    fn wire_flags(&self) -> RegFlags {
        let naming = match &self.naming {
            RegNaming::List(_) => RegFlags::INSTANCE_LIST,
            RegNaming::BaseName { pdo: true, .. } => {
                RegFlags::INSTANCE_BASENAME | RegFlags::INSTANCE_PDO
            }
            RegNaming::BaseName { pdo: false, .. } => RegFlags::INSTANCE_BASENAME,
            RegNaming::Dynamic => RegFlags::empty(),
        };
        let mask = RegFlags::INSTANCE_LIST | RegFlags::INSTANCE_BASENAME | RegFlags::INSTANCE_PDO;
        (self.flags - mask) | naming
    }
}

/// Builds a WMIREGINFO block
#[derive(Debug, Clone, Default)]
pub struct RegInfoBuilder {
    registry_path: Option<String>,
    mof_resource_name: Option<String>,
    guids: Vec<RegGuidSpec>,
}

impl RegInfoBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry_path(mut self, path: &str) -> Self {
        self.registry_path = Some(path.into());
        self
    }

    pub fn mof_resource(mut self, name: &str) -> Self {
        self.mof_resource_name = Some(name.into());
        self
    }

    pub fn guid(mut self, spec: RegGuidSpec) -> Self {
        self.guids.push(spec);
        self
    }

    pub fn build(&self) -> Result<Vec<u8>> {
        let table = WMIREGINFO_SIZE + self.guids.len() * WMIREGGUID_SIZE;
        let mut out = vec![0u8; table];

        let put_string = |out: &mut Vec<u8>, s: &str| -> Result<u32> {
            if out.len() % 2 != 0 {
                out.push(0);
            }
            let offset = out.len() as u32;
            write_counted_string(out, s)?;
            Ok(offset)
        };

        if let Some(path) = &self.registry_path {
            let offset = put_string(&mut out, path)?;
            write_u32(&mut out, 8, offset)?;
        }
        if let Some(name) = &self.mof_resource_name {
            let offset = put_string(&mut out, name)?;
            write_u32(&mut out, 12, offset)?;
        }

        for (i, spec) in self.guids.iter().enumerate() {
            let base = WMIREGINFO_SIZE + i * WMIREGGUID_SIZE;
            let info = match &spec.naming {
                RegNaming::List(names) => {
                    let mut first = 0;
                    for (n, name) in names.iter().enumerate() {
                        let offset = put_string(&mut out, name)?;
                        if n == 0 {
                            first = offset;
                        }
                    }
                    first
                }
                RegNaming::BaseName { base, .. } => put_string(&mut out, base)?,
                RegNaming::Dynamic => 0,
            };
            out[base..base + GUID_SIZE].copy_from_slice(&spec.guid.to_bytes());
            write_u32(&mut out, base + GUID_SIZE, spec.wire_flags().bits())?;
            write_u32(&mut out, base + GUID_SIZE + 4, spec.instance_count)?;
            write_u32(&mut out, base + GUID_SIZE + 8, info)?;
        }

        write_u32(&mut out, 16, self.guids.len() as u32)?;
        let size = out.len() as u32;
        write_u32(&mut out, 0, size)?;
        Ok(out)
    }
}

/// Link blocks through `NextWmiRegInfo`, each starting 8-byte aligned
pub fn chain_blocks(blocks: &[Vec<u8>]) -> Result<Vec<u8>> {
    let mut out: Vec<u8> = Vec::new();
    let mut last: Option<usize> = None;
    for block in blocks {
        out.resize(align8(out.len()), 0);
        let offset = out.len();
        if let Some(prev) = last {
            write_u32(&mut out, prev + 4, (offset - prev) as u32)?;
        }
        out.extend_from_slice(block);
        last = Some(offset);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    const G1: Guid = Guid::new(0x1111, 1, 1, [1; 8]);
    const G2: Guid = Guid::new(0x2222, 2, 2, [2; 8]);

    fn sample() -> Vec<u8> {
        RegInfoBuilder::new()
            .registry_path("\\Driver\\disk")
            .mof_resource("DiskMof")
            .guid(RegGuidSpec::new(G1, 0).with_names(["A", "Bee"]))
            .guid(
                RegGuidSpec::new(G2, 3)
                    .with_base_name("Dev", true)
                    .with_flags(RegFlags::EXPENSIVE),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_parse_built_block() {
        let buf = sample();
        let block = RegInfoBlock::parse(&buf).unwrap();
        assert_eq!(block.guid_count(), 2);
        assert_eq!(block.registry_path().unwrap().as_deref(), Some("\\Driver\\disk"));
        assert_eq!(block.mof_resource_name().unwrap().as_deref(), Some("DiskMof"));

        let first = block.reg_guid(0).unwrap();
        assert_eq!(first.guid, G1);
        assert_eq!(first.instance_count, 2);
        assert_eq!(
            block.naming(&first).unwrap(),
            RegNaming::List(vec!["A".to_string(), "Bee".to_string()])
        );

        let second = block.reg_guid(1).unwrap();
        assert!(second.reg_flags().contains(RegFlags::EXPENSIVE | RegFlags::INSTANCE_PDO));
        assert_eq!(
            block.naming(&second).unwrap(),
            RegNaming::BaseName {
                base: "Dev".to_string(),
                pdo: true
            }
        );
    }

    #[test]
    fn test_header_bounds() {
        let mut buf = sample();
        assert!(RegInfoBlock::parse(&buf[..10]).is_err());

        // BufferSize larger than what was handed in
        let size = buf.len() as u32 + 1;
        write_u32(&mut buf, 0, size).unwrap();
        assert!(RegInfoBlock::parse(&buf).is_err());

        // Guid table running past BufferSize
        let mut buf = sample();
        write_u32(&mut buf, 16, 1000).unwrap();
        assert!(RegInfoBlock::parse(&buf).is_err());
    }

    #[test]
    fn test_bad_string_offsets_fail_per_record() {
        let mut buf = sample();
        let len = buf.len() as u32;
        // Odd offset on the first record's name list
        write_u32(&mut buf, WMIREGINFO_SIZE + GUID_SIZE + 8, 3).unwrap();
        // Base name offset of the second record past the block
        write_u32(&mut buf, WMIREGINFO_SIZE + WMIREGGUID_SIZE + GUID_SIZE + 8, len + 2).unwrap();

        let block = RegInfoBlock::parse(&buf).unwrap();
        let first = block.reg_guid(0).unwrap();
        let second = block.reg_guid(1).unwrap();
        assert!(matches!(block.naming(&first), Err(WmiError::InvalidParameter(_))));
        assert!(matches!(block.naming(&second), Err(WmiError::InvalidParameter(_))));
        // The block itself is still usable
        assert_eq!(block.registry_path().unwrap().as_deref(), Some("\\Driver\\disk"));
    }

    #[test]
    fn test_string_length_past_block() {
        let mut buf = sample();
        let path_offset = read_u32(&buf, 8).unwrap() as usize;
        buf[path_offset..path_offset + 2].copy_from_slice(&0x4000u16.to_le_bytes());
        let block = RegInfoBlock::parse(&buf).unwrap();
        assert!(block.registry_path().is_err());
        assert_eq!(validate_string(&buf, 0).unwrap(), None);
    }

    #[test]
    fn test_chained_blocks() {
        let a = sample();
        let b = RegInfoBuilder::new()
            .guid(RegGuidSpec::new(G1, 1))
            .build()
            .unwrap();
        let buf = chain_blocks(&[a, b]).unwrap();
        let blocks: Vec<_> = RegInfoChain::new(&buf).collect::<Result<_>>().unwrap();
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[1].guid_count(), 1);
        assert_eq!(blocks[1].naming(&blocks[1].reg_guid(0).unwrap()).unwrap(), RegNaming::Dynamic);
    }

    #[test]
    fn test_chain_rejects_out_of_bounds_next() {
        let mut buf = sample();
        write_u32(&mut buf, 4, 0x1000).unwrap();
        let mut chain = RegInfoChain::new(&buf);
        assert!(chain.next().unwrap().is_err());
    }
}
