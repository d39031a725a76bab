// Fixed-size header at the start of the `info` file.
//
// Layout (40 bytes):
//   magic[8] version:u32 header_size:u16 endian:u8 class:u8
//   feat_mask:u64 info_mask:u64 max_stack:u16 reserved[6]

use std::path::Path;

use byteorder::{ByteOrder, NativeEndian};
use serde::Serialize;

use crate::error::{DataError, DataResult};
use crate::order::{BitOrder, DataOrder, Endian};

pub const MAGIC: &[u8; 8] = b"Ftrace!\0";
pub const HEADER_SIZE: usize = 40;

pub const FILE_VERSION_MIN: u32 = 3;
pub const FILE_VERSION: u32 = 4;

/// Stack depth used when the recorder did not store one.
pub const DEFAULT_MAX_STACK: u16 = 1024;

// Feature mask bits
pub const FEAT_PLTHOOK: u64 = 1 << 0;
pub const FEAT_TASK_SESSION: u64 = 1 << 1;
pub const FEAT_KERNEL: u64 = 1 << 2;
pub const FEAT_ARGUMENT: u64 = 1 << 3;
pub const FEAT_RETVAL: u64 = 1 << 4;
pub const FEAT_SYM_REL_ADDR: u64 = 1 << 5;
pub const FEAT_MAX_STACK: u64 = 1 << 6;
pub const FEAT_EVENT: u64 = 1 << 7;

// Info mask bits
pub const INFO_EXE_NAME: u64 = 1 << 0;
pub const INFO_EXE_BUILD_ID: u64 = 1 << 1;
pub const INFO_EXIT_STATUS: u64 = 1 << 2;
pub const INFO_CMDLINE: u64 = 1 << 3;
pub const INFO_CPUINFO: u64 = 1 << 4;
pub const INFO_MEMINFO: u64 = 1 << 5;
pub const INFO_OSINFO: u64 = 1 << 6;
pub const INFO_TASKINFO: u64 = 1 << 7;
pub const INFO_USAGEINFO: u64 = 1 << 8;
pub const INFO_LOADINFO: u64 = 1 << 9;
pub const INFO_ARG_SPEC: u64 = 1 << 10;
pub const INFO_RECORD_DATE: u64 = 1 << 11;
pub const INFO_PATTERN_TYPE: u64 = 1 << 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeatureMask(pub u64);

impl FeatureMask {
    pub fn has(self, bits: u64) -> bool {
        self.0 & bits != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InfoMask(pub u64);

impl InfoMask {
    pub fn has(self, bits: u64) -> bool {
        self.0 & bits != 0
    }
}

/// Header fields as stored, before any byte order normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawHeader {
    pub magic: [u8; 8],
    pub version: u32,
    pub header_size: u16,
    pub endian: u8,
    pub class: u8,
    pub feat_mask: u64,
    pub info_mask: u64,
    pub max_stack: u16,
}

impl RawHeader {
    /// Reads the fields in host order, exactly as a plain struct read would.
    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut magic = [0u8; 8];
        magic.copy_from_slice(&buf[..8]);

        Self {
            magic,
            version: NativeEndian::read_u32(&buf[8..12]),
            header_size: NativeEndian::read_u16(&buf[12..14]),
            endian: buf[14],
            class: buf[15],
            feat_mask: NativeEndian::read_u64(&buf[16..24]),
            info_mask: NativeEndian::read_u64(&buf[24..32]),
            max_stack: NativeEndian::read_u16(&buf[32..34]),
        }
    }

    /// Serializes the header as a machine of `endian` would have written it.
    pub fn to_bytes(&self, endian: Endian) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[..8].copy_from_slice(&self.magic);
        match endian {
            Endian::Little => write_fields::<byteorder::LittleEndian>(self, &mut buf),
            Endian::Big => write_fields::<byteorder::BigEndian>(self, &mut buf),
        }
        buf
    }
}

fn write_fields<B: ByteOrder>(raw: &RawHeader, buf: &mut [u8; HEADER_SIZE]) {
    B::write_u32(&mut buf[8..12], raw.version);
    B::write_u16(&mut buf[12..14], raw.header_size);
    buf[14] = raw.endian;
    buf[15] = raw.class;
    B::write_u64(&mut buf[16..24], raw.feat_mask);
    B::write_u64(&mut buf[24..32], raw.info_mask);
    B::write_u16(&mut buf[32..34], raw.max_stack);
}

/// Validated header with every integer in host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Header {
    pub version: u32,
    pub header_size: u16,
    pub endian: Endian,
    pub class: u8,
    pub feat_mask: FeatureMask,
    pub info_mask: InfoMask,
    pub max_stack: u16,
}

impl Header {
    /// Validates magic and version, detects the data order and normalizes
    /// the integer fields. Record words are assumed to use the default
    /// LSB-first bit-field layout.
    pub fn parse(buf: &[u8; HEADER_SIZE], path: &Path) -> DataResult<(Self, DataOrder)> {
        Self::parse_with_packing(buf, path, BitOrder::default())
    }

    /// Like [`Header::parse`] for data whose recorder packed record
    /// bit-fields with `packing`.
    pub fn parse_with_packing(
        buf: &[u8; HEADER_SIZE],
        path: &Path,
        packing: BitOrder,
    ) -> DataResult<(Self, DataOrder)> {
        let raw = RawHeader::from_bytes(buf);

        if &raw.magic != MAGIC {
            return Err(DataError::malformed(path, "invalid magic string found"));
        }

        let endian = Endian::from_tag(raw.endian).ok_or_else(|| {
            DataError::malformed(path, format!("invalid endian tag: {}", raw.endian))
        })?;
        let order = DataOrder::detect(endian, packing);

        let header = Self {
            version: order.u32(raw.version),
            header_size: order.u16(raw.header_size),
            endian,
            class: raw.class,
            feat_mask: FeatureMask(order.u64(raw.feat_mask)),
            info_mask: InfoMask(order.u64(raw.info_mask)),
            max_stack: order.u16(raw.max_stack),
        };

        if header.version < FILE_VERSION_MIN || header.version > FILE_VERSION {
            return Err(DataError::Unsupported {
                version: header.version,
                min: FILE_VERSION_MIN,
                max: FILE_VERSION,
            });
        }

        Ok((header, order))
    }

    pub fn has_feature(&self, bits: u64) -> bool {
        self.feat_mask.has(bits)
    }
}

#[cfg(test)]
pub(crate) fn sample_raw(version: u32, feat_mask: u64, info_mask: u64) -> RawHeader {
    RawHeader {
        magic: *MAGIC,
        version,
        header_size: HEADER_SIZE as u16,
        endian: 0,
        class: 2,
        feat_mask,
        info_mask,
        max_stack: 0,
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;

    fn encode(raw: RawHeader, endian: Endian) -> [u8; HEADER_SIZE] {
        RawHeader {
            endian: endian.tag(),
            ..raw
        }
        .to_bytes(endian)
    }

    #[test]
    fn header__native_endian__then_fields_unchanged() {
        let raw = RawHeader {
            max_stack: 64,
            ..sample_raw(4, FEAT_TASK_SESSION | FEAT_MAX_STACK, INFO_EXE_NAME)
        };
        let buf = encode(raw, Endian::native());

        let (header, order) = Header::parse(&buf, Path::new("info")).unwrap();
        assert!(!order.needs_byte_swap);
        assert_eq!(header.version, 4);
        assert_eq!(header.max_stack, 64);
        assert!(header.has_feature(FEAT_TASK_SESSION));
        assert!(header.info_mask.has(INFO_EXE_NAME));
    }

    #[test]
    fn header__foreign_endian__then_swapped_fields_equal_byte_reversal() {
        let raw = RawHeader {
            max_stack: 0x0102,
            ..sample_raw(3, 0x0000_0000_0000_0043, 0x0000_0000_0000_0409)
        };
        let buf = encode(raw, Endian::foreign());

        let stored = RawHeader::from_bytes(&buf);
        assert_eq!(stored.version, 3u32.swap_bytes());
        assert_eq!(stored.max_stack, 0x0201);

        let (header, order) = Header::parse(&buf, Path::new("info")).unwrap();
        assert!(order.needs_byte_swap);
        assert_eq!(header.version, stored.version.swap_bytes());
        assert_eq!(header.feat_mask.0, stored.feat_mask.swap_bytes());
        assert_eq!(header.info_mask.0, stored.info_mask.swap_bytes());
        assert_eq!(header.max_stack, stored.max_stack.swap_bytes());
        assert_eq!(header.header_size, HEADER_SIZE as u16);
    }

    #[test]
    fn header__native_endian_msb_packing__then_only_bit_swap() {
        let buf = encode(sample_raw(4, 0, 0), Endian::native());

        let (header, order) =
            Header::parse_with_packing(&buf, Path::new("info"), BitOrder::MsbFirst).unwrap();
        assert_eq!(header.version, 4);
        assert!(!order.needs_byte_swap);
        assert!(order.needs_bit_swap);
    }

    #[test]
    fn header__bad_magic__then_malformed() {
        let mut buf = encode(sample_raw(4, 0, 0), Endian::native());
        buf[0] = b'X';
        let err = Header::parse(&buf, Path::new("data/info")).unwrap_err();
        assert!(matches!(err, DataError::Malformed { .. }));
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn header__version_bounds__then_min_and_max_accepted() {
        for version in [FILE_VERSION_MIN, FILE_VERSION] {
            let buf = encode(sample_raw(version, 0, 0), Endian::native());
            assert!(Header::parse(&buf, Path::new("info")).is_ok(), "v{version}");
        }
    }

    #[test]
    fn header__version_out_of_range__then_unsupported() {
        for version in [0, FILE_VERSION + 1] {
            let buf = encode(sample_raw(version, 0, 0), Endian::foreign());
            let err = Header::parse(&buf, Path::new("info")).unwrap_err();
            assert!(
                matches!(err, DataError::Unsupported { version: v, .. } if v == version),
                "unexpected error: {err:?}"
            );
        }
    }

    #[test]
    fn header__unknown_endian_tag__then_malformed() {
        let mut buf = encode(sample_raw(4, 0, 0), Endian::native());
        buf[14] = 7;
        let err = Header::parse(&buf, Path::new("info")).unwrap_err();
        assert!(err.to_string().contains("endian"));
    }
}
