//! Byte order and bit-field layout detection.
//!
//! A trace may be read on a machine other than the one that recorded it.
//! Two independent things can differ:
//!
//! * byte order of every multi-byte integer, and
//! * the order in which bit-fields were packed into a record word.
//!
//! Record words are always decoded here with explicit shifts and masks.
//! [`BitOrder::LsbFirst`] is the native convention of this crate and the
//! layout data files are expected to use (magic in bits 3..=5 of the
//! second record word). The two are detected separately: a recorder can
//! share the reader's byte order and still pack bit-fields the other way.

use byteorder::{BigEndian, ByteOrder, LittleEndian, NativeEndian};
use serde::Serialize;

/// Value stored in the 3-bit `magic` field of every record word.
pub const RECORD_MAGIC: u64 = 0b101;

/// Size of one call-stack record on disk.
pub const RECORD_SIZE: usize = 16;

const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    /// Decodes the header's endian tag (ELF `EI_DATA` values).
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            ELFDATA2LSB => Some(Endian::Little),
            ELFDATA2MSB => Some(Endian::Big),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Endian::Little => ELFDATA2LSB,
            Endian::Big => ELFDATA2MSB,
        }
    }

    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn foreign() -> Self {
        match Self::native() {
            Endian::Little => Endian::Big,
            Endian::Big => Endian::Little,
        }
    }

    pub fn write_u64(self, buf: &mut [u8], value: u64) {
        match self {
            Endian::Little => LittleEndian::write_u64(buf, value),
            Endian::Big => BigEndian::write_u64(buf, value),
        }
    }
}

/// Bit-field allocation order inside a 64-bit record word.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum BitOrder {
    /// First declared field in the least significant bits.
    #[default]
    LsbFirst,
    /// First declared field in the most significant bits.
    MsbFirst,
}

// (shift under LsbFirst, width) for type:2 more:1 magic:3 depth:10 addr:48
const KIND: (u32, u32) = (0, 2);
const MORE: (u32, u32) = (2, 1);
const MAGIC: (u32, u32) = (3, 3);
const DEPTH: (u32, u32) = (6, 10);
const ADDR: (u32, u32) = (16, 48);

impl BitOrder {
    fn shift(self, (lsb_shift, width): (u32, u32)) -> u32 {
        match self {
            BitOrder::LsbFirst => lsb_shift,
            BitOrder::MsbFirst => 64 - lsb_shift - width,
        }
    }

    fn get(self, word: u64, field: (u32, u32)) -> u64 {
        (word >> self.shift(field)) & mask(field.1)
    }

    fn put(self, field: (u32, u32), value: u64) -> u64 {
        (value & mask(field.1)) << self.shift(field)
    }

    pub fn magic_of(self, word: u64) -> u64 {
        self.get(word, MAGIC)
    }

    /// Finds the packing order under which `word` carries the record magic.
    pub fn detect(word: u64) -> Option<Self> {
        [BitOrder::LsbFirst, BitOrder::MsbFirst]
            .into_iter()
            .find(|order| order.magic_of(word) == RECORD_MAGIC)
    }
}

fn mask(width: u32) -> u64 {
    if width == 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

/// Order flags persisted on an open data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DataOrder {
    pub recorded: Endian,
    pub needs_byte_swap: bool,
    pub needs_bit_swap: bool,
}

impl DataOrder {
    /// `recorded` is the byte order from the header, `packing` the bit-field
    /// layout the recorder used for record words.
    pub fn detect(recorded: Endian, packing: BitOrder) -> Self {
        let needs_byte_swap = recorded != Endian::native();
        if needs_byte_swap {
            tracing::debug!(?recorded, "byte order is different");
        }

        // Reference record word as the recorder laid it out, then brought
        // into host order like any other field.
        let reference = RecordFields {
            magic: RECORD_MAGIC as u8,
            ..RecordFields::default()
        }
        .pack(packing);
        let mut stored = [0u8; 8];
        recorded.write_u64(&mut stored, reference);

        Self::from_stored_word(recorded, needs_byte_swap, &stored)
    }

    /// Detects the bit-field layout from a record actually read from the
    /// data. `None` when its magic is not found under either layout.
    pub fn from_record(recorded: Endian, bytes: &[u8; RECORD_SIZE]) -> Option<Self> {
        let needs_byte_swap = recorded != Endian::native();
        let mut word = [0u8; 8];
        word.copy_from_slice(&bytes[8..]);

        let mut host = NativeEndian::read_u64(&word);
        if needs_byte_swap {
            host = host.swap_bytes();
        }
        BitOrder::detect(host)?;
        Some(Self::from_stored_word(recorded, needs_byte_swap, &word))
    }

    fn from_stored_word(recorded: Endian, needs_byte_swap: bool, stored: &[u8; 8]) -> Self {
        let mut host = NativeEndian::read_u64(stored);
        if needs_byte_swap {
            host = host.swap_bytes();
        }

        let needs_bit_swap = match BitOrder::detect(host) {
            Some(BitOrder::LsbFirst) | None => false,
            Some(BitOrder::MsbFirst) => true,
        };
        if needs_bit_swap {
            tracing::debug!(?recorded, "bitfield order is different");
        }

        Self {
            recorded,
            needs_byte_swap,
            needs_bit_swap,
        }
    }

    pub fn native() -> Self {
        Self::detect(Endian::native(), BitOrder::LsbFirst)
    }

    pub fn bit_order(&self) -> BitOrder {
        if self.needs_bit_swap {
            BitOrder::MsbFirst
        } else {
            BitOrder::LsbFirst
        }
    }

    pub fn u16(&self, value: u16) -> u16 {
        if self.needs_byte_swap {
            value.swap_bytes()
        } else {
            value
        }
    }

    pub fn u32(&self, value: u32) -> u32 {
        if self.needs_byte_swap {
            value.swap_bytes()
        } else {
            value
        }
    }

    pub fn u64(&self, value: u64) -> u64 {
        if self.needs_byte_swap {
            value.swap_bytes()
        } else {
            value
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordFields {
    pub kind: u8,
    pub more: bool,
    pub magic: u8,
    pub depth: u16,
    pub addr: u64,
}

impl RecordFields {
    pub fn pack(&self, order: BitOrder) -> u64 {
        order.put(KIND, self.kind as u64)
            | order.put(MORE, self.more as u64)
            | order.put(MAGIC, self.magic as u64)
            | order.put(DEPTH, self.depth as u64)
            | order.put(ADDR, self.addr)
    }

    pub fn unpack(word: u64, order: BitOrder) -> Self {
        Self {
            kind: order.get(word, KIND) as u8,
            more: order.get(word, MORE) != 0,
            magic: order.get(word, MAGIC) as u8,
            depth: order.get(word, DEPTH) as u16,
            addr: order.get(word, ADDR),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordKind {
    Entry,
    Exit,
    Lost,
    Event,
}

impl RecordKind {
    fn from_bits(bits: u8) -> Self {
        match bits & 0b11 {
            0 => RecordKind::Entry,
            1 => RecordKind::Exit,
            2 => RecordKind::Lost,
            _ => RecordKind::Event,
        }
    }

    fn bits(self) -> u8 {
        match self {
            RecordKind::Entry => 0,
            RecordKind::Exit => 1,
            RecordKind::Lost => 2,
            RecordKind::Event => 3,
        }
    }
}

/// One call-stack record word pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Record {
    pub time: u64,
    pub kind: RecordKind,
    pub more: bool,
    pub depth: u16,
    pub addr: u64,
}

impl Record {
    /// Decodes a record applying byte order to whole words and bit order to
    /// field boundaries. Returns `None` when the magic does not match.
    pub fn decode(bytes: &[u8; RECORD_SIZE], order: &DataOrder) -> Option<Self> {
        let time = order.u64(NativeEndian::read_u64(&bytes[..8]));
        let word = order.u64(NativeEndian::read_u64(&bytes[8..]));
        let fields = RecordFields::unpack(word, order.bit_order());
        if fields.magic as u64 != RECORD_MAGIC {
            return None;
        }

        Some(Self {
            time,
            kind: RecordKind::from_bits(fields.kind),
            more: fields.more,
            depth: fields.depth,
            addr: fields.addr,
        })
    }

    /// Lays the record out the way a recorder with the given byte order and
    /// bit-field packing would store it.
    pub fn encode(&self, endian: Endian, packing: BitOrder) -> [u8; RECORD_SIZE] {
        let word = RecordFields {
            kind: self.kind.bits(),
            more: self.more,
            magic: RECORD_MAGIC as u8,
            depth: self.depth,
            addr: self.addr,
        }
        .pack(packing);

        let mut out = [0u8; RECORD_SIZE];
        endian.write_u64(&mut out[..8], self.time);
        endian.write_u64(&mut out[8..], word);
        out
    }
}
