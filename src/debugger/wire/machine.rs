use bytes::{Buf, BufMut, BytesMut};
use serde::Deserialize;
use strum_macros::{Display, EnumString};

#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize, EnumString, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ByteOrder {
    Little,
    Big,
}

/// Target machine parameters negotiated once per connection.
/// Every binary integer on the wire and every integer read from target memory
/// is interpreted with these parameters.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Deserialize)]
pub struct MachineDescription {
    /// Pointer width in bytes, 4 or 8.
    pub address_size: usize,
    pub byte_order: ByteOrder,
}

impl Default for MachineDescription {
    fn default() -> Self {
        Self::X86
    }
}

impl MachineDescription {
    /// 32-bit little-endian x86.
    pub const X86: MachineDescription = MachineDescription {
        address_size: 4,
        byte_order: ByteOrder::Little,
    };

    pub fn is_valid(&self) -> bool {
        matches!(self.address_size, 4 | 8)
    }

    /// Largest address representable on the target.
    pub fn address_mask(&self) -> u64 {
        if self.address_size >= 8 {
            u64::MAX
        } else {
            (1u64 << (self.address_size * 8)) - 1
        }
    }

    pub fn decode_u32(&self, mut raw: &[u8]) -> u32 {
        match self.byte_order {
            ByteOrder::Little => raw.get_u32_le(),
            ByteOrder::Big => raw.get_u32(),
        }
    }

    pub fn decode_u16(&self, mut raw: &[u8]) -> u16 {
        match self.byte_order {
            ByteOrder::Little => raw.get_u16_le(),
            ByteOrder::Big => raw.get_u16(),
        }
    }

    /// Decode an address sized integer, `raw` must hold at least `address_size` bytes.
    pub fn decode_address(&self, mut raw: &[u8]) -> u64 {
        match self.byte_order {
            ByteOrder::Little => raw.get_uint_le(self.address_size),
            ByteOrder::Big => raw.get_uint(self.address_size),
        }
    }

    pub fn encode_u32(&self, value: u32) -> BytesMut {
        let mut buf = BytesMut::with_capacity(4);
        match self.byte_order {
            ByteOrder::Little => buf.put_u32_le(value),
            ByteOrder::Big => buf.put_u32(value),
        }
        buf
    }
}
