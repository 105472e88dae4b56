//! Fixed header for MQTT packets
//!
//! Fixed header is 2-5 bytes:
//! - Byte 0: Packet type (high nibble) + flags (low nibble)
//! - Bytes 1..=4: Remaining length, base-128 varint, least significant group first

use bytes::{BufMut, BytesMut};
use devsim_core::{DeviceError, DeviceResult};

/// Largest remaining length expressible in four varint bytes
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Largest fixed header in bytes
pub const MAX_FIXED_HEADER_SIZE: usize = 5;

/// MQTT control packet types understood by devsim
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    ConnAck = 2,
    Publish = 3,
    Subscribe = 8,
    SubAck = 9,
    PingReq = 12,
    PingResp = 13,
}

impl PacketType {
    pub fn from_nibble(n: u8) -> Option<Self> {
        match n {
            1 => Some(PacketType::Connect),
            2 => Some(PacketType::ConnAck),
            3 => Some(PacketType::Publish),
            8 => Some(PacketType::Subscribe),
            9 => Some(PacketType::SubAck),
            12 => Some(PacketType::PingReq),
            13 => Some(PacketType::PingResp),
            _ => None,
        }
    }

    #[inline]
    pub fn to_nibble(self) -> u8 {
        self as u8
    }

    /// Flags the protocol mandates for this type; PUBLISH carries its own.
    fn required_flags(self) -> Option<u8> {
        match self {
            PacketType::Publish => None,
            PacketType::Subscribe => Some(0b0010),
            _ => Some(0),
        }
    }
}

/// Fixed header structure
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    /// Low nibble of byte 0
    pub flags: u8,
    /// Bytes following the fixed header
    pub remaining_length: usize,
}

impl FixedHeader {
    pub fn new(packet_type: PacketType, flags: u8, remaining_length: usize) -> Self {
        FixedHeader {
            packet_type,
            flags: flags & 0x0F,
            remaining_length,
        }
    }

    /// Parse a fixed header.
    ///
    /// Returns `Ok(None)` when `buf` ends before the header does, otherwise
    /// the header and the number of bytes it occupies.
    pub fn parse(buf: &[u8]) -> DeviceResult<Option<(Self, usize)>> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };

        let type_nibble = first >> 4;
        let packet_type = PacketType::from_nibble(type_nibble)
            .ok_or(DeviceError::UnknownPacketType(type_nibble))?;
        let flags = first & 0x0F;

        if let Some(required) = packet_type.required_flags() {
            if flags != required {
                return Err(DeviceError::InvalidWireFormat(format!(
                    "{packet_type:?} with reserved flags {flags:#06b}"
                )));
            }
        }

        let Some((remaining_length, used)) = decode_remaining_length(&buf[1..])? else {
            return Ok(None);
        };

        Ok(Some((
            FixedHeader {
                packet_type,
                flags,
                remaining_length,
            },
            1 + used,
        )))
    }

    /// Serialize header into `buf`
    pub fn serialize(&self, buf: &mut BytesMut) -> DeviceResult<()> {
        buf.put_u8((self.packet_type.to_nibble() << 4) | self.flags);
        encode_remaining_length(self.remaining_length, buf)
    }

    /// Total packet size including this header
    pub fn packet_len(&self) -> usize {
        1 + remaining_length_size(self.remaining_length) + self.remaining_length
    }
}

/// Decode a remaining-length varint.
///
/// `Ok(None)` means more bytes are needed.
pub fn decode_remaining_length(buf: &[u8]) -> DeviceResult<Option<(usize, usize)>> {
    let mut value = 0usize;
    let mut multiplier = 1usize;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= 4 {
            return Err(DeviceError::MalformedRemainingLength);
        }
        value += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
        multiplier *= 128;
    }

    if buf.len() >= 4 {
        return Err(DeviceError::MalformedRemainingLength);
    }
    Ok(None)
}

/// Encode a remaining-length varint
pub fn encode_remaining_length(mut len: usize, buf: &mut BytesMut) -> DeviceResult<()> {
    if len > MAX_REMAINING_LENGTH {
        return Err(DeviceError::InvalidWireFormat(format!(
            "Packet too large: {} > {}",
            len, MAX_REMAINING_LENGTH
        )));
    }

    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            return Ok(());
        }
    }
}

/// Bytes needed to encode `len` as a varint
#[inline]
pub fn remaining_length_size(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}
