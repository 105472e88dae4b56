//! Flag bytes for MQTT packets

use devsim_core::{DeviceError, DeviceResult};

/// CONNECT flags (1 byte)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConnectFlags(pub u8);

impl ConnectFlags {
    pub const NONE: ConnectFlags = ConnectFlags(0);

    // Flag bits
    pub const RESERVED: u8 = 0b0000_0001;
    pub const CLEAN_SESSION: u8 = 0b0000_0010;
    pub const WILL: u8 = 0b0000_0100;
    pub const WILL_QOS: u8 = 0b0001_1000;
    pub const WILL_RETAIN: u8 = 0b0010_0000;
    pub const PASSWORD: u8 = 0b0100_0000;
    pub const USERNAME: u8 = 0b1000_0000;

    #[inline]
    pub fn new(bits: u8) -> Self {
        ConnectFlags(bits)
    }

    #[inline]
    pub fn is_clean_session(self) -> bool {
        self.0 & Self::CLEAN_SESSION != 0
    }

    #[inline]
    pub fn has_will(self) -> bool {
        self.0 & Self::WILL != 0
    }

    #[inline]
    pub fn has_username(self) -> bool {
        self.0 & Self::USERNAME != 0
    }

    #[inline]
    pub fn has_password(self) -> bool {
        self.0 & Self::PASSWORD != 0
    }

    #[inline]
    pub fn set_clean_session(&mut self, value: bool) {
        if value {
            self.0 |= Self::CLEAN_SESSION;
        } else {
            self.0 &= !Self::CLEAN_SESSION;
        }
    }
}

impl From<u8> for ConnectFlags {
    fn from(bits: u8) -> Self {
        ConnectFlags(bits)
    }
}

impl From<ConnectFlags> for u8 {
    fn from(flags: ConnectFlags) -> Self {
        flags.0
    }
}

/// Delivery guarantee
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_byte(b: u8) -> DeviceResult<Self> {
        match b {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            _ => Err(DeviceError::InvalidWireFormat(format!("Invalid QoS {b}"))),
        }
    }

    #[inline]
    pub fn to_byte(self) -> u8 {
        self as u8
    }
}

/// PUBLISH fixed-header flags (low nibble)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PublishFlags {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishFlags {
    pub const DUP: u8 = 0b1000;
    pub const QOS_MASK: u8 = 0b0110;
    pub const RETAIN: u8 = 0b0001;

    pub fn from_nibble(n: u8) -> DeviceResult<Self> {
        Ok(PublishFlags {
            dup: n & Self::DUP != 0,
            qos: QoS::from_byte((n & Self::QOS_MASK) >> 1)?,
            retain: n & Self::RETAIN != 0,
        })
    }

    pub fn to_nibble(self) -> u8 {
        let mut n = self.qos.to_byte() << 1;
        if self.dup {
            n |= Self::DUP;
        }
        if self.retain {
            n |= Self::RETAIN;
        }
        n
    }
}
