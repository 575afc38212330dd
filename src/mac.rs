//! MAC 주소 타입

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// 6바이트 하드웨어 주소
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// ff:ff:ff:ff:ff:ff
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);

    /// 00:00:00:00:00:00 (인터페이스 MAC을 모를 때)
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// 슬라이스 앞 6바이트로 생성
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self(arr))
    }

    /// `/sys/class/net/<iface>/address`에서 인터페이스 MAC 읽기
    pub fn from_interface(interface: &str) -> Result<Self> {
        let path = format!("/sys/class/net/{}/address", interface);
        let text = std::fs::read_to_string(&path)?;
        text.trim().parse()
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    /// `aa:bb:cc:dd:ee:ff`, `aa-bb-..`, `aabbccddeeff` 형식 허용
    fn from_str(s: &str) -> Result<Self> {
        let compact: String = s
            .trim()
            .chars()
            .filter(|c| *c != ':' && *c != '-')
            .collect();
        let bytes = hex::decode(&compact).map_err(|_| Error::InvalidMac(s.to_string()))?;
        Self::from_slice(&bytes)
            .filter(|_| bytes.len() == 6)
            .ok_or_else(|| Error::InvalidMac(s.to_string()))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_formats() {
        let expected = MacAddr([0xac, 0x74, 0xb1, 0x84, 0xa2, 0xba]);
        assert_eq!("ac:74:b1:84:a2:ba".parse::<MacAddr>().unwrap(), expected);
        assert_eq!("AC-74-B1-84-A2-BA".parse::<MacAddr>().unwrap(), expected);
        assert_eq!("ac74b184a2ba".parse::<MacAddr>().unwrap(), expected);
        assert_eq!(expected.to_string(), "ac:74:b1:84:a2:ba");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("ac:74:b1".parse::<MacAddr>().is_err());
        assert!("zz:74:b1:84:a2:ba".parse::<MacAddr>().is_err());
        assert!("ac:74:b1:84:a2:ba:00".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_broadcast() {
        assert!("ff:ff:ff:ff:ff:ff".parse::<MacAddr>().unwrap().is_broadcast());
        assert!(!MacAddr::ZERO.is_broadcast());
    }
}
