//! 링크 계층 프레임 (Ethernet 헤더)
//!
//! `dst(6) | src(6) | protocol_id(2) | body`
//! 상태 없음. 프로토콜 ID가 다른 프레임은 에러가 아니라 "우리 것이 아님"으로 취급.

use bytes::{BufMut, Bytes, BytesMut};

use crate::mac::MacAddr;
use crate::{Error, Result, ETH_HEADER_SIZE, MAX_FRAME_SIZE};

/// 디코딩된 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub dst: MacAddr,
    pub src: MacAddr,
    pub protocol_id: u16,
    /// Ethernet 헤더 이후의 모든 바이트 (패딩 포함 가능)
    pub body: Bytes,
}

impl Frame {
    /// 프레임 인코딩
    ///
    /// `header`와 `payload`를 이어 붙임. MTU를 넘으면 `FrameTooLarge`.
    pub fn encode(
        dst: MacAddr,
        src: MacAddr,
        protocol_id: u16,
        header: &[u8],
        payload: &[u8],
    ) -> Result<Vec<u8>> {
        let size = ETH_HEADER_SIZE + header.len() + payload.len();
        if size > MAX_FRAME_SIZE {
            return Err(Error::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_slice(dst.as_bytes());
        buf.put_slice(src.as_bytes());
        buf.put_u16(protocol_id);
        buf.put_slice(header);
        buf.put_slice(payload);
        Ok(buf.to_vec())
    }

    /// 프레임 디코딩
    pub fn decode(buf: &[u8], expected_protocol: u16) -> Result<Self> {
        if buf.len() < ETH_HEADER_SIZE {
            return Err(Error::Malformed("Ethernet 헤더보다 짧음"));
        }

        let protocol_id = u16::from_be_bytes([buf[12], buf[13]]);
        if protocol_id != expected_protocol {
            return Err(Error::ForeignProtocol {
                expected: expected_protocol,
                got: protocol_id,
            });
        }

        let dst = MacAddr::from_slice(&buf[0..6]).ok_or(Error::Malformed("dst"))?;
        let src = MacAddr::from_slice(&buf[6..12]).ok_or(Error::Malformed("src"))?;

        Ok(Self {
            dst,
            src,
            protocol_id,
            body: Bytes::copy_from_slice(&buf[ETH_HEADER_SIZE..]),
        })
    }

    /// 자신에게 온 프레임인지 (유니캐스트 또는 브로드캐스트)
    pub fn is_for(&self, local: MacAddr) -> bool {
        self.dst == local || self.dst.is_broadcast()
    }
}
