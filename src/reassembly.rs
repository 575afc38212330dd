//! 메시지 재조립 버퍼
//!
//! (송신 MAC, message_id) 별로 프래그먼트 슬롯을 채워
//! 모든 슬롯이 차는 순간 메시지를 완성하고 엔트리를 제거.
//! 순서 없는 도착, 중복 도착 모두 허용.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::mac::MacAddr;
use crate::message::{FragmentHeader, MessageType};
use crate::{Error, Result};

/// 재조립 완료된 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompleteMessage {
    pub source: MacAddr,
    pub message_type: MessageType,
    pub message_id: u16,
    pub payload: Bytes,
}

/// 재조립 중인 메시지
#[derive(Debug)]
struct Entry {
    message_type: MessageType,
    slots: Vec<Option<Bytes>>,
    filled: usize,
    last_seen: Instant,
}

impl Entry {
    fn new(message_type: MessageType, total: u8) -> Self {
        Self {
            message_type,
            slots: vec![None; total as usize],
            filled: 0,
            last_seen: Instant::now(),
        }
    }

    fn is_complete(&self) -> bool {
        self.filled == self.slots.len()
    }

    fn assemble(self) -> Bytes {
        let len = self.slots.iter().flatten().map(|s| s.len()).sum();
        let mut buf = BytesMut::with_capacity(len);
        for slot in self.slots.into_iter().flatten() {
            buf.extend_from_slice(&slot);
        }
        buf.freeze()
    }
}

/// 프래그먼트 재조립 테이블
#[derive(Debug, Default)]
pub struct ReassemblyBuffer {
    entries: HashMap<(MacAddr, u16), Entry>,
}

impl ReassemblyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 프래그먼트 유효성 검사
    pub fn validate(header: &FragmentHeader, data: &[u8]) -> Result<()> {
        if header.fragment_index >= header.total_fragments as u16 {
            return Err(Error::FragmentOutOfRange {
                index: header.fragment_index,
                total: header.total_fragments,
            });
        }
        if header.fragment_length as usize != data.len() {
            return Err(Error::LengthMismatch {
                declared: header.fragment_length as usize,
                actual: data.len(),
            });
        }
        Ok(())
    }

    /// 프래그먼트 삽입
    ///
    /// 마지막 빈 슬롯이 채워지면 완성된 메시지 반환.
    /// 잘못된 프래그먼트는 버림.
    pub fn on_fragment(
        &mut self,
        source: MacAddr,
        header: &FragmentHeader,
        data: &[u8],
    ) -> Option<CompleteMessage> {
        if let Err(e) = Self::validate(header, data) {
            trace!(%source, error = %e, "프래그먼트 버림");
            return None;
        }

        let key = (source, header.message_id);
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| Entry::new(header.message_type, header.total_fragments));

        // 같은 ID로 다른 메시지가 섞이면 무시
        if entry.slots.len() != header.total_fragments as usize
            || entry.message_type != header.message_type
        {
            trace!(%source, message_id = header.message_id, "프래그먼트 헤더 불일치, 버림");
            return None;
        }

        entry.last_seen = Instant::now();

        let slot = &mut entry.slots[header.fragment_index as usize];
        if slot.is_none() {
            *slot = Some(Bytes::copy_from_slice(data));
            entry.filled += 1;
        }

        if !entry.is_complete() {
            return None;
        }

        let entry = self.entries.remove(&key)?;
        let message_type = entry.message_type;
        Some(CompleteMessage {
            source,
            message_type,
            message_id: header.message_id,
            payload: entry.assemble(),
        })
    }

    /// 오래된 미완성 엔트리 제거, 제거 수 반환
    pub fn sweep(&mut self, now: Instant, max_age: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.saturating_duration_since(entry.last_seen) <= max_age);
        before - self.entries.len()
    }

    /// 재조립 중인 메시지 수
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
