//! 프로토콜 메시지 정의 (EtherType 0x88B5 프레임 본문)
//!
//! 본문 첫 바이트는 항상 [`FrameKind`] 태그.
//! 바이트를 시험 파싱해서 종류를 추측하지 않음.
//!
//! - Fragment: `kind | msg_type(1) | total(1) | index(2) | length(2) | message_id(2) | data`
//! - 파일 프레임: `kind | body_len(2) | body`
//!   - 메타데이터: `name_len(1) | name | size(8) | hash(16) [| inline 데이터]`
//!   - 청크: `hash(16) | chunk_index(4) | data`

use bytes::{BufMut, Bytes, BytesMut};

use crate::chunk::ContentHash;
use crate::{Error, Result, ETH_HEADER_SIZE, MAX_FRAME_SIZE};

/// 프래그먼트 헤더 크기 (kind 포함)
pub const FRAGMENT_HEADER_SIZE: usize = 9;

/// 파일 프레임 헤더 크기 (kind + body_len)
pub const FILE_HEADER_SIZE: usize = 3;

/// 파일 프레임 본문 최대 크기
pub const MAX_FILE_BODY: usize = MAX_FRAME_SIZE - ETH_HEADER_SIZE - FILE_HEADER_SIZE;

/// 청크 본문 헤더 크기 (hash + index)
pub const CHUNK_BODY_HEADER_SIZE: usize = 20;

/// 파일 이름 최대 길이 (UTF-8 바이트)
pub const MAX_NAME_LEN: usize = 255;

/// 프레임 종류 태그
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// 메시지 프래그먼트
    Fragment = 0x01,

    /// 파일 메타데이터
    FileMeta = 0x10,

    /// 디렉터리 아카이브 메타데이터
    ArchiveMeta = 0x11,

    /// 파일 청크
    FileChunk = 0x12,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(FrameKind::Fragment),
            0x10 => Ok(FrameKind::FileMeta),
            0x11 => Ok(FrameKind::ArchiveMeta),
            0x12 => Ok(FrameKind::FileChunk),
            _ => Err(Error::Malformed("알 수 없는 프레임 종류")),
        }
    }
}

/// 애플리케이션 메시지 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// 채팅 텍스트
    Text,

    /// 공개키 배포 (PEM)
    PublicKey,

    /// 그 외 값은 그대로 전달
    Other(u8),
}

impl From<u8> for MessageType {
    fn from(value: u8) -> Self {
        match value {
            1 => MessageType::Text,
            2 => MessageType::PublicKey,
            other => MessageType::Other(other),
        }
    }
}

impl From<MessageType> for u8 {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Text => 1,
            MessageType::PublicKey => 2,
            MessageType::Other(other) => other,
        }
    }
}

/// 메시지 프래그먼트 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_type: MessageType,

    /// 메시지의 총 프래그먼트 수
    pub total_fragments: u8,

    /// 이 프래그먼트의 인덱스 (0부터)
    pub fragment_index: u16,

    /// 뒤따르는 데이터 길이
    pub fragment_length: u16,

    /// 송신자별 메시지 ID (재조립 키)
    pub message_id: u16,
}

impl FragmentHeader {
    pub fn to_bytes(&self) -> [u8; FRAGMENT_HEADER_SIZE] {
        let mut buf = [0u8; FRAGMENT_HEADER_SIZE];
        buf[0] = FrameKind::Fragment as u8;
        buf[1] = self.message_type.into();
        buf[2] = self.total_fragments;
        buf[3..5].copy_from_slice(&self.fragment_index.to_be_bytes());
        buf[5..7].copy_from_slice(&self.fragment_length.to_be_bytes());
        buf[7..9].copy_from_slice(&self.message_id.to_be_bytes());
        buf
    }

    /// 본문에서 헤더와 데이터 추출
    ///
    /// 데이터는 정확히 `fragment_length` 바이트 (뒤쪽 패딩은 버림).
    pub fn parse(body: &[u8]) -> Result<(Self, Bytes)> {
        if body.len() < FRAGMENT_HEADER_SIZE {
            return Err(Error::Malformed("프래그먼트 헤더보다 짧음"));
        }
        if FrameKind::try_from(body[0])? != FrameKind::Fragment {
            return Err(Error::Malformed("프래그먼트가 아님"));
        }

        let header = Self {
            message_type: MessageType::from(body[1]),
            total_fragments: body[2],
            fragment_index: u16::from_be_bytes([body[3], body[4]]),
            fragment_length: u16::from_be_bytes([body[5], body[6]]),
            message_id: u16::from_be_bytes([body[7], body[8]]),
        };

        let data = &body[FRAGMENT_HEADER_SIZE..];
        let declared = header.fragment_length as usize;
        if data.len() < declared {
            return Err(Error::LengthMismatch {
                declared,
                actual: data.len(),
            });
        }

        Ok((header, Bytes::copy_from_slice(&data[..declared])))
    }
}

/// 파일 전송 메타데이터
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferMetadata {
    pub file_name: String,
    pub size: u64,
    pub content_hash: ContentHash,
}

impl TransferMetadata {
    pub fn new(file_name: impl Into<String>, size: u64, content_hash: ContentHash) -> Result<Self> {
        let file_name = file_name.into();
        if file_name.is_empty() || file_name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidName(file_name));
        }
        Ok(Self {
            file_name,
            size,
            content_hash,
        })
    }

    /// 인코딩된 길이
    pub fn encoded_len(&self) -> usize {
        1 + self.file_name.len() + 8 + 16
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        buf.put_u8(self.file_name.len() as u8);
        buf.put_slice(self.file_name.as_bytes());
        buf.put_u64(self.size);
        buf.put_slice(&self.content_hash);
        buf.to_vec()
    }

    /// 메타데이터 파싱, 소비한 바이트 수 반환
    pub fn parse(body: &[u8]) -> Result<(Self, usize)> {
        let name_len = *body.first().ok_or(Error::Malformed("빈 메타데이터"))? as usize;
        if name_len == 0 {
            return Err(Error::Malformed("name_len 0"));
        }

        let total = 1 + name_len + 8 + 16;
        if body.len() < total {
            return Err(Error::LengthMismatch {
                declared: total,
                actual: body.len(),
            });
        }

        let file_name = std::str::from_utf8(&body[1..1 + name_len])
            .map_err(|_| Error::Malformed("파일 이름이 UTF-8이 아님"))?
            .to_string();

        let mut size_bytes = [0u8; 8];
        size_bytes.copy_from_slice(&body[1 + name_len..1 + name_len + 8]);

        let mut content_hash = [0u8; 16];
        content_hash.copy_from_slice(&body[1 + name_len + 8..total]);

        Ok((
            Self {
                file_name,
                size: u64::from_be_bytes(size_bytes),
                content_hash,
            },
            total,
        ))
    }
}

/// 청크 본문
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkBody {
    pub content_hash: ContentHash,
    pub index: u32,
    pub data: Bytes,
}

impl ChunkBody {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(CHUNK_BODY_HEADER_SIZE + self.data.len());
        buf.put_slice(&self.content_hash);
        buf.put_u32(self.index);
        buf.put_slice(&self.data);
        buf.to_vec()
    }

    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() <= CHUNK_BODY_HEADER_SIZE {
            return Err(Error::Malformed("청크 본문이 너무 짧음"));
        }

        let mut content_hash = [0u8; 16];
        content_hash.copy_from_slice(&body[..16]);
        let index = u32::from_be_bytes([body[16], body[17], body[18], body[19]]);

        Ok(Self {
            content_hash,
            index,
            data: Bytes::copy_from_slice(&body[CHUNK_BODY_HEADER_SIZE..]),
        })
    }
}

/// 파일 채널 프레임
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFrame {
    /// 메타데이터 (작은 파일은 내용 포함)
    Meta {
        metadata: TransferMetadata,
        archive: bool,
        inline: Option<Bytes>,
    },

    /// 파일 청크
    Chunk(ChunkBody),
}

impl FileFrame {
    pub fn kind(&self) -> FrameKind {
        match self {
            FileFrame::Meta { archive: true, .. } => FrameKind::ArchiveMeta,
            FileFrame::Meta { archive: false, .. } => FrameKind::FileMeta,
            FileFrame::Chunk(_) => FrameKind::FileChunk,
        }
    }

    /// `kind | body_len | body` 인코딩
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let body = match self {
            FileFrame::Meta {
                metadata, inline, ..
            } => {
                let mut body = metadata.to_bytes();
                if let Some(inline) = inline {
                    body.extend_from_slice(inline);
                }
                body
            }
            FileFrame::Chunk(chunk) => chunk.to_bytes(),
        };

        if body.len() > MAX_FILE_BODY {
            return Err(Error::FrameTooLarge {
                size: body.len() + ETH_HEADER_SIZE + FILE_HEADER_SIZE,
                max: MAX_FRAME_SIZE,
            });
        }

        let mut buf = BytesMut::with_capacity(FILE_HEADER_SIZE + body.len());
        buf.put_u8(self.kind() as u8);
        buf.put_u16(body.len() as u16);
        buf.put_slice(&body);
        Ok(buf.to_vec())
    }

    /// 파일 프레임 파싱. 프래그먼트 등 다른 종류는 `Malformed`.
    pub fn parse(frame_body: &[u8]) -> Result<Self> {
        if frame_body.len() < FILE_HEADER_SIZE {
            return Err(Error::Malformed("파일 프레임 헤더보다 짧음"));
        }

        let kind = FrameKind::try_from(frame_body[0])?;
        let declared = u16::from_be_bytes([frame_body[1], frame_body[2]]) as usize;
        let rest = &frame_body[FILE_HEADER_SIZE..];
        if rest.len() < declared {
            return Err(Error::LengthMismatch {
                declared,
                actual: rest.len(),
            });
        }
        let body = &rest[..declared];

        match kind {
            FrameKind::FileMeta | FrameKind::ArchiveMeta => {
                let (metadata, consumed) = TransferMetadata::parse(body)?;
                let tail = &body[consumed..];
                // 크기만큼 내용이 붙어 있으면 단일 프레임 파일 (빈 파일 포함)
                let inline = if tail.is_empty() {
                    (metadata.size == 0).then(Bytes::new)
                } else if tail.len() as u64 == metadata.size {
                    Some(Bytes::copy_from_slice(tail))
                } else {
                    return Err(Error::LengthMismatch {
                        declared: metadata.size as usize,
                        actual: tail.len(),
                    });
                };
                Ok(FileFrame::Meta {
                    metadata,
                    archive: kind == FrameKind::ArchiveMeta,
                    inline,
                })
            }
            FrameKind::FileChunk => Ok(FileFrame::Chunk(ChunkBody::parse(body)?)),
            FrameKind::Fragment => Err(Error::Malformed("파일 프레임이 아님")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fragment_header_layout() {
        let header = FragmentHeader {
            message_type: MessageType::Text,
            total_fragments: 4,
            fragment_index: 2,
            fragment_length: 3,
            message_id: 0x0102,
        };
        let mut body = header.to_bytes().to_vec();
        body.extend_from_slice(b"abc");
        // Ethernet 최소 프레임 패딩
        body.extend_from_slice(&[0u8; 20]);

        assert_eq!(&body[..9], &[0x01, 1, 4, 0, 2, 0, 3, 0x01, 0x02]);

        let (parsed, data) = FragmentHeader::parse(&body).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(data.as_ref(), b"abc");
    }

    #[test]
    fn test_fragment_truncated_data() {
        let header = FragmentHeader {
            message_type: MessageType::Text,
            total_fragments: 1,
            fragment_index: 0,
            fragment_length: 100,
            message_id: 0,
        };
        let mut body = header.to_bytes().to_vec();
        body.extend_from_slice(&[0u8; 10]);

        assert!(matches!(
            FragmentHeader::parse(&body),
            Err(Error::LengthMismatch { declared: 100, actual: 10 })
        ));
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::from(1), MessageType::Text);
        assert_eq!(MessageType::from(2), MessageType::PublicKey);
        assert_eq!(MessageType::from(7), MessageType::Other(7));
        assert_eq!(u8::from(MessageType::Other(7)), 7);
    }

    #[test]
    fn test_metadata_layout() {
        let meta = TransferMetadata::new("a.txt", 3000, [0xAA; 16]).unwrap();
        let bytes = meta.to_bytes();

        assert_eq!(bytes[0], 5);
        assert_eq!(&bytes[1..6], b"a.txt");
        assert_eq!(&bytes[6..14], &3000u64.to_be_bytes());
        assert_eq!(&bytes[14..30], &[0xAA; 16]);

        let (parsed, consumed) = TransferMetadata::parse(&bytes).unwrap();
        assert_eq!(parsed, meta);
        assert_eq!(consumed, 30);
    }

    #[test]
    fn test_metadata_rejects_bad_names() {
        assert!(TransferMetadata::new("", 1, [0; 16]).is_err());
        assert!(TransferMetadata::new("x".repeat(256), 1, [0; 16]).is_err());

        let mut bytes = TransferMetadata::new("ab", 1, [0; 16]).unwrap().to_bytes();
        bytes[1] = 0xFF;
        bytes[2] = 0xFE;
        assert!(TransferMetadata::parse(&bytes).is_err());
    }

    #[test]
    fn test_file_frame_kind_is_explicit() {
        let chunk = FileFrame::Chunk(ChunkBody {
            content_hash: [7; 16],
            index: 2,
            data: Bytes::from_static(b"tail"),
        });
        let bytes = chunk.to_bytes().unwrap();
        assert_eq!(bytes[0], FrameKind::FileChunk as u8);
        assert_eq!(&bytes[1..3], &24u16.to_be_bytes());
        assert_eq!(&bytes[3 + 16..3 + 20], &2u32.to_be_bytes());
        assert_eq!(FileFrame::parse(&bytes).unwrap(), chunk);

        // 메타데이터처럼 보이는 청크도 태그대로 청크로 해석
        let tricky = FileFrame::Chunk(ChunkBody {
            content_hash: [1; 16],
            index: 0,
            data: Bytes::from_static(b"looks like metadata"),
        });
        let parsed = FileFrame::parse(&tricky.to_bytes().unwrap()).unwrap();
        assert!(matches!(parsed, FileFrame::Chunk(_)));
    }

    #[test]
    fn test_meta_frame_with_inline_content() {
        let meta = TransferMetadata::new("small.bin", 4, [3; 16]).unwrap();
        let frame = FileFrame::Meta {
            metadata: meta.clone(),
            archive: true,
            inline: Some(Bytes::from_static(b"data")),
        };
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(bytes[0], FrameKind::ArchiveMeta as u8);
        assert_eq!(FileFrame::parse(&bytes).unwrap(), frame);

        let header_only = FileFrame::Meta {
            metadata: meta,
            archive: false,
            inline: None,
        };
        assert_eq!(
            FileFrame::parse(&header_only.to_bytes().unwrap()).unwrap(),
            header_only
        );
    }

    #[test]
    fn test_empty_file_is_inline() {
        let meta = TransferMetadata::new("empty", 0, [0; 16]).unwrap();
        let frame = FileFrame::Meta {
            metadata: meta,
            archive: false,
            inline: Some(Bytes::new()),
        };
        assert_eq!(FileFrame::parse(&frame.to_bytes().unwrap()).unwrap(), frame);
    }

    #[test]
    fn test_file_frame_length_checks() {
        let chunk = FileFrame::Chunk(ChunkBody {
            content_hash: [0; 16],
            index: 0,
            data: Bytes::from(vec![1u8; 100]),
        });
        let bytes = chunk.to_bytes().unwrap();
        assert!(FileFrame::parse(&bytes[..50]).is_err());

        let big = FileFrame::Chunk(ChunkBody {
            content_hash: [0; 16],
            index: 0,
            data: Bytes::from(vec![1u8; MAX_FILE_BODY]),
        });
        assert!(matches!(big.to_bytes(), Err(Error::FrameTooLarge { .. })));
    }
}
