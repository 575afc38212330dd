//! 에러 타입 정의

use thiserror::Error;

use crate::crypto::CryptoError;

/// Link-Chat 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON 에러: {0}")]
    Json(#[from] serde_json::Error),

    #[error("아카이브 에러: {0}")]
    Archive(String),

    #[error("암호화 에러: {0}")]
    Crypto(#[from] CryptoError),

    #[error("잘못된 프레임: {0}")]
    Malformed(&'static str),

    #[error("다른 프로토콜 프레임: expected {expected:04X}, got {got:04X}")]
    ForeignProtocol { expected: u16, got: u16 },

    #[error("프레임 크기 초과: {size} > {max}")]
    FrameTooLarge { size: usize, max: usize },

    #[error("프래그먼트 인덱스 범위 초과: index={index}, total={total}")]
    FragmentOutOfRange { index: u16, total: u8 },

    #[error("길이 불일치: declared={declared}, actual={actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("메시지 크기 초과: {size} bytes (최대 {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },

    #[error("해시 불일치: {hash}")]
    HashMismatch { hash: String },

    #[error("전송 미완료: {hash}, missing_chunks={missing}")]
    TransferIncomplete { hash: String, missing: u64 },

    #[error("유효하지 않은 청크 인덱스: {index}")]
    InvalidChunkIndex { index: u32 },

    #[error("유효하지 않은 MAC 주소: {0}")]
    InvalidMac(String),

    #[error("유효하지 않은 파일 이름: {0}")]
    InvalidName(String),

    #[error("소켓 사용 불가 ({interface}): {source}")]
    SocketUnavailable {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("채널 종료")]
    ChannelClosed,
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;
