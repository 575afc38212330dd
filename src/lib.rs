//! # Link-Chat
//!
//! IP 없이 raw Ethernet 프레임으로 동작하는 P2P 메시징/파일 전송
//!
//! ## 핵심 특징
//! - **커스텀 EtherType**: 채팅/파일 0x88B5, 탐색 0x88B6
//! - **프래그먼트 재조립**: (송신 MAC, message_id) 단위, 순서 무관
//! - **청크 파일 전송**: content hash로 식별, 임의 순서 쓰기, 해시 검증 후 완료
//! - **이웃 탐색**: 주기적 브로드캐스트 + 타임아웃 정리
//! - **하이브리드 암호화**: RSA-OAEP + AES-256-CBC
//!
//! 재전송, 흐름 제어 없음 (best-effort).

pub mod archive;
pub mod chat;
pub mod chunk;
pub mod config;
pub mod crypto;
pub mod discovery;
pub mod error;
pub mod frame;
pub mod link;
pub mod mac;
pub mod message;
pub mod names;
pub mod node;
pub mod reassembly;
pub mod transfer;

pub use chat::{ChatMessage, MessageChannel};
pub use chunk::{ChunkStore, ContentHash, FinalizedFile};
pub use config::Config;
pub use crypto::{CryptoError, KeyPair, PeerKeyTable};
pub use discovery::{DiscoveryService, PeerEvent, PeerTable};
pub use error::{Error, Result};
pub use frame::Frame;
pub use link::{Link, MemoryHub, MemoryLink, RawLink};
pub use mac::MacAddr;
pub use message::{FileFrame, FragmentHeader, FrameKind, MessageType, TransferMetadata};
pub use names::PeerNames;
pub use node::{Node, NodeEvents, NodeLinks};
pub use reassembly::{CompleteMessage, ReassemblyBuffer};
pub use transfer::{FileChannel, ReceivedFile};

/// 채팅/파일 EtherType
pub const ETH_P_LINKCHAT: u16 = 0x88B5;

/// 탐색 EtherType
pub const ETH_P_DISCOVERY: u16 = 0x88B6;

/// 프래그먼트당 최대 메시지 페이로드 (바이트)
pub const MAX_PAYLOAD_SIZE: usize = 1400;

/// 파일 청크 크기 (바이트)
pub const CHUNK_SIZE: usize = 1460;

/// 탐색 announce 페이로드
pub const DISCOVERY_MARKER: &[u8] = b"LINKDISCOVERY:HELLO";

/// Ethernet 헤더 크기 (dst + src + type)
pub const ETH_HEADER_SIZE: usize = 14;

/// 최대 프레임 크기 (헤더 + 1500 MTU)
pub const MAX_FRAME_SIZE: usize = 1514;
