//! 메시지 채널 (EtherType 0x88B5, Fragment 프레임)
//!
//! - 송신: 암호화 (공개키를 알 때) → 프래그먼트 분할 → 간격 두고 전송
//! - 수신: 프래그먼트 재조립 → 공개키 등록 또는 복호화(실패 시 평문) → 큐

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::crypto::{self, KeyPair, PeerKeyTable};
use crate::frame::Frame;
use crate::link::Link;
use crate::mac::MacAddr;
use crate::message::{FragmentHeader, FrameKind, MessageType};
use crate::reassembly::{CompleteMessage, ReassemblyBuffer};
use crate::{Config, Error, Result, ETH_P_LINKCHAT, MAX_FRAME_SIZE};

/// 메시지당 최대 프래그먼트 수 (헤더의 total 필드가 u8)
pub const MAX_FRAGMENTS: usize = u8::MAX as usize;

/// 수신한 채팅 메시지
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub source: MacAddr,
    pub message_type: MessageType,
    pub payload: Bytes,
}

impl ChatMessage {
    /// 페이로드를 텍스트로 (잘못된 UTF-8은 대체 문자)
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// 페이로드를 프래그먼트로 분할
///
/// `ceil(len / max_payload)`개, 빈 페이로드도 빈 프래그먼트 하나.
pub fn fragment_payload(
    message_type: MessageType,
    message_id: u16,
    payload: &[u8],
    max_payload: usize,
) -> Result<Vec<(FragmentHeader, Bytes)>> {
    let max_payload = max_payload.max(1);
    let count = payload.len().div_ceil(max_payload).max(1);
    if count > MAX_FRAGMENTS {
        return Err(Error::MessageTooLarge {
            size: payload.len(),
            max: MAX_FRAGMENTS * max_payload,
        });
    }

    let pieces: Vec<&[u8]> = if payload.is_empty() {
        vec![&[]]
    } else {
        payload.chunks(max_payload).collect()
    };

    Ok(pieces
        .into_iter()
        .enumerate()
        .map(|(index, data)| {
            let header = FragmentHeader {
                message_type,
                total_fragments: count as u8,
                fragment_index: index as u16,
                fragment_length: data.len() as u16,
                message_id,
            };
            (header, Bytes::copy_from_slice(data))
        })
        .collect())
}

/// 메시지 채널 핸들
pub struct MessageChannel {
    link: Arc<dyn Link>,
    config: Config,
    keypair: Arc<KeyPair>,
    peer_keys: Arc<PeerKeyTable>,
    reassembly: Arc<Mutex<ReassemblyBuffer>>,
    next_message_id: AtomicU16,
    running: Arc<AtomicBool>,
}

impl MessageChannel {
    /// 채널 생성 및 수신/정리 태스크 시작
    pub fn start(
        link: Arc<dyn Link>,
        config: Config,
        keypair: Arc<KeyPair>,
        peer_keys: Arc<PeerKeyTable>,
    ) -> (Self, mpsc::Receiver<ChatMessage>) {
        let (message_tx, message_rx) = mpsc::channel(config.queue_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));
        let reassembly = Arc::new(Mutex::new(ReassemblyBuffer::new()));

        info!(
            "message channel started on {} (protocol 0x{:04X})",
            link.local_mac(),
            link.protocol_id()
        );

        // 수신 태스크
        let receiver = ChatReceiver {
            link: link.clone(),
            keypair: keypair.clone(),
            peer_keys: peer_keys.clone(),
            reassembly: reassembly.clone(),
            message_tx,
        };
        let running_recv = running.clone();
        let poll_interval = config.poll_interval();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_SIZE + 64];

            while running_recv.load(Ordering::SeqCst) {
                match tokio::time::timeout(poll_interval, receiver.link.recv(&mut buf)).await {
                    Ok(Ok(len)) => {
                        if !receiver.handle_frame(&buf[..len]).await {
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("수신 에러: {}", e);
                        tokio::time::sleep(poll_interval).await;
                    }
                    Err(_) => {
                        // 타임아웃, running 플래그 재확인
                    }
                }
            }

            debug!("message receive task stopped");
        });

        // 재조립 정리 태스크
        let running_sweep = running.clone();
        let reassembly_sweep = reassembly.clone();
        let sweep_interval = config.sweep_interval();
        let max_age = config.reassembly_timeout();

        tokio::spawn(async move {
            while running_sweep.load(Ordering::SeqCst) {
                tokio::time::sleep(sweep_interval).await;
                let removed = reassembly_sweep.lock().sweep(Instant::now(), max_age);
                if removed > 0 {
                    warn!("미완성 메시지 {}개 폐기 (타임아웃)", removed);
                }
            }
        });

        let channel = Self {
            link,
            config,
            keypair,
            peer_keys,
            reassembly,
            next_message_id: AtomicU16::new(rand::random()),
            running,
        };

        (channel, message_rx)
    }

    /// 메시지 전송, 사용한 message_id 반환
    ///
    /// 목적지 공개키를 알면 암호화 (`PublicKey` 메시지와 브로드캐스트 제외).
    pub async fn send(
        &self,
        destination: MacAddr,
        message_type: MessageType,
        payload: &[u8],
    ) -> Result<u16> {
        let sealed;
        let payload = match self.recipient_key(destination, message_type) {
            Some(key) => {
                sealed = crypto::encrypt(payload, &key)?;
                &sealed[..]
            }
            None => payload,
        };

        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let fragments =
            fragment_payload(message_type, message_id, payload, self.config.max_payload_size)?;

        // 전부 인코딩한 뒤 전송 (중간에 실패하면 아무것도 보내지 않음)
        let local = self.link.local_mac();
        let frames = fragments
            .iter()
            .map(|(header, data)| {
                Frame::encode(destination, local, ETH_P_LINKCHAT, &header.to_bytes(), data)
            })
            .collect::<Result<Vec<_>>>()?;

        let interval = self.config.fragment_interval();
        for (i, frame) in frames.iter().enumerate() {
            if i > 0 && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            self.link.send(frame).await?;
        }

        debug!(
            "메시지 전송: {} → {} ({} bytes, {} fragments, id={})",
            local,
            destination,
            payload.len(),
            frames.len(),
            message_id
        );

        Ok(message_id)
    }

    /// 텍스트 전송 (MAC 문자열 목적지)
    pub async fn send_text(&self, mac: &str, text: &str) -> Result<u16> {
        let destination: MacAddr = mac.parse()?;
        self.send(destination, MessageType::Text, text.as_bytes()).await
    }

    /// 로컬 공개키 PEM 배포
    pub async fn announce_key(&self, destination: MacAddr) -> Result<u16> {
        let pem = self.keypair.public_key_pem()?;
        self.send(destination, MessageType::PublicKey, pem.as_bytes())
            .await
    }

    fn recipient_key(
        &self,
        destination: MacAddr,
        message_type: MessageType,
    ) -> Option<rsa::RsaPublicKey> {
        if !self.config.encryption_enabled
            || message_type == MessageType::PublicKey
            || destination.is_broadcast()
        {
            return None;
        }
        self.peer_keys.get(&destination)
    }

    /// 재조립 중인 메시지 수
    pub fn pending_messages(&self) -> usize {
        self.reassembly.lock().len()
    }

    pub fn local_mac(&self) -> MacAddr {
        self.link.local_mac()
    }

    /// 정지 (태스크는 다음 poll 주기에 종료)
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("message channel stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// 수신 태스크 상태
struct ChatReceiver {
    link: Arc<dyn Link>,
    keypair: Arc<KeyPair>,
    peer_keys: Arc<PeerKeyTable>,
    reassembly: Arc<Mutex<ReassemblyBuffer>>,
    message_tx: mpsc::Sender<ChatMessage>,
}

impl ChatReceiver {
    /// 프레임 하나 처리. 큐가 닫히면 false.
    async fn handle_frame(&self, bytes: &[u8]) -> bool {
        let local = self.link.local_mac();

        let frame = match Frame::decode(bytes, ETH_P_LINKCHAT) {
            Ok(frame) => frame,
            Err(e) => {
                trace!("프레임 무시: {}", e);
                return true;
            }
        };
        if !frame.is_for(local) || frame.src == local {
            return true;
        }
        // 같은 EtherType의 파일 프레임은 파일 채널 몫
        if frame.body.first() != Some(&(FrameKind::Fragment as u8)) {
            return true;
        }

        let (header, data) = match FragmentHeader::parse(&frame.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(source = %frame.src, "프래그먼트 무시: {}", e);
                return true;
            }
        };

        let complete = self.reassembly.lock().on_fragment(frame.src, &header, &data);
        match complete {
            Some(message) => self.deliver(message).await,
            None => true,
        }
    }

    async fn deliver(&self, message: CompleteMessage) -> bool {
        if message.message_type == MessageType::PublicKey {
            self.register_key(&message);
            return true;
        }

        let payload = crypto::open_or_plain(&message.payload, &self.keypair);
        debug!(
            "메시지 수신: {} ({} bytes, id={})",
            message.source,
            payload.len(),
            message.message_id
        );

        let chat = ChatMessage {
            source: message.source,
            message_type: message.message_type,
            payload: Bytes::from(payload),
        };
        self.message_tx.send(chat).await.is_ok()
    }

    fn register_key(&self, message: &CompleteMessage) {
        let parsed = std::str::from_utf8(&message.payload)
            .map_err(|_| crypto::CryptoError::Pem("UTF-8이 아님".into()))
            .and_then(crypto::public_key_from_pem);

        match parsed {
            Ok(key) => {
                self.peer_keys.insert(message.source, key);
                info!("공개키 등록: {}", message.source);
            }
            Err(e) => warn!("잘못된 공개키 ({}): {}", message.source, e),
        }
    }
}
