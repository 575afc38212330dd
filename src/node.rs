//! 노드 - 설정, 링크, 키, 서비스를 하나로 묶은 핸들
//!
//! 외부(GUI 등)에서 사용하는 인터페이스:
//! - [`Node::send_message`], [`Node::send_folder`], [`Node::peers`]
//! - [`NodeEvents`]의 채팅 메시지 큐와 수신 파일 큐
//!
//! 소켓을 열 수 없는 기능은 경고 후 비활성화, 나머지는 계속 동작.

use std::io;
use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::chat::{ChatMessage, MessageChannel};
use crate::crypto::{KeyPair, PeerKeyTable};
use crate::discovery::{DiscoveryService, PeerEvent};
use crate::link::{Link, MemoryHub, RawLink};
use crate::mac::MacAddr;
use crate::message::TransferMetadata;
use crate::names::PeerNames;
use crate::transfer::{FileChannel, ReceivedFile};
use crate::{Config, Error, Result, ETH_P_DISCOVERY, ETH_P_LINKCHAT};

/// 서비스별 링크
pub struct NodeLinks {
    pub local_mac: MacAddr,
    pub chat: Option<Arc<dyn Link>>,
    pub files: Option<Arc<dyn Link>>,
    pub discovery: Option<Arc<dyn Link>>,
}

impl NodeLinks {
    /// 설정된 인터페이스에 raw 소켓 열기. 실패한 링크는 None.
    pub fn open(config: &Config) -> Self {
        let open = |protocol_id: u16, feature: &str| -> Option<Arc<dyn Link>> {
            match RawLink::open(&config.interface, protocol_id) {
                Ok(link) => Some(Arc::new(link)),
                Err(e) => {
                    warn!("{} 비활성화: {}", feature, e);
                    None
                }
            }
        };

        let local_mac = MacAddr::from_interface(&config.interface).unwrap_or_else(|e| {
            warn!("인터페이스 MAC 확인 실패 ({}): {}", config.interface, e);
            MacAddr::ZERO
        });

        Self {
            local_mac,
            chat: open(ETH_P_LINKCHAT, "메시지 채널"),
            files: open(ETH_P_LINKCHAT, "파일 채널"),
            discovery: open(ETH_P_DISCOVERY, "discovery"),
        }
    }

    /// 가상 허브에 연결된 링크 (테스트, 데모용)
    pub fn memory(hub: &MemoryHub, mac: MacAddr) -> Self {
        Self {
            local_mac: mac,
            chat: Some(Arc::new(hub.connect(mac, ETH_P_LINKCHAT))),
            files: Some(Arc::new(hub.connect(mac, ETH_P_LINKCHAT))),
            discovery: Some(Arc::new(hub.connect(mac, ETH_P_DISCOVERY))),
        }
    }
}

/// 노드 이벤트 큐 (비활성화된 기능은 None)
pub struct NodeEvents {
    pub messages: Option<mpsc::Receiver<ChatMessage>>,
    pub files: Option<mpsc::Receiver<ReceivedFile>>,
}

/// Link-Chat 노드
pub struct Node {
    config: Config,
    local_mac: MacAddr,
    keypair: Arc<KeyPair>,
    peer_keys: Arc<PeerKeyTable>,
    chat: Option<Arc<MessageChannel>>,
    files: Option<FileChannel>,
    discovery: Option<DiscoveryService>,
}

impl Node {
    /// 설정된 인터페이스로 시작
    pub async fn start(config: Config) -> Result<(Self, NodeEvents)> {
        let links = NodeLinks::open(&config);
        Self::with_links(config, links).await
    }

    /// 주어진 링크로 시작
    pub async fn with_links(config: Config, links: NodeLinks) -> Result<(Self, NodeEvents)> {
        let key_config = config.clone();
        let keypair = tokio::task::spawn_blocking(move || {
            KeyPair::load_or_generate(
                &key_config.private_key_path,
                &key_config.public_key_path,
                key_config.key_bits,
            )
        })
        .await
        .map_err(|e| Error::Io(io::Error::other(e)))??;
        let keypair = Arc::new(keypair);
        let peer_keys = Arc::new(PeerKeyTable::new());

        let mut events = NodeEvents {
            messages: None,
            files: None,
        };

        let chat = links.chat.map(|link| {
            let (channel, rx) =
                MessageChannel::start(link, config.clone(), keypair.clone(), peer_keys.clone());
            events.messages = Some(rx);
            Arc::new(channel)
        });

        let files = match links.files {
            Some(link) => match FileChannel::start(link, config.clone()) {
                Ok((channel, rx)) => {
                    events.files = Some(rx);
                    Some(channel)
                }
                Err(e) => {
                    warn!("파일 채널 비활성화: {}", e);
                    None
                }
            },
            None => None,
        };

        let discovery = links.discovery.map(|link| {
            let (service, peer_events) = DiscoveryService::start(link, &config);
            spawn_key_announcer(peer_events, chat.clone());
            service
        });

        info!(
            "node started: {} (chat={}, files={}, discovery={})",
            links.local_mac,
            chat.is_some(),
            files.is_some(),
            discovery.is_some()
        );

        let node = Self {
            config,
            local_mac: links.local_mac,
            keypair,
            peer_keys,
            chat,
            files,
            discovery,
        };
        Ok((node, events))
    }

    /// 텍스트 메시지 전송
    pub async fn send_message(&self, mac: &str, text: &str) -> Result<u16> {
        let chat = self.chat.as_ref().ok_or_else(|| self.disabled("메시지 채널"))?;
        chat.send_text(mac, text).await
    }

    /// 파일 또는 폴더 전송
    pub async fn send_folder(&self, mac: &str, path: impl AsRef<Path>) -> Result<TransferMetadata> {
        let destination: MacAddr = mac.parse()?;
        let files = self.files.as_ref().ok_or_else(|| self.disabled("파일 채널"))?;
        files.send_folder(destination, path.as_ref()).await
    }

    /// 공개키 직접 배포
    pub async fn announce_key(&self, destination: MacAddr) -> Result<u16> {
        let chat = self.chat.as_ref().ok_or_else(|| self.disabled("메시지 채널"))?;
        chat.announce_key(destination).await
    }

    /// 현재 peer 목록
    pub fn peers(&self) -> Vec<MacAddr> {
        self.discovery
            .as_ref()
            .map(|d| d.peers())
            .unwrap_or_default()
    }

    /// 이름 저장소 열기 (`mac_names.json`)
    pub fn names(&self) -> Result<PeerNames> {
        PeerNames::load(&self.config.names_path)
    }

    pub fn local_mac(&self) -> MacAddr {
        self.local_mac
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn peer_keys(&self) -> &PeerKeyTable {
        &self.peer_keys
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 모든 서비스 정지
    pub fn stop(&self) {
        if let Some(chat) = &self.chat {
            chat.stop();
        }
        if let Some(files) = &self.files {
            files.stop();
        }
        if let Some(discovery) = &self.discovery {
            discovery.stop();
        }
        info!("node stopped: {}", self.local_mac);
    }

    fn disabled(&self, feature: &str) -> Error {
        Error::SocketUnavailable {
            interface: self.config.interface.clone(),
            source: io::Error::new(io::ErrorKind::NotConnected, format!("{} 비활성화", feature)),
        }
    }
}

/// 새 peer가 보이면 공개키 배포
fn spawn_key_announcer(mut events: mpsc::Receiver<PeerEvent>, chat: Option<Arc<MessageChannel>>) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PeerEvent::Joined(mac) => {
                    let Some(chat) = chat.as_ref().filter(|c| c.is_running()) else {
                        continue;
                    };
                    if let Err(e) = chat.announce_key(mac).await {
                        warn!("공개키 배포 실패 ({}): {}", mac, e);
                    }
                }
                PeerEvent::Left(mac) => debug!("peer left: {}", mac),
            }
        }
    });
}
