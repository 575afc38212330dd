//! 이웃 탐색 (EtherType 0x88B6)
//!
//! - announce: `discovery_interval`마다 마커를 브로드캐스트
//! - listen: 마커가 포함된 프레임의 송신 MAC을 last_contact로 기록 (자기 자신 제외)
//! - sweep: `device_timeout` 동안 소식 없는 peer 제거

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::frame::Frame;
use crate::link::Link;
use crate::mac::MacAddr;
use crate::{Config, Result, DISCOVERY_MARKER, ETH_P_DISCOVERY, MAX_FRAME_SIZE};

/// peer 변화 이벤트
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// 새 peer 발견
    Joined(MacAddr),

    /// 타임아웃으로 제거
    Left(MacAddr),
}

/// MAC → 마지막 연락 시간
#[derive(Debug, Clone)]
pub struct PeerTable {
    peers: Arc<DashMap<MacAddr, Instant>>,
    timeout: Duration,
}

impl PeerTable {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: Arc::new(DashMap::new()),
            timeout,
        }
    }

    /// 연락 기록, 새 peer면 true
    pub fn observe(&self, mac: MacAddr, now: Instant) -> bool {
        self.peers.insert(mac, now).is_none()
    }

    /// `now - last_contact > timeout`인 peer 제거, 제거된 MAC 반환
    pub fn evict_stale(&self, now: Instant) -> Vec<MacAddr> {
        let mut evicted = Vec::new();
        self.peers.retain(|mac, last_contact| {
            let alive = now.saturating_duration_since(*last_contact) <= self.timeout;
            if !alive {
                evicted.push(*mac);
            }
            alive
        });
        evicted
    }

    /// 현재 peer 스냅샷 (정렬됨)
    pub fn snapshot(&self) -> Vec<MacAddr> {
        let mut peers: Vec<MacAddr> = self.peers.iter().map(|e| *e.key()).collect();
        peers.sort();
        peers
    }

    pub fn last_contact(&self, mac: &MacAddr) -> Option<Instant> {
        self.peers.get(mac).map(|e| *e.value())
    }

    pub fn contains(&self, mac: &MacAddr) -> bool {
        self.peers.contains_key(mac)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// 마커 포함 여부
pub fn is_announcement(body: &[u8]) -> bool {
    body.windows(DISCOVERY_MARKER.len())
        .any(|window| window == DISCOVERY_MARKER)
}

/// 탐색 서비스 핸들
pub struct DiscoveryService {
    link: Arc<dyn Link>,
    table: PeerTable,
    running: Arc<AtomicBool>,
}

impl DiscoveryService {
    /// announce / listen / sweep 태스크 시작
    pub fn start(link: Arc<dyn Link>, config: &Config) -> (Self, mpsc::Receiver<PeerEvent>) {
        let table = PeerTable::new(config.device_timeout());
        let running = Arc::new(AtomicBool::new(true));
        let (event_tx, event_rx) = mpsc::channel(config.queue_capacity.max(1));

        info!(
            "discovery started on {} (interval {:?}, timeout {:?})",
            link.local_mac(),
            config.discovery_interval(),
            config.device_timeout()
        );

        // announce 태스크
        let link_announce = link.clone();
        let running_announce = running.clone();
        let discovery_interval = config.discovery_interval();

        tokio::spawn(async move {
            while running_announce.load(Ordering::SeqCst) {
                if let Err(e) = announce(link_announce.as_ref()).await {
                    warn!("announce 실패: {}", e);
                }
                tokio::time::sleep(discovery_interval).await;
            }
        });

        // listen 태스크
        let link_listen = link.clone();
        let running_listen = running.clone();
        let table_listen = table.clone();
        let events_listen = event_tx.clone();
        let poll_interval = config.poll_interval();

        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_FRAME_SIZE + 64];
            let local = link_listen.local_mac();

            while running_listen.load(Ordering::SeqCst) {
                match tokio::time::timeout(poll_interval, link_listen.recv(&mut buf)).await {
                    Ok(Ok(len)) => {
                        let frame = match Frame::decode(&buf[..len], ETH_P_DISCOVERY) {
                            Ok(frame) => frame,
                            Err(e) => {
                                trace!("discovery 프레임 무시: {}", e);
                                continue;
                            }
                        };
                        if frame.src == local || !is_announcement(&frame.body) {
                            continue;
                        }
                        if table_listen.observe(frame.src, Instant::now()) {
                            info!("peer 발견: {}", frame.src);
                            emit(&events_listen, PeerEvent::Joined(frame.src));
                        }
                    }
                    Ok(Err(e)) => {
                        warn!("수신 에러: {}", e);
                        tokio::time::sleep(poll_interval).await;
                    }
                    Err(_) => {}
                }
            }
            debug!("discovery listen task stopped");
        });

        // sweep 태스크
        let running_sweep = running.clone();
        let table_sweep = table.clone();
        let sweep_interval = config.sweep_interval();

        tokio::spawn(async move {
            while running_sweep.load(Ordering::SeqCst) {
                tokio::time::sleep(sweep_interval).await;
                for mac in table_sweep.evict_stale(Instant::now()) {
                    info!("비활성 peer 제거: {}", mac);
                    emit(&event_tx, PeerEvent::Left(mac));
                }
            }
        });

        let service = Self {
            link,
            table,
            running,
        };
        (service, event_rx)
    }

    /// 연락 기록 (listen 태스크와 같은 경로)
    pub fn observe(&self, mac: MacAddr, now: Instant) -> bool {
        self.table.observe(mac, now)
    }

    /// 오래된 peer 제거
    pub fn evict_stale(&self, now: Instant) -> Vec<MacAddr> {
        self.table.evict_stale(now)
    }

    /// 현재 peer 목록
    pub fn peers(&self) -> Vec<MacAddr> {
        self.table.snapshot()
    }

    pub fn table(&self) -> &PeerTable {
        &self.table
    }

    pub fn local_mac(&self) -> MacAddr {
        self.link.local_mac()
    }

    /// 정지 (태스크는 다음 반복에서 종료)
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("discovery stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn announce(link: &dyn Link) -> Result<()> {
    let frame = Frame::encode(
        MacAddr::BROADCAST,
        link.local_mac(),
        ETH_P_DISCOVERY,
        &[],
        DISCOVERY_MARKER,
    )?;
    link.send(&frame).await?;
    trace!("announce 전송: {}", link.local_mac());
    Ok(())
}

/// 이벤트 큐에 넣기. 가득 차거나 닫혀서 버렸으면 false.
fn emit(events: &mpsc::Sender<PeerEvent>, event: PeerEvent) -> bool {
    match events.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(event)) => {
            warn!("peer 이벤트 큐 가득 참, 버림: {:?}", event);
            false
        }
        Err(mpsc::error::TrySendError::Closed(event)) => {
            debug!("peer 이벤트 큐 닫힘: {:?}", event);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::MemoryHub;

    const A: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0a]);
    const B: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x0b]);

    fn test_config() -> Config {
        Config {
            discovery_interval_ms: 20,
            device_timeout_ms: 200,
            sweep_interval_ms: 20,
            poll_interval_ms: 10,
            ..Config::default()
        }
    }

    #[test]
    fn test_marker_match() {
        assert!(is_announcement(b"LINKDISCOVERY:HELLO"));
        assert!(is_announcement(b"xxLINKDISCOVERY:HELLO\0\0\0"));
        assert!(!is_announcement(b"LINKDISCOVERY:HELL"));
        assert!(!is_announcement(b""));
    }

    #[test]
    fn test_emit_reports_dropped_event() {
        let (tx, mut rx) = mpsc::channel(1);
        assert!(emit(&tx, PeerEvent::Joined(A)));
        assert!(!emit(&tx, PeerEvent::Joined(B)));
        assert_eq!(rx.try_recv().unwrap(), PeerEvent::Joined(A));

        drop(rx);
        assert!(!emit(&tx, PeerEvent::Left(A)));
    }

    #[test]
    fn test_eviction_after_timeout() {
        let table = PeerTable::new(Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(table.observe(A, t0));
        assert!(!table.observe(A, t0));

        assert!(table.evict_stale(t0 + Duration::from_secs(10)).is_empty());
        assert_eq!(table.evict_stale(t0 + Duration::from_secs(11)), vec![A]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_retained_while_announcing() {
        let table = PeerTable::new(Duration::from_secs(10));
        let t0 = Instant::now();

        table.observe(A, t0);
        table.observe(B, t0);
        for step in 1..=5u64 {
            let now = t0 + Duration::from_secs(step * 3);
            table.observe(A, now);
            table.evict_stale(now);
        }

        // A는 3초마다 갱신, B는 15초 동안 조용함
        assert_eq!(table.snapshot(), vec![A]);
        assert_eq!(table.last_contact(&A), Some(t0 + Duration::from_secs(15)));
    }

    #[tokio::test]
    async fn test_peers_discover_each_other() {
        let hub = MemoryHub::new();
        let config = test_config();
        let (a, mut a_events) =
            DiscoveryService::start(Arc::new(hub.connect(A, ETH_P_DISCOVERY)), &config);
        let (b, _b_events) =
            DiscoveryService::start(Arc::new(hub.connect(B, ETH_P_DISCOVERY)), &config);

        let event = tokio::time::timeout(Duration::from_secs(2), a_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, PeerEvent::Joined(B));

        tokio::time::sleep(Duration::from_millis(100)).await;
        // 자기 자신은 목록에 없음
        assert_eq!(a.peers(), vec![B]);
        assert_eq!(b.peers(), vec![A]);

        // B가 멈추면 타임아웃 후 제거
        b.stop();
        let event = tokio::time::timeout(Duration::from_secs(2), a_events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, PeerEvent::Left(B));
        assert!(a.peers().is_empty());
        a.stop();
    }
}
