//! 프로토콜 설정

use std::path::PathBuf;
use std::time::Duration;

use crate::{CHUNK_SIZE, MAX_PAYLOAD_SIZE};

/// 기본 인터페이스 이름
pub const DEFAULT_INTERFACE: &str = "wlp0s20f3";

/// 인터페이스 이름을 덮어쓰는 환경 변수
pub const INTERFACE_ENV: &str = "LINKCHAT_IFACE";

/// Link-Chat 설정
#[derive(Debug, Clone)]
pub struct Config {
    /// 바인드할 네트워크 인터페이스
    pub interface: String,

    /// 파일 청크 크기 (바이트)
    pub chunk_size: usize,

    /// 메시지 프래그먼트당 최대 페이로드 (바이트)
    pub max_payload_size: usize,

    /// 프래그먼트 전송 간격 (밀리초)
    /// 수신 버퍼 넘침 방지용, 0이면 간격 없음
    pub fragment_interval_ms: u64,

    /// 청크 전송 간격 (마이크로초)
    pub chunk_interval_us: u64,

    /// discovery announce 주기 (밀리초)
    pub discovery_interval_ms: u64,

    /// 이 시간 동안 announce가 없으면 peer 제거 (밀리초)
    pub device_timeout_ms: u64,

    /// peer 정리 주기 (밀리초)
    pub sweep_interval_ms: u64,

    /// 미완성 메시지 보관 시간 (밀리초)
    pub reassembly_timeout_ms: u64,

    /// 미완성 파일 전송 보관 시간 (밀리초)
    pub transfer_timeout_ms: u64,

    /// 수신 루프가 running 플래그를 확인하는 주기 (밀리초)
    pub poll_interval_ms: u64,

    /// 완료 메시지/파일 큐 크기
    pub queue_capacity: usize,

    /// 수신 파일 저장 디렉터리 (`tmp/`에 .part 파일)
    pub download_dir: PathBuf,

    /// 개인키 경로 (PKCS#8 PEM)
    pub private_key_path: PathBuf,

    /// 공개키 경로 (SPKI PEM)
    pub public_key_path: PathBuf,

    /// peer 이름 저장 파일 (JSON)
    pub names_path: PathBuf,

    /// RSA 키 크기 (비트)
    pub key_bits: usize,

    /// 암호화 활성화
    /// 활성화되어도 상대 공개키를 모르면 평문 전송
    pub encryption_enabled: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: std::env::var(INTERFACE_ENV)
                .unwrap_or_else(|_| DEFAULT_INTERFACE.to_string()),
            chunk_size: CHUNK_SIZE,
            max_payload_size: MAX_PAYLOAD_SIZE,
            fragment_interval_ms: 100,        // 100ms
            chunk_interval_us: 10_000,        // 10ms
            discovery_interval_ms: 3_000,     // 3초
            device_timeout_ms: 10_000,        // 10초
            sweep_interval_ms: 2_000,         // 2초
            reassembly_timeout_ms: 30_000,    // 30초
            transfer_timeout_ms: 600_000,     // 10분
            poll_interval_ms: 50,
            queue_capacity: 256,
            download_dir: PathBuf::from("downloads"),
            private_key_path: PathBuf::from("private_key.pem"),
            public_key_path: PathBuf::from("public_key.pem"),
            names_path: PathBuf::from("mac_names.json"),
            key_bits: 2048,
            encryption_enabled: true,
        }
    }
}

impl Config {
    /// 새 설정 생성
    pub fn new() -> Self {
        Self::default()
    }

    /// 인터페이스 지정
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = interface.into();
        self
    }

    /// 다운로드 디렉터리 지정
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    /// 크기에 필요한 청크 수 계산
    pub fn chunks_for(&self, size: u64) -> u64 {
        size.div_ceil(self.chunk_size as u64)
    }

    /// `.part` 파일 디렉터리
    pub fn tmp_dir(&self) -> PathBuf {
        self.download_dir.join("tmp")
    }

    pub fn fragment_interval(&self) -> Duration {
        Duration::from_millis(self.fragment_interval_ms)
    }

    pub fn chunk_interval(&self) -> Duration {
        Duration::from_micros(self.chunk_interval_us)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn device_timeout(&self) -> Duration {
        Duration::from_millis(self.device_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn reassembly_timeout(&self) -> Duration {
        Duration::from_millis(self.reassembly_timeout_ms)
    }

    pub fn transfer_timeout(&self) -> Duration {
        Duration::from_millis(self.transfer_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// 유선 LAN 등 안정적인 링크용 설정
    pub fn fast_lan() -> Self {
        Self {
            fragment_interval_ms: 1,
            chunk_interval_us: 200,
            poll_interval_ms: 20,
            queue_capacity: 1024,
            ..Self::default()
        }
    }

    /// 혼잡한 무선 링크용 설정
    pub fn congested() -> Self {
        Self {
            fragment_interval_ms: 200,
            chunk_interval_us: 25_000,        // 25ms
            discovery_interval_ms: 5_000,
            device_timeout_ms: 20_000,
            reassembly_timeout_ms: 60_000,
            transfer_timeout_ms: 1_800_000,   // 30분
            ..Self::default()
        }
    }
}
