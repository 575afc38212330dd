//! 링크 계층 송수신
//!
//! - [`RawLink`]: 인터페이스 하나, EtherType 하나에 바인드된 `AF_PACKET` raw 소켓 (Linux)
//! - [`MemoryHub`]: 프로세스 내 가상 브로드캐스트 도메인 (테스트, 데모용)
//!
//! 둘 다 [`Link`] 트레이트로 사용. 프레임은 Ethernet 헤더 포함 전체 바이트.

use std::ffi::CString;
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{info, trace};

use crate::mac::MacAddr;
use crate::{Error, Result, ETH_HEADER_SIZE};

/// 프레임 송수신 인터페이스
#[async_trait]
pub trait Link: Send + Sync {
    /// 로컬 MAC 주소
    fn local_mac(&self) -> MacAddr;

    /// 바인드된 프로토콜 ID
    fn protocol_id(&self) -> u16;

    /// 프레임 하나 전송
    async fn send(&self, frame: &[u8]) -> io::Result<()>;

    /// 프레임 하나 수신, 길이 반환
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;
}

/// `AF_PACKET` raw 소켓 링크
pub struct RawLink {
    socket: AsyncFd<Socket>,
    interface: String,
    mac: MacAddr,
    protocol_id: u16,
}

impl RawLink {
    /// 인터페이스에 바인드된 raw 소켓 열기
    ///
    /// 권한(CAP_NET_RAW)이 없거나 인터페이스가 없으면 `SocketUnavailable`.
    pub fn open(interface: &str, protocol_id: u16) -> Result<Self> {
        let unavailable = |source: io::Error| Error::SocketUnavailable {
            interface: interface.to_string(),
            source,
        };

        let mac = MacAddr::from_interface(interface).map_err(|e| match e {
            Error::Io(source) => unavailable(source),
            other => other,
        })?;
        let index = interface_index(interface).map_err(unavailable)?;

        let protocol = Protocol::from(i32::from(protocol_id.to_be()));
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(protocol)).map_err(unavailable)?;
        socket.set_nonblocking(true).map_err(unavailable)?;
        bind_packet(&socket, index, protocol_id).map_err(unavailable)?;

        let socket = AsyncFd::new(socket).map_err(unavailable)?;

        info!(
            "raw link opened: {} ({}), protocol 0x{:04X}",
            interface, mac, protocol_id
        );

        Ok(Self {
            socket,
            interface: interface.to_string(),
            mac,
            protocol_id,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }
}

#[async_trait]
impl Link for RawLink {
    fn local_mac(&self) -> MacAddr {
        self.mac
    }

    fn protocol_id(&self) -> u16 {
        self.protocol_id
    }

    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        loop {
            let mut guard = self.socket.writable().await?;
            match guard.try_io(|inner| inner.get_ref().send(frame)) {
                Ok(Ok(n)) if n == frame.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        format!("short send: {} of {} bytes", n, frame.len()),
                    ))
                }
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.socket.readable().await?;
            match guard.try_io(|inner| {
                let mut socket: &Socket = inner.get_ref();
                socket.read(buf)
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

/// 인터페이스 이름 → 인덱스
fn interface_index(interface: &str) -> io::Result<u32> {
    let name = CString::new(interface)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "interface name contains NUL"))?;
    // SAFETY: name은 NUL로 끝나는 유효한 C 문자열
    let index = unsafe { libc::if_nametoindex(name.as_ptr()) };
    if index == 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(index)
}

/// `sockaddr_ll`로 소켓을 인터페이스 + 프로토콜에 바인드
fn bind_packet(socket: &Socket, index: u32, protocol_id: u16) -> io::Result<()> {
    // SAFETY: sockaddr_ll은 0으로 초기화해도 유효한 POD
    let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
    addr.sll_family = libc::AF_PACKET as libc::c_ushort;
    addr.sll_protocol = protocol_id.to_be();
    addr.sll_ifindex = index as libc::c_int;

    // SAFETY: addr은 스택에 있는 유효한 sockaddr_ll, 길이 일치
    let rc = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

struct Endpoint {
    mac: MacAddr,
    protocol_id: u16,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// 프로세스 내 가상 브로드캐스트 도메인
///
/// 실제 NIC처럼 목적지가 자신이거나 브로드캐스트인 프레임만 전달하고,
/// 자신이 보낸 브로드캐스트도 되돌려 받음 (AF_PACKET 루프백과 동일).
#[derive(Clone, Default)]
pub struct MemoryHub {
    endpoints: Arc<Mutex<Vec<Endpoint>>>,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// 새 엔드포인트 연결
    pub fn connect(&self, mac: MacAddr, protocol_id: u16) -> MemoryLink {
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.lock().push(Endpoint {
            mac,
            protocol_id,
            tx,
        });

        MemoryLink {
            hub: self.clone(),
            mac,
            protocol_id,
            rx: AsyncMutex::new(rx),
        }
    }

    fn deliver(&self, frame: &[u8]) {
        if frame.len() < ETH_HEADER_SIZE {
            return;
        }
        let Some(dst) = MacAddr::from_slice(&frame[0..6]) else {
            return;
        };
        let protocol_id = u16::from_be_bytes([frame[12], frame[13]]);

        let mut endpoints = self.endpoints.lock();
        // 닫힌 링크 정리
        endpoints.retain(|e| !e.tx.is_closed());

        for endpoint in endpoints.iter() {
            if endpoint.protocol_id != protocol_id {
                continue;
            }
            if dst.is_broadcast() || dst == endpoint.mac {
                let _ = endpoint.tx.send(frame.to_vec());
            }
        }
    }
}

/// [`MemoryHub`]에 연결된 링크
pub struct MemoryLink {
    hub: MemoryHub,
    mac: MacAddr,
    protocol_id: u16,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Vec<u8>>>,
}

#[async_trait]
impl Link for MemoryLink {
    fn local_mac(&self) -> MacAddr {
        self.mac
    }

    fn protocol_id(&self) -> u16 {
        self.protocol_id
    }

    async fn send(&self, frame: &[u8]) -> io::Result<()> {
        trace!("hub send: {} bytes from {}", frame.len(), self.mac);
        self.hub.deliver(frame);
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let frame = self
            .rx
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "hub closed"))?;

        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }
}
