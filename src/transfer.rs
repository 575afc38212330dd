//! 파일 채널 (EtherType 0x88B5, 파일 프레임)
//!
//! 송신:
//! - 작은 파일: 메타데이터 + 내용을 프레임 하나로
//! - 큰 파일: 메타데이터 프레임 → 청크 프레임들 (`chunk_interval` 간격)
//! - 디렉터리: `.lca` 아카이브로 묶어 `ArchiveMeta` 태그로 전송
//!
//! 수신: 프레임 종류 태그로 분기 → [`ChunkStore`] → 완료 파일 큐

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::archive::{self, ARCHIVE_EXTENSION};
use crate::chunk::{hash_file, ChunkStore, FileChunker, FinalizedFile, PendingTransfer};
use crate::frame::Frame;
use crate::link::Link;
use crate::mac::MacAddr;
use crate::message::{FileFrame, FrameKind, TransferMetadata, MAX_FILE_BODY};
use crate::{Config, Error, Result, ETH_P_LINKCHAT, MAX_FRAME_SIZE};

/// 수신 완료된 파일 (아카이브는 해제된 디렉터리)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub source: MacAddr,
    pub archive: bool,
}

/// 파일 채널 핸들
pub struct FileChannel {
    link: Arc<dyn Link>,
    config: Config,
    store: Arc<ChunkStore>,
    running: Arc<AtomicBool>,
}

impl FileChannel {
    /// 채널 생성 및 수신/정리 태스크 시작
    pub fn start(
        link: Arc<dyn Link>,
        config: Config,
    ) -> Result<(Self, mpsc::Receiver<ReceivedFile>)> {
        let store = Arc::new(ChunkStore::new(&config.download_dir, config.chunk_size)?);
        let (file_tx, file_rx) = mpsc::channel(config.queue_capacity.max(1));
        let running = Arc::new(AtomicBool::new(true));

        info!(
            "file channel started on {}, download dir: {}",
            link.local_mac(),
            config.download_dir.display()
        );

        let receiver = FileReceiver {
            link: link.clone(),
            store: store.clone(),
            download_dir: config.download_dir.clone(),
            file_tx,
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
                    Err(_) => {}
                }
            }

            debug!("file receive task stopped");
        });

        // 오래된 전송 정리 태스크
        let running_sweep = running.clone();
        let store_sweep = store.clone();
        let sweep_interval = config.sweep_interval();
        let max_age = config.transfer_timeout();

        tokio::spawn(async move {
            while running_sweep.load(Ordering::SeqCst) {
                tokio::time::sleep(sweep_interval).await;
                let store = store_sweep.clone();
                let swept =
                    tokio::task::spawn_blocking(move || store.sweep(Instant::now(), max_age));
                match swept.await {
                    Ok(0) => {}
                    Ok(removed) => warn!("미완성 전송 {}개 폐기 (타임아웃)", removed),
                    Err(e) => warn!("전송 정리 태스크 실패: {}", e),
                }
            }
        });

        let channel = Self {
            link,
            config,
            store,
            running,
        };
        Ok((channel, file_rx))
    }

    /// 일반 파일 전송
    pub async fn send_file(&self, destination: MacAddr, path: &Path) -> Result<TransferMetadata> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidName(path.display().to_string()))?;
        self.send_path(destination, path, name, false).await
    }

    /// 파일 또는 디렉터리 전송
    ///
    /// 디렉터리는 `download_dir/tmp/<name>.lca`로 묶어 보낸 뒤, 성공 여부와 관계없이 삭제.
    pub async fn send_folder(&self, destination: MacAddr, path: &Path) -> Result<TransferMetadata> {
        if !path.is_dir() {
            return self.send_file(destination, path).await;
        }

        let dir_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::InvalidName(path.display().to_string()))?;
        let archive_name = format!("{}.{}", dir_name, ARCHIVE_EXTENSION);
        let archive_path = self.config.tmp_dir().join(&archive_name);

        let result = match archive::pack_dir(path, &archive_path) {
            Ok(_) => {
                self.send_path(destination, &archive_path, &archive_name, true)
                    .await
            }
            Err(e) => Err(e),
        };

        if archive_path.exists() {
            if let Err(e) = fs::remove_file(&archive_path) {
                warn!("임시 아카이브 삭제 실패 ({}): {}", archive_path.display(), e);
            }
        }
        result
    }

    async fn send_path(
        &self,
        destination: MacAddr,
        path: &Path,
        name: &str,
        archive: bool,
    ) -> Result<TransferMetadata> {
        let (content_hash, size) = hash_file(path)?;
        let metadata = TransferMetadata::new(name, size, content_hash)?;

        // 한 프레임에 들어가면 내용까지 같이
        if metadata.encoded_len() as u64 + size <= MAX_FILE_BODY as u64 {
            let frame = FileFrame::Meta {
                metadata: metadata.clone(),
                archive,
                inline: Some(Bytes::from(fs::read(path)?)),
            };
            self.send_frame(destination, &frame).await?;
            debug!("파일 전송 (단일 프레임): {} ({} bytes)", name, size);
            return Ok(metadata);
        }

        let meta_frame = FileFrame::Meta {
            metadata: metadata.clone(),
            archive,
            inline: None,
        };
        self.send_frame(destination, &meta_frame).await?;

        let interval = self.config.chunk_interval();
        let mut count = 0u64;
        for chunk in FileChunker::open(path, content_hash, self.config.chunk_size)? {
            if count > 0 && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
            self.send_frame(destination, &FileFrame::Chunk(chunk?)).await?;
            count += 1;
        }

        info!(
            "파일 전송 완료: {} → {} ({} bytes, {} chunks)",
            name, destination, size, count
        );
        Ok(metadata)
    }

    async fn send_frame(&self, destination: MacAddr, frame: &FileFrame) -> Result<()> {
        let body = frame.to_bytes()?;
        let bytes = Frame::encode(destination, self.link.local_mac(), ETH_P_LINKCHAT, &[], &body)?;
        self.link.send(&bytes).await?;
        Ok(())
    }

    /// 수신 대기 중인 전송 스냅샷
    pub fn pending_transfers(&self) -> Vec<PendingTransfer> {
        self.store.pending()
    }

    pub fn download_dir(&self) -> &Path {
        &self.config.download_dir
    }

    /// 정지 (태스크는 다음 poll 주기에 종료)
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
        info!("file channel stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

/// 수신 태스크 상태
struct FileReceiver {
    link: Arc<dyn Link>,
    store: Arc<ChunkStore>,
    download_dir: PathBuf,
    file_tx: mpsc::Sender<ReceivedFile>,
}

impl FileReceiver {
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
        // 메시지 프래그먼트는 메시지 채널 몫
        if frame.body.first() == Some(&(FrameKind::Fragment as u8)) {
            return true;
        }

        let file_frame = match FileFrame::parse(&frame.body) {
            Ok(parsed) => parsed,
            Err(e) => {
                trace!(source = %frame.src, "파일 프레임 무시: {}", e);
                return true;
            }
        };

        // 파일 쓰기와 해시 검증은 블로킹 스레드에서
        let store = self.store.clone();
        let result = tokio::task::spawn_blocking(move || match &file_frame {
            FileFrame::Meta {
                metadata,
                archive,
                inline: Some(data),
            } => store.store_inline(metadata, data, *archive).map(Some),
            FileFrame::Meta {
                metadata,
                archive,
                inline: None,
            } => store.begin(metadata, *archive),
            FileFrame::Chunk(chunk) => {
                store.write_chunk(&chunk.content_hash, chunk.index, &chunk.data)
            }
        })
        .await;

        let result = match result {
            Ok(result) => result,
            Err(e) => {
                warn!("파일 저장 태스크 실패: {}", e);
                return true;
            }
        };

        match result {
            Ok(Some(file)) => self.deliver(file, frame.src).await,
            Ok(None) => true,
            // ChunkStore에서 이미 warn 로그
            Err(Error::HashMismatch { .. }) => true,
            Err(e) => {
                warn!("파일 프레임 처리 실패 ({}): {}", frame.src, e);
                true
            }
        }
    }

    async fn deliver(&self, file: FinalizedFile, source: MacAddr) -> bool {
        let received = if file.archive {
            let archive_path = file.path.clone();
            let download_dir = self.download_dir.clone();
            match tokio::task::spawn_blocking(move || extract(&file, &download_dir, source)).await {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => {
                    warn!("아카이브 해제 실패 ({}): {}", archive_path.display(), e);
                    return true;
                }
                Err(e) => {
                    warn!("아카이브 해제 태스크 실패: {}", e);
                    return true;
                }
            }
        } else {
            ReceivedFile {
                name: file.name,
                path: file.path,
                size: file.size,
                source,
                archive: false,
            }
        };

        info!("파일 수신 완료: {} from {}", received.path.display(), source);
        self.file_tx.send(received).await.is_ok()
    }
}

/// 받은 아카이브를 풀고 삭제
fn extract(file: &FinalizedFile, download_dir: &Path, source: MacAddr) -> Result<ReceivedFile> {
    let unpacked = archive::unpack(&file.path, download_dir);
    // 성공, 실패 모두 아카이브 파일은 삭제
    if let Err(e) = fs::remove_file(&file.path) {
        debug!("아카이브 삭제 실패: {}", e);
    }
    let root = unpacked?;

    let name = root
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(file.name.as_str())
        .to_string();
    Ok(ReceivedFile {
        name,
        path: root,
        size: file.size,
        source,
        archive: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::content_hash;
    use crate::link::{MemoryHub, MemoryLink};
    use crate::message::ChunkBody;
    use crate::CHUNK_SIZE;
    use std::time::Duration;

    const ALICE: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xa1]);
    const BOB: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0xb0]);

    fn test_config(dir: &Path) -> Config {
        Config {
            chunk_interval_us: 0,
            poll_interval_ms: 10,
            ..Config::fast_lan().with_download_dir(dir)
        }
    }

    fn channel(
        hub: &MemoryHub,
        mac: MacAddr,
        dir: &Path,
    ) -> (FileChannel, mpsc::Receiver<ReceivedFile>) {
        let link: Arc<dyn Link> = Arc::new(hub.connect(mac, ETH_P_LINKCHAT));
        FileChannel::start(link, test_config(dir)).unwrap()
    }

    async fn next(inbox: &mut mpsc::Receiver<ReceivedFile>) -> ReceivedFile {
        tokio::time::timeout(Duration::from_secs(5), inbox.recv())
            .await
            .expect("파일 대기 타임아웃")
            .expect("채널 종료")
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 256) as u8).collect()
    }

    async fn send_raw(link: &MemoryLink, frame: FileFrame) {
        let body = frame.to_bytes().unwrap();
        let bytes = Frame::encode(BOB, ALICE, ETH_P_LINKCHAT, &[], &body).unwrap();
        link.send(&bytes).await.unwrap();
    }

    #[tokio::test]
    async fn test_small_file_single_frame() {
        let hub = MemoryHub::new();
        let (a_dir, b_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (alice, _) = channel(&hub, ALICE, a_dir.path());
        let (_bob, mut inbox) = channel(&hub, BOB, b_dir.path());

        let path = a_dir.path().join("nota.txt");
        fs::write(&path, b"hola desde alice").unwrap();
        alice.send_file(BOB, &path).await.unwrap();

        let file = next(&mut inbox).await;
        assert_eq!(file.name, "nota.txt");
        assert_eq!(file.source, ALICE);
        assert_eq!(file.path, b_dir.path().join("nota.txt"));
        assert_eq!(fs::read(&file.path).unwrap(), b"hola desde alice");
    }

    #[tokio::test]
    async fn test_empty_file() {
        let hub = MemoryHub::new();
        let (a_dir, b_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (alice, _) = channel(&hub, ALICE, a_dir.path());
        let (_bob, mut inbox) = channel(&hub, BOB, b_dir.path());

        let path = a_dir.path().join("vacio");
        fs::write(&path, b"").unwrap();
        alice.send_file(BOB, &path).await.unwrap();

        let file = next(&mut inbox).await;
        assert_eq!(file.size, 0);
        assert!(fs::read(&file.path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_chunked_file() {
        let hub = MemoryHub::new();
        let (a_dir, b_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (alice, _) = channel(&hub, ALICE, a_dir.path());
        let (bob, mut inbox) = channel(&hub, BOB, b_dir.path());

        let data = sample(100_000);
        let path = a_dir.path().join("big.bin");
        fs::write(&path, &data).unwrap();
        let metadata = alice.send_file(BOB, &path).await.unwrap();
        assert_eq!(metadata.size, 100_000);

        let file = next(&mut inbox).await;
        assert_eq!(file.size, 100_000);
        assert_eq!(fs::read(&file.path).unwrap(), data);
        assert!(bob.pending_transfers().is_empty());
    }

    #[tokio::test]
    async fn test_chunks_before_metadata() {
        let hub = MemoryHub::new();
        let b_dir = tempfile::tempdir().unwrap();
        let (_bob, mut inbox) = channel(&hub, BOB, b_dir.path());
        let raw = hub.connect(ALICE, ETH_P_LINKCHAT);

        let data = sample(3000);
        let hash = content_hash(&data);
        let chunks: Vec<&[u8]> = data.chunks(CHUNK_SIZE).collect();
        assert_eq!(chunks.len(), 3);

        for index in [2usize, 1, 0] {
            send_raw(
                &raw,
                FileFrame::Chunk(ChunkBody {
                    content_hash: hash,
                    index: index as u32,
                    data: Bytes::copy_from_slice(chunks[index]),
                }),
            )
            .await;
        }
        send_raw(
            &raw,
            FileFrame::Meta {
                metadata: TransferMetadata::new("tarde.bin", 3000, hash).unwrap(),
                archive: false,
                inline: None,
            },
        )
        .await;

        let file = next(&mut inbox).await;
        assert_eq!(file.name, "tarde.bin");
        assert_eq!(fs::read(&file.path).unwrap(), data);
    }

    #[tokio::test]
    async fn test_hash_mismatch_keeps_transfer_pending() {
        let hub = MemoryHub::new();
        let b_dir = tempfile::tempdir().unwrap();
        let (bob, mut inbox) = channel(&hub, BOB, b_dir.path());
        let raw = hub.connect(ALICE, ETH_P_LINKCHAT);

        let data = sample(2000);
        let hash = content_hash(&data);
        send_raw(
            &raw,
            FileFrame::Meta {
                metadata: TransferMetadata::new("roto.bin", 2000, hash).unwrap(),
                archive: false,
                inline: None,
            },
        )
        .await;
        for (index, piece) in data.chunks(CHUNK_SIZE).enumerate() {
            let mut piece = piece.to_vec();
            piece[0] ^= 0xFF;
            send_raw(
                &raw,
                FileFrame::Chunk(ChunkBody {
                    content_hash: hash,
                    index: index as u32,
                    data: Bytes::from(piece),
                }),
            )
            .await;
        }

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(inbox.try_recv().is_err());
        assert_eq!(bob.pending_transfers().len(), 1);
        assert!(!b_dir.path().join("roto.bin").exists());
    }

    #[tokio::test]
    async fn test_folder_archive() {
        let hub = MemoryHub::new();
        let (a_dir, b_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (alice, _) = channel(&hub, ALICE, a_dir.path());
        let (_bob, mut inbox) = channel(&hub, BOB, b_dir.path());

        let src = tempfile::tempdir().unwrap();
        let folder = src.path().join("proyecto");
        fs::create_dir_all(folder.join("src")).unwrap();
        fs::write(folder.join("README"), b"leeme").unwrap();
        fs::write(folder.join("src").join("main.rs"), sample(4000)).unwrap();

        alice.send_folder(BOB, &folder).await.unwrap();

        let file = next(&mut inbox).await;
        assert!(file.archive);
        assert_eq!(file.name, "proyecto");
        assert_eq!(file.path, b_dir.path().join("proyecto"));
        assert_eq!(fs::read(file.path.join("README")).unwrap(), b"leeme");
        assert_eq!(fs::read(file.path.join("src").join("main.rs")).unwrap(), sample(4000));

        // 아카이브 파일은 양쪽 모두 남지 않음
        assert!(!b_dir.path().join("proyecto.lca").exists());
        assert!(!a_dir.path().join("tmp").join("proyecto.lca").exists());
    }

    #[tokio::test]
    async fn test_send_folder_with_regular_file() {
        let hub = MemoryHub::new();
        let (a_dir, b_dir) = (tempfile::tempdir().unwrap(), tempfile::tempdir().unwrap());
        let (alice, _) = channel(&hub, ALICE, a_dir.path());
        let (_bob, mut inbox) = channel(&hub, BOB, b_dir.path());

        let path = a_dir.path().join("solo.txt");
        fs::write(&path, b"uno").unwrap();
        alice.send_folder(BOB, &path).await.unwrap();

        let file = next(&mut inbox).await;
        assert!(!file.archive);
        assert_eq!(file.name, "solo.txt");
    }

    /// 송신이 항상 실패하는 링크
    struct BrokenLink;

    #[async_trait::async_trait]
    impl Link for BrokenLink {
        fn local_mac(&self) -> MacAddr {
            ALICE
        }

        fn protocol_id(&self) -> u16 {
            ETH_P_LINKCHAT
        }

        async fn send(&self, _frame: &[u8]) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::NetworkDown, "link down"))
        }

        async fn recv(&self, _buf: &mut [u8]) -> std::io::Result<usize> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_send_folder_failure_removes_archive() {
        let a_dir = tempfile::tempdir().unwrap();
        let config = test_config(a_dir.path());
        let tmp_dir = config.tmp_dir();
        let (alice, _) = FileChannel::start(Arc::new(BrokenLink), config).unwrap();

        let src = tempfile::tempdir().unwrap();
        let folder = src.path().join("fallido");
        fs::create_dir_all(&folder).unwrap();
        fs::write(folder.join("datos.bin"), sample(5000)).unwrap();

        let result = alice.send_folder(BOB, &folder).await;
        assert!(matches!(result, Err(Error::Io(_))));
        assert!(!tmp_dir.join("fallido.lca").exists());
        // 원본 폴더는 그대로
        assert!(folder.join("datos.bin").exists());
    }

    #[tokio::test]
    async fn test_hostile_archive_does_not_stop_receiver() {
        let hub = MemoryHub::new();
        let b_dir = tempfile::tempdir().unwrap();
        let (_bob, mut inbox) = channel(&hub, BOB, b_dir.path());
        let raw = hub.connect(ALICE, ETH_P_LINKCHAT);

        // 경로 길이를 2^60으로 선언한 아카이브
        let mut evil = b"LCA1".to_vec();
        evil.extend_from_slice(&1u64.to_le_bytes());
        evil.extend_from_slice(&(1u64 << 60).to_le_bytes());
        evil.extend_from_slice(&[0xAA; 16]);
        send_raw(
            &raw,
            FileFrame::Meta {
                metadata: TransferMetadata::new("evil.lca", evil.len() as u64, content_hash(&evil))
                    .unwrap(),
                archive: true,
                inline: Some(Bytes::from(evil)),
            },
        )
        .await;

        // 수신 태스크는 계속 동작
        let good = b"sigo vivo".to_vec();
        send_raw(
            &raw,
            FileFrame::Meta {
                metadata: TransferMetadata::new("ok.txt", good.len() as u64, content_hash(&good))
                    .unwrap(),
                archive: false,
                inline: Some(Bytes::from(good.clone())),
            },
        )
        .await;

        let file = next(&mut inbox).await;
        assert_eq!(file.name, "ok.txt");
        assert_eq!(fs::read(&file.path).unwrap(), good);
        assert!(!b_dir.path().join("evil.lca").exists());
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let hub = MemoryHub::new();
        let a_dir = tempfile::tempdir().unwrap();
        let (alice, _) = channel(&hub, ALICE, a_dir.path());

        let result = alice.send_file(BOB, &a_dir.path().join("no-existe")).await;
        assert!(matches!(result, Err(Error::Io(_))));
    }
}
