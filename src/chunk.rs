//! 파일 청크 저장소
//!
//! - 송신측: 파일을 `chunk_size` 단위 청크로 분할 ([`FileChunker`])
//! - 수신측: 전송별 `.part` 파일에 임의 오프셋 쓰기, 완료 판정, 해시 검증 후 이동
//!
//! 전송은 세션 ID가 아니라 content hash로 식별.
//! 메타데이터가 먼저 와도, 청크가 먼저 와도 같은 엔트리로 합쳐짐.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::message::{ChunkBody, TransferMetadata};
use crate::{Error, Result};

/// 16바이트 content hash
pub type ContentHash = [u8; 16];

/// 수신 가능한 최대 파일 크기 (64 GiB)
pub const MAX_TRANSFER_SIZE: u64 = 1 << 36;

/// 스트리밍 해시 읽기 버퍼 크기
const HASH_BUF_SIZE: usize = 8192;

/// 스트리밍 content hasher (BLAKE3 앞 16바이트)
#[derive(Default)]
pub struct ContentHasher {
    inner: blake3::Hasher,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(&self) -> ContentHash {
        let mut out = [0u8; 16];
        out.copy_from_slice(&self.inner.finalize().as_bytes()[..16]);
        out
    }
}

/// 바이트 슬라이스 content hash
pub fn content_hash(data: &[u8]) -> ContentHash {
    let mut hasher = ContentHasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// 파일 content hash와 크기
pub fn hash_file(path: &Path) -> io::Result<(ContentHash, u64)> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = ContentHasher::new();
    let mut buf = [0u8; HASH_BUF_SIZE];
    let mut size = 0u64;

    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }

    Ok((hasher.finalize(), size))
}

/// 파일을 청크로 분할하는 반복자 (송신측)
pub struct FileChunker {
    reader: BufReader<File>,
    content_hash: ContentHash,
    chunk_size: usize,
    next_index: u32,
    done: bool,
}

impl FileChunker {
    pub fn open(path: &Path, content_hash: ContentHash, chunk_size: usize) -> io::Result<Self> {
        Ok(Self {
            reader: BufReader::new(File::open(path)?),
            content_hash,
            chunk_size,
            next_index: 0,
            done: false,
        })
    }
}

impl Iterator for FileChunker {
    type Item = io::Result<ChunkBody>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let mut data = Vec::with_capacity(self.chunk_size);
        let read = (&mut self.reader)
            .take(self.chunk_size as u64)
            .read_to_end(&mut data);

        match read {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                let chunk = ChunkBody {
                    content_hash: self.content_hash,
                    index: self.next_index,
                    data: Bytes::from(data),
                };
                self.next_index += 1;
                Some(Ok(chunk))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// 수신 대기 중인 전송
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    /// `.part` 파일 경로
    pub path: PathBuf,

    /// 수신된 청크 인덱스
    pub received: HashSet<u32>,

    /// 파일 이름 (메타데이터 수신 전에는 None)
    pub name: Option<String>,

    /// 파일 크기 (메타데이터 수신 전에는 None)
    pub size: Option<u64>,

    pub content_hash: ContentHash,

    /// 디렉터리 아카이브 여부
    pub archive: bool,

    /// 생성 시간
    pub created_at: Instant,

    /// 마지막 메타데이터/청크 수신 시간 (타임아웃 기준)
    pub last_activity: Instant,
}

impl PendingTransfer {
    fn new(path: PathBuf, content_hash: ContentHash) -> Self {
        let now = Instant::now();
        Self {
            path,
            received: HashSet::new(),
            name: None,
            size: None,
            content_hash,
            archive: false,
            created_at: now,
            last_activity: now,
        }
    }

    /// 필요한 총 청크 수 (크기를 모르면 None)
    pub fn total_chunks(&self, chunk_size: usize) -> Option<u64> {
        self.size.map(|size| size.div_ceil(chunk_size as u64))
    }

    /// 이름과 크기를 알고 모든 청크를 받았는지
    pub fn is_complete(&self, chunk_size: usize) -> bool {
        match (self.name.as_ref(), self.total_chunks(chunk_size)) {
            (Some(_), Some(total)) => self.received.len() as u64 >= total,
            _ => false,
        }
    }

    fn missing(&self, chunk_size: usize) -> u64 {
        self.total_chunks(chunk_size)
            .map(|total| total.saturating_sub(self.received.len() as u64))
            .unwrap_or(u64::MAX)
    }
}

/// 검증 후 최종 위치로 이동된 파일
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinalizedFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    pub content_hash: ContentHash,
    pub archive: bool,
}

/// 전송별 on-disk 청크 저장소
///
/// 엔트리 테이블만 잠금. 파일 쓰기와 해시 검증은 잠금 밖에서 수행하므로
/// 큰 파일 검증 중에도 `pending()`, `sweep()`은 바로 반환.
pub struct ChunkStore {
    download_dir: PathBuf,
    tmp_dir: PathBuf,
    chunk_size: usize,
    pending: Mutex<HashMap<String, PendingTransfer>>,
}

impl ChunkStore {
    /// 저장소 생성 (`download_dir`, `download_dir/tmp` 생성)
    pub fn new(download_dir: impl Into<PathBuf>, chunk_size: usize) -> Result<Self> {
        let download_dir = download_dir.into();
        let tmp_dir = download_dir.join("tmp");
        fs::create_dir_all(&tmp_dir)?;

        Ok(Self {
            download_dir,
            tmp_dir,
            chunk_size,
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub fn download_dir(&self) -> &Path {
        &self.download_dir
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    fn part_path(&self, key: &str) -> PathBuf {
        self.tmp_dir.join(format!("{}.part", key))
    }

    /// 메타데이터 수신 (metadata-first 경로)
    ///
    /// `.part`를 정확히 `size` 바이트로 맞춤. 먼저 도착한 청크 데이터는 유지.
    pub fn begin(
        &self,
        metadata: &TransferMetadata,
        archive: bool,
    ) -> Result<Option<FinalizedFile>> {
        if metadata.size > MAX_TRANSFER_SIZE {
            return Err(Error::MessageTooLarge {
                size: metadata.size as usize,
                max: MAX_TRANSFER_SIZE as usize,
            });
        }
        let name = sanitize_name(&metadata.file_name)?;

        let key = hex::encode(metadata.content_hash);
        let path = self.part_path(&key);

        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.set_len(metadata.size)?;

        let total = metadata.size.div_ceil(self.chunk_size as u64);
        let complete = {
            let mut pending = self.pending.lock();
            let entry = pending
                .entry(key)
                .or_insert_with(|| PendingTransfer::new(path, metadata.content_hash));
            entry.name = Some(name);
            entry.size = Some(metadata.size);
            entry.archive = archive;
            entry.last_activity = Instant::now();
            // 크기 밖의 청크는 무효
            entry.received.retain(|&index| (index as u64) < total);

            debug!(
                "전송 준비: {} ({} bytes, {}/{} chunks)",
                metadata.file_name,
                metadata.size,
                entry.received.len(),
                total
            );
            entry.is_complete(self.chunk_size)
        };

        if complete {
            return self.finalize(&metadata.content_hash).map(Some);
        }
        Ok(None)
    }

    /// 청크 쓰기 (chunk-first 가능)
    ///
    /// `index * chunk_size` 위치에 기록하고 완료되면 finalize.
    pub fn write_chunk(
        &self,
        content_hash: &ContentHash,
        index: u32,
        data: &[u8],
    ) -> Result<Option<FinalizedFile>> {
        let key = hex::encode(content_hash);
        let offset = index as u64 * self.chunk_size as u64;
        let end = offset + data.len() as u64;

        if data.len() > self.chunk_size {
            return Err(Error::InvalidChunkIndex { index });
        }

        let limit = self
            .pending
            .lock()
            .get(&key)
            .and_then(|entry| entry.size)
            .unwrap_or(MAX_TRANSFER_SIZE);
        if end > limit {
            return Err(Error::InvalidChunkIndex { index });
        }

        let path = self.part_path(&key);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        let complete = {
            let mut pending = self.pending.lock();
            let entry = pending
                .entry(key)
                .or_insert_with(|| PendingTransfer::new(path, *content_hash));
            entry.received.insert(index);
            entry.last_activity = Instant::now();
            entry.is_complete(self.chunk_size)
        };

        if complete {
            return self.finalize(content_hash).map(Some);
        }
        Ok(None)
    }

    /// 해시 검증 후 최종 위치로 이동
    ///
    /// 해시가 다르면 `HashMismatch`, 엔트리는 그대로 남음 (재시도 없음).
    pub fn finalize(&self, content_hash: &ContentHash) -> Result<FinalizedFile> {
        let key = hex::encode(content_hash);
        let (name, size, part, archive) = {
            let pending = self.pending.lock();
            let entry = pending.get(&key).ok_or_else(|| Error::TransferIncomplete {
                hash: key.clone(),
                missing: u64::MAX,
            })?;

            match (&entry.name, entry.size) {
                (Some(name), Some(size)) if entry.is_complete(self.chunk_size) => {
                    (name.clone(), size, entry.path.clone(), entry.archive)
                }
                _ => {
                    return Err(Error::TransferIncomplete {
                        missing: entry.missing(self.chunk_size),
                        hash: key,
                    })
                }
            }
        };

        // 전체 파일 해시는 잠금 밖에서
        let (actual, _) = hash_file(&part)?;
        if actual != *content_hash {
            warn!("해시 불일치: {} ({})", name, key);
            return Err(Error::HashMismatch { hash: key });
        }

        let destination = self.download_dir.join(&name);
        {
            let mut pending = self.pending.lock();
            // 검증 중에 sweep으로 제거됐으면 완료 불가
            if pending.remove(&key).is_none() {
                return Err(Error::TransferIncomplete {
                    hash: key,
                    missing: u64::MAX,
                });
            }
            fs::rename(&part, &destination)?;
        }

        info!("파일 재조립 완료: {} ({} bytes)", destination.display(), size);

        Ok(FinalizedFile {
            name,
            path: destination,
            size,
            content_hash: *content_hash,
            archive,
        })
    }

    /// 단일 프레임 파일 저장 (청크 없이 메타데이터 + 내용)
    ///
    /// 해시가 일치할 때만 최종 파일 생성.
    pub fn store_inline(
        &self,
        metadata: &TransferMetadata,
        data: &[u8],
        archive: bool,
    ) -> Result<FinalizedFile> {
        let name = sanitize_name(&metadata.file_name)?;
        let key = hex::encode(metadata.content_hash);

        if data.len() as u64 != metadata.size {
            return Err(Error::LengthMismatch {
                declared: metadata.size as usize,
                actual: data.len(),
            });
        }
        if content_hash(data) != metadata.content_hash {
            warn!("해시 불일치: {} ({})", name, key);
            return Err(Error::HashMismatch { hash: key });
        }

        let part = self.part_path(&key);
        fs::write(&part, data)?;
        let destination = self.download_dir.join(&name);
        fs::rename(&part, &destination)?;
        self.pending.lock().remove(&key);

        info!("파일 수신: {} ({} bytes)", destination.display(), data.len());

        Ok(FinalizedFile {
            name,
            path: destination,
            size: metadata.size,
            content_hash: metadata.content_hash,
            archive,
        })
    }

    /// `max_age` 동안 아무것도 받지 못한 전송 제거 (`.part` 삭제), 제거 수 반환
    pub fn sweep(&self, now: Instant, max_age: Duration) -> usize {
        let mut pending = self.pending.lock();
        let before = pending.len();
        pending.retain(|key, entry| {
            let stale = now.saturating_duration_since(entry.last_activity) > max_age;
            if stale {
                warn!(
                    "전송 타임아웃: {} ({}/{:?} chunks)",
                    key,
                    entry.received.len(),
                    entry.total_chunks(self.chunk_size)
                );
                if let Err(e) = fs::remove_file(&entry.path) {
                    debug!("part 파일 삭제 실패: {}", e);
                }
            }
            !stale
        });
        before - pending.len()
    }

    /// 대기 중인 전송 조회
    pub fn get(&self, content_hash: &ContentHash) -> Option<PendingTransfer> {
        self.pending.lock().get(&hex::encode(content_hash)).cloned()
    }

    /// 대기 중인 전송 스냅샷
    pub fn pending(&self) -> Vec<PendingTransfer> {
        self.pending.lock().values().cloned().collect()
    }
}

/// 파일 이름에서 마지막 경로 요소만 사용
fn sanitize_name(name: &str) -> Result<String> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidName(name.to_string()))
}
