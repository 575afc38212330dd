//! 디렉터리 아카이브 (`.lca`)
//!
//! 디렉터리를 파일 하나로 묶어 일반 파일처럼 전송.
//! 엔트리 경로는 디렉터리 이름부터 시작 (`photos/2024/a.jpg`), `/` 구분, 정렬됨.
//! 풀 때 절대 경로나 `..`가 포함된 엔트리는 거부.
//!
//! 형식: `ArchiveHeader` 다음에 엔트리마다 `EntryHeader` + 파일 내용 (파일만).
//! 헤더는 bincode(fixint)로 인코딩하고 읽을 때 크기 제한을 걸어,
//! 내용은 `io::copy`로 스트리밍해서 폴더 크기와 관계없이 메모리 사용이 일정.

use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use bincode::Options;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// 아카이브 확장자
pub const ARCHIVE_EXTENSION: &str = "lca";

const ARCHIVE_MAGIC: [u8; 4] = *b"LCA1";

/// 헤더 하나의 최대 인코딩 크기
const MAX_HEADER_SIZE: u64 = 4096;

#[derive(Debug, Serialize, Deserialize)]
struct ArchiveHeader {
    magic: [u8; 4],
    entries: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
enum EntryKind {
    Dir,
    File { size: u64 },
}

#[derive(Debug, Serialize, Deserialize)]
struct EntryHeader {
    path: String,
    kind: EntryKind,
}

/// 헤더 인코딩 옵션 (고정 길이 정수, 크기 제한)
fn header_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_HEADER_SIZE)
}

fn write_header<W: Write, T: Serialize>(writer: &mut W, header: &T) -> Result<()> {
    header_options()
        .serialize_into(writer, header)
        .map_err(|e| Error::Archive(e.to_string()))
}

fn read_header<R: Read, T: for<'de> Deserialize<'de>>(reader: &mut R) -> Result<T> {
    header_options()
        .deserialize_from(reader)
        .map_err(|e| Error::Archive(e.to_string()))
}

/// 디렉터리를 아카이브 파일로 저장, 엔트리 수 반환
pub fn pack_dir(dir: &Path, dest: &Path) -> Result<usize> {
    let root = dir
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Archive(format!("디렉터리 이름 없음: {}", dir.display())))?
        .to_string();

    let mut entries = vec![(root.clone(), None)];
    collect(dir, &root, &mut entries)?;
    entries.sort_by(|a, b| a.0.cmp(&b.0));

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(dest)?);
    write_header(
        &mut writer,
        &ArchiveHeader {
            magic: ARCHIVE_MAGIC,
            entries: entries.len() as u64,
        },
    )?;

    for (path, source) in &entries {
        let Some(source) = source else {
            write_header(
                &mut writer,
                &EntryHeader {
                    path: path.clone(),
                    kind: EntryKind::Dir,
                },
            )?;
            continue;
        };

        let file = File::open(source)?;
        let size = file.metadata()?.len();
        write_header(
            &mut writer,
            &EntryHeader {
                path: path.clone(),
                kind: EntryKind::File { size },
            },
        )?;
        let copied = io::copy(&mut file.take(size), &mut writer)?;
        if copied != size {
            return Err(Error::Archive(format!(
                "파일 크기 변경됨: {} ({} → {} bytes)",
                source.display(),
                size,
                copied
            )));
        }
    }
    writer.flush()?;

    debug!(
        "아카이브 생성: {} → {} ({} entries)",
        dir.display(),
        dest.display(),
        entries.len()
    );
    Ok(entries.len())
}

/// (아카이브 내 경로, 원본 파일 경로). 디렉터리는 None.
fn collect(dir: &Path, prefix: &str, entries: &mut Vec<(String, Option<PathBuf>)>) -> Result<()> {
    for item in fs::read_dir(dir)? {
        let item = item?;
        let name = item.file_name();
        let name = name
            .to_str()
            .ok_or_else(|| Error::Archive(format!("UTF-8이 아닌 경로: {:?}", name)))?;
        let path = format!("{}/{}", prefix, name);
        let file_type = item.file_type()?;

        if file_type.is_dir() {
            entries.push((path.clone(), None));
            collect(&item.path(), &path, entries)?;
        } else if file_type.is_file() {
            entries.push((path, Some(item.path())));
        }
        // 심볼릭 링크 등은 건너뜀
    }
    Ok(())
}

/// 엔트리 헤더를 모두 읽어 경로, 크기 검증 (내용은 건너뜀)
fn scan(reader: &mut BufReader<File>, archive_len: u64) -> Result<Vec<EntryHeader>> {
    let header: ArchiveHeader = read_header(reader)?;
    if header.magic != ARCHIVE_MAGIC {
        return Err(Error::Archive("아카이브 형식이 아님".into()));
    }

    let mut entries = Vec::new();
    for _ in 0..header.entries {
        let entry: EntryHeader = read_header(reader)?;
        if let EntryKind::File { size } = entry.kind {
            let position = reader.stream_position()?;
            if size > archive_len.saturating_sub(position) {
                return Err(Error::Archive(format!(
                    "엔트리 크기가 아카이브보다 큼: {} ({} bytes)",
                    entry.path, size
                )));
            }
            reader.seek(SeekFrom::Start(position + size))?;
        }
        entries.push(entry);
    }
    Ok(entries)
}

/// 아카이브를 `dest_dir` 아래에 풀고 최상위 디렉터리 경로 반환
pub fn unpack(archive_path: &Path, dest_dir: &Path) -> Result<PathBuf> {
    let file = File::open(archive_path)?;
    let archive_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    // 쓰기 전에 전체 경로 검증
    let entries = scan(&mut reader, archive_len)?;
    let mut resolved = Vec::with_capacity(entries.len());
    for entry in &entries {
        resolved.push(safe_join(dest_dir, &entry.path)?);
    }

    let root = entries
        .first()
        .and_then(|e| e.path.split('/').next())
        .map(|r| dest_dir.join(r))
        .ok_or_else(|| Error::Archive("빈 아카이브".into()))?;

    reader.seek(SeekFrom::Start(0))?;
    let _: ArchiveHeader = read_header(&mut reader)?;

    for path in &resolved {
        let entry: EntryHeader = read_header(&mut reader)?;
        match entry.kind {
            EntryKind::Dir => fs::create_dir_all(path)?,
            EntryKind::File { size } => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut out = BufWriter::new(File::create(path)?);
                let copied = io::copy(&mut (&mut reader).take(size), &mut out)?;
                out.flush()?;
                if copied != size {
                    return Err(Error::Archive(format!("잘린 엔트리: {}", entry.path)));
                }
            }
        }
    }

    info!(
        "아카이브 해제: {} ({} entries)",
        root.display(),
        entries.len()
    );
    Ok(root)
}

/// 상대 경로만 허용해서 결합
fn safe_join(base: &Path, relative: &str) -> Result<PathBuf> {
    let mut out = base.to_path_buf();
    let mut depth = 0;
    for component in Path::new(relative).components() {
        match component {
            Component::Normal(part) => {
                out.push(part);
                depth += 1;
            }
            _ => return Err(Error::Archive(format!("허용되지 않는 경로: {}", relative))),
        }
    }
    if depth == 0 {
        return Err(Error::Archive(format!("빈 경로: {:?}", relative)));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 헤더와 내용을 그대로 기록한 아카이브
    fn write_raw(path: &Path, entries: &[(&str, Option<&[u8]>)]) {
        let mut out = Vec::new();
        write_header(
            &mut out,
            &ArchiveHeader {
                magic: ARCHIVE_MAGIC,
                entries: entries.len() as u64,
            },
        )
        .unwrap();
        for (name, data) in entries {
            let kind = match data {
                Some(data) => EntryKind::File {
                    size: data.len() as u64,
                },
                None => EntryKind::Dir,
            };
            write_header(
                &mut out,
                &EntryHeader {
                    path: name.to_string(),
                    kind,
                },
            )
            .unwrap();
            if let Some(data) = data {
                out.extend_from_slice(data);
            }
        }
        fs::write(path, out).unwrap();
    }

    #[test]
    fn test_pack_and_unpack() {
        let src = tempfile::tempdir().unwrap();
        let dir = src.path().join("album");
        fs::create_dir_all(dir.join("2024").join("empty")).unwrap();
        fs::write(dir.join("readme.txt"), b"fotos").unwrap();
        fs::write(dir.join("2024").join("a.bin"), vec![7u8; 5000]).unwrap();

        let archive = src.path().join("album.lca");
        let count = pack_dir(&dir, &archive).unwrap();
        assert_eq!(count, 5);

        let dest = tempfile::tempdir().unwrap();
        let root = unpack(&archive, dest.path()).unwrap();
        assert_eq!(root, dest.path().join("album"));
        assert_eq!(fs::read(root.join("readme.txt")).unwrap(), b"fotos");
        assert_eq!(fs::read(root.join("2024").join("a.bin")).unwrap(), vec![7u8; 5000]);
        assert!(root.join("2024").join("empty").is_dir());
    }

    #[test]
    fn test_pack_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        let dir = src.path().join("d");
        fs::create_dir_all(&dir).unwrap();
        for name in ["z", "a", "m"] {
            fs::write(dir.join(name), name.as_bytes()).unwrap();
        }

        pack_dir(&dir, &src.path().join("1.lca")).unwrap();
        pack_dir(&dir, &src.path().join("2.lca")).unwrap();
        assert_eq!(
            fs::read(src.path().join("1.lca")).unwrap(),
            fs::read(src.path().join("2.lca")).unwrap()
        );
    }

    #[test]
    fn test_traversal_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("evil.lca");
        write_raw(&path, &[("ok", None), ("ok/../../escape.txt", Some(b"x"))]);

        let dest = tmp.path().join("out");
        assert!(matches!(unpack(&path, &dest), Err(Error::Archive(_))));
        assert!(!tmp.path().join("escape.txt").exists());
        assert!(!dest.join("ok").exists());
    }

    #[test]
    fn test_garbage_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("junk.lca");
        fs::write(&path, b"definitely not an archive").unwrap();
        assert!(matches!(unpack(&path, tmp.path()), Err(Error::Archive(_))));
    }

    #[test]
    fn test_huge_declared_path_length_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("huge.lca");

        let mut bytes = ARCHIVE_MAGIC.to_vec();
        bytes.extend_from_slice(&1u64.to_le_bytes());
        bytes.extend_from_slice(&(1u64 << 60).to_le_bytes());
        bytes.extend_from_slice(b"abc");
        fs::write(&path, bytes).unwrap();

        assert!(matches!(unpack(&path, tmp.path()), Err(Error::Archive(_))));
    }

    #[test]
    fn test_entry_larger_than_archive_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("short.lca");
        write_raw(&path, &[("d", None), ("d/a", Some(b"abc"))]);

        // 마지막 내용 바이트를 잘라냄
        let mut bytes = fs::read(&path).unwrap();
        bytes.pop();
        fs::write(&path, bytes).unwrap();

        let dest = tmp.path().join("out");
        assert!(matches!(unpack(&path, &dest), Err(Error::Archive(_))));
        assert!(!dest.join("d").exists());
    }
}
