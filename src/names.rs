//! peer 표시 이름 저장소 (`mac_names.json`)

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::debug;

use crate::mac::MacAddr;
use crate::{Error, Result};

/// 기본 파일 이름
pub const NAMES_FILE: &str = "mac_names.json";

/// MAC → 표시 이름
pub struct PeerNames {
    path: PathBuf,
    names: RwLock<BTreeMap<String, String>>,
}

impl PeerNames {
    /// 파일에서 로드 (없으면 빈 저장소)
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let names = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path,
            names: RwLock::new(names),
        })
    }

    pub fn get(&self, mac: &MacAddr) -> Option<String> {
        self.names.read().get(&mac.to_string()).cloned()
    }

    /// 이름이 있으면 이름, 없으면 MAC 문자열
    pub fn display(&self, mac: &MacAddr) -> String {
        self.get(mac).unwrap_or_else(|| mac.to_string())
    }

    /// 이름 지정 후 즉시 저장
    pub fn set(&self, mac: &MacAddr, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(Error::InvalidName(name.to_string()));
        }
        self.names.write().insert(mac.to_string(), name.to_string());
        self.save()
    }

    pub fn remove(&self, mac: &MacAddr) -> Result<Option<String>> {
        let removed = self.names.write().remove(&mac.to_string());
        self.save()?;
        Ok(removed)
    }

    /// 전체 목록 스냅샷
    pub fn all(&self) -> BTreeMap<String, String> {
        self.names.read().clone()
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&*self.names.read())?;
        fs::write(&self.path, json)?;
        debug!("이름 저장: {}", self.path.display());
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
