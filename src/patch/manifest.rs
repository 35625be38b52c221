use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;

use super::MANIFEST_NAME;
use crate::error::PatchError;

pub const MANIFEST_VERSION: &str = "1.0";

/// 十六进制 SHA256
pub type Checksum = String;

/// 补丁包清单
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub created_at: String,
    /// 新版本中已不存在的路径
    #[serde(default)]
    pub deleted: Vec<String>,
    /// 新版本中每个普通文件的 SHA256
    #[serde(default)]
    pub checksums: BTreeMap<String, Checksum>,
}

impl Manifest {
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
            deleted: Vec::new(),
            checksums: BTreeMap::new(),
        }
    }

    /// 从解包后的补丁包目录读取清单；没有清单的补丁包视为不删除任何文件
    pub fn load(bundle_dir: &Path) -> Result<Self> {
        let path = bundle_dir.join(MANIFEST_NAME);
        if !path.exists() {
            return Ok(Self::new());
        }
        let content =
            fs::read_to_string(&path).with_context(|| format!("无法读取 {}", MANIFEST_NAME))?;
        toml::from_str(&content).with_context(|| format!("无法解析 {}", MANIFEST_NAME))
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// 记录新版本文件 `key` 的校验和
    pub fn record(&mut self, key: &str, path: &Path) -> Result<()> {
        self.checksums.insert(key.to_string(), file_checksum(path)?);
        Ok(())
    }

    /// 核对还原出的文件；清单中没有记录的文件不检查
    pub fn verify(&self, key: &str, path: &Path) -> Result<()> {
        let Some(expected) = self.checksums.get(key) else {
            return Ok(());
        };
        let actual = file_checksum(path)?;
        if &actual != expected {
            return Err(PatchError::ChecksumMismatch {
                path: path.to_path_buf(),
                expected: expected.clone(),
                actual,
            }
            .into());
        }
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "文件: {} 个, 删除: {} 个",
            self.checksums.len(),
            self.deleted.len()
        )
    }
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

pub fn file_checksum(path: &Path) -> Result<Checksum> {
    let mut file = File::open(path).with_context(|| format!("无法打开文件: {:?}", path))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("无法读取文件: {:?}", path))?;
    Ok(hex::encode(hasher.finalize()))
}
