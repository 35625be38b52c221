//! 补丁的生成与应用
//!
//! 补丁包是 gzip 压缩的 GNU tar：
//!
//! - `xdelta/<相对路径>`: 差分片段、目录与符号链接，成员头记录新版本的属性
//! - `.manifest.toml`: [`Manifest`]
//! - `.info`: 生成时附带的元数据文件 (可选)

mod apply;
mod diff;
mod manifest;

use anyhow::{Context, Result, bail};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

use crate::archive::ContainerFactory;
use crate::config::{Action, Config};
use crate::delta::DeltaTool;
use crate::error::PatchError;
use crate::utils::remove_staging;

pub use apply::remove_item;
pub use manifest::{Checksum, MANIFEST_VERSION, Manifest, file_checksum};

/// 补丁包内存放文件成员的顶层目录
pub const BUNDLE_ROOT: &str = "xdelta";
pub const MANIFEST_NAME: &str = ".manifest.toml";
pub const METADATA_NAME: &str = ".info";

#[derive(Debug, Clone, Default)]
pub struct DiffOptions {
    pub metadata_path: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// 缺省时原地更新旧版本
    pub target_dir: Option<PathBuf>,
    /// 补丁包中作为根的目录，缺省为 [`BUNDLE_ROOT`]
    pub root_patch_dir: Option<String>,
    pub staging_dir: Option<PathBuf>,
    pub ignore_euid: bool,
}

/// 驱动两棵目录树之间的差分与还原，本身不保存状态
pub struct TreeSynchronizer {
    delta: Arc<dyn DeltaTool>,
}

impl TreeSynchronizer {
    pub fn new(delta: Arc<dyn DeltaTool>) -> Self {
        Self { delta }
    }

    pub fn run(&self, config: &Config) -> Result<()> {
        match config.action {
            Action::Diff => {
                let Some(new_path) = &config.new_path else {
                    bail!("生成补丁需要指定新版本路径");
                };
                self.diff(
                    &config.old_path,
                    new_path,
                    &config.bundle_path,
                    &config.diff_options(),
                )
            }
            Action::Apply => self.apply(
                &config.old_path,
                &config.bundle_path,
                &config.apply_options(),
            ),
        }
    }
}

/// 在 `staging_dir` (缺省为系统临时目录) 下创建本次运行专用的临时目录
pub(crate) fn staging_area(staging_dir: Option<&Path>) -> Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("dir_patcher_");
    match staging_dir {
        Some(dir) => {
            fs::create_dir_all(dir).with_context(|| format!("无法创建临时目录: {:?}", dir))?;
            builder
                .tempdir_in(dir)
                .with_context(|| format!("无法创建临时目录: {:?}", dir))
        }
        None => builder.tempdir().context("无法创建临时目录"),
    }
}

/// 还原属主需要 root 权限；`ignore` 为真时跳过检查
pub fn check_euid(ignore: bool, euid: impl FnOnce() -> u32) -> Result<()> {
    if ignore {
        return Ok(());
    }
    match euid() {
        0 => Ok(()),
        euid => Err(PatchError::PrivilegeRequired { euid }.into()),
    }
}

/// 读取补丁包中附带的元数据文件
pub fn read_metadata(bundle: &Path) -> Result<Option<Vec<u8>>> {
    let container = ContainerFactory::open(bundle)?;
    if !container.list_items()?.contains(Some(METADATA_NAME)) {
        return Ok(None);
    }

    let staging = staging_area(None)?;
    container.expand(Some(METADATA_NAME), staging.path())?;
    let bytes = fs::read(staging.path().join(METADATA_NAME))
        .with_context(|| format!("无法读取 {}", METADATA_NAME))?;
    remove_staging(staging)?;
    Ok(Some(bytes))
}
