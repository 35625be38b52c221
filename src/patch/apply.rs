use anyhow::{Context, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::{ApplyOptions, BUNDLE_ROOT, Manifest, TreeSynchronizer, check_euid, staging_area};
use crate::archive::{ContainerFactory, MetadataNode, NodeKind, expand_all, normalize_key};
use crate::error::PatchError;
use crate::utils::{
    clear_path, create_symlink, effective_uid, is_privileged, remove_staging, restore_attributes,
};

impl TreeSynchronizer {
    /// 将补丁包应用到 `old`，结果写入目标目录 (缺省为 `old` 本身)
    pub fn apply(&self, old: &Path, bundle: &Path, options: &ApplyOptions) -> Result<()> {
        check_euid(options.ignore_euid, effective_uid)?;

        let target = options
            .target_dir
            .clone()
            .unwrap_or_else(|| old.to_path_buf());
        if fs::symlink_metadata(&target).is_ok_and(|metadata| !metadata.is_dir()) {
            return Err(PatchError::TargetNotDirectory(target).into());
        }
        let staging = staging_area(options.staging_dir.as_deref())?;
        let bundle_dir = staging.path().join("bundle");
        let old_dir = staging.path().join("old");

        info!("正在解压补丁包...");
        let bundle_container = ContainerFactory::open(bundle)?;
        expand_all(bundle_container.shared(), &bundle_dir)?;
        let manifest = Manifest::load(&bundle_dir)?;
        let listing = bundle_container.list_items()?;

        let anchor = resolve_anchor(bundle, options.root_patch_dir.as_deref())?;
        if !listing.get(Some(anchor.as_str())).is_some_and(MetadataNode::is_dir) {
            return Err(PatchError::InvalidBundle {
                path: bundle.to_path_buf(),
                reason: format!("缺少目录 {}", anchor),
            }
            .into());
        }

        // 原地更新时目标就是旧版本，必须在写入任何文件之前先复制出来
        info!("正在解压 {}...", old.display());
        let old_container = ContainerFactory::open(old)?;
        expand_all(old_container.shared(), &old_dir)?;
        drop(old_container);

        fs::create_dir_all(&target).with_context(|| format!("无法创建目录: {:?}", target))?;

        info!("正在应用补丁...");
        let mut deleted = manifest.deleted.clone();
        deleted.sort_unstable_by(|a, b| b.cmp(a));
        for item in &deleted {
            if !matches!(normalize_key(Path::new(item)), Some(Some(_))) {
                warn!("跳过非法的删除路径: {}", item);
                continue;
            }
            if remove_item(&target, item)? {
                info!("  - {}", item);
            }
        }

        let prefix = format!("{}/", anchor);
        let privileged = is_privileged();
        let verify = anchor == BUNDLE_ROOT;
        let mut dirs: Vec<(&str, PathBuf, &MetadataNode)> = Vec::new();

        for (key, node) in listing.members() {
            let Some(relative) = key.strip_prefix(&prefix) else {
                continue;
            };
            let dest = target.join(relative);

            match &node.kind {
                NodeKind::Dir => {
                    clear_path(&dest)?;
                    fs::create_dir_all(&dest)
                        .with_context(|| format!("无法创建目录: {:?}", dest))?;
                    dirs.push((relative, dest, node));
                }
                NodeKind::Symlink(link) => {
                    create_symlink(link, &dest)?;
                    restore_attributes(&dest, node, privileged)?;
                    info!("  + {}", relative);
                }
                NodeKind::File => {
                    let fragment = bundle_dir.join(key);
                    let source = old_dir.join(relative);
                    let source = fs::symlink_metadata(&source)
                        .is_ok_and(|metadata| metadata.is_file())
                        .then_some(source);

                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    clear_path(&dest)?;
                    self.delta
                        .apply(source.as_deref(), &fragment, &dest)
                        .with_context(|| format!("无法还原文件: {}", relative))?;
                    restore_attributes(&dest, node, privileged)?;

                    if verify {
                        manifest.verify(relative, &dest)?;
                    }
                    let marker = if source.is_some() { "*" } else { "+" };
                    info!("  {} {}", marker, relative);
                }
            }
        }

        // 目录属性最后还原，由深到浅
        dirs.sort_unstable_by(|a, b| b.0.cmp(a.0));
        for (_, dir, node) in &dirs {
            restore_attributes(dir, node, privileged)?;
        }

        drop(bundle_container);
        remove_staging(staging)?;

        info!("补丁应用完成!");
        Ok(())
    }
}

/// 删除 `root` 下的 `item`
///
/// 文件与符号链接直接删除；目录只在为空时删除，非空目录保留。返回是否删除了内容。
pub fn remove_item(root: &Path, item: &str) -> Result<bool> {
    let path = root.join(item);
    let metadata = match fs::symlink_metadata(&path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err).with_context(|| format!("无法读取: {:?}", path)),
    };

    if !metadata.is_dir() {
        fs::remove_file(&path).with_context(|| format!("无法删除: {:?}", path))?;
        return Ok(true);
    }

    match fs::remove_dir(&path) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::DirectoryNotEmpty => {
            debug!("目录非空，保留: {:?}", path);
            Ok(false)
        }
        Err(err) => Err(err).with_context(|| format!("无法删除目录: {:?}", path)),
    }
}

fn resolve_anchor(bundle: &Path, root_patch_dir: Option<&str>) -> Result<String> {
    let Some(dir) = root_patch_dir else {
        return Ok(BUNDLE_ROOT.to_string());
    };
    match normalize_key(Path::new(dir)) {
        Some(Some(anchor)) => Ok(anchor),
        _ => Err(PatchError::InvalidBundle {
            path: bundle.to_path_buf(),
            reason: format!("非法的根目录: {}", dir),
        }
        .into()),
    }
}
