use anyhow::{Context, Result};
use filetime::FileTime;
use std::fs::{self, Permissions};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::archive::MetadataNode;

/// 删除路径上已有的文件或符号链接，为重新写入腾出位置；目录保留
pub fn clear_path(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(metadata) if !metadata.is_dir() => {
            fs::remove_file(path).with_context(|| format!("无法删除: {:?}", path))
        }
        _ => Ok(()),
    }
}

/// 在 `path` 处创建指向 `target` 的符号链接，覆盖已有文件
pub fn create_symlink(target: &Path, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    clear_path(path)?;
    std::os::unix::fs::symlink(target, path)
        .with_context(|| format!("无法创建符号链接: {:?} -> {:?}", path, target))
}

/// 按节点元数据还原权限、修改时间，特权模式下还原属主
pub fn restore_attributes(path: &Path, node: &MetadataNode, privileged: bool) -> Result<()> {
    let attrs = &node.attrs;

    // chown 会清除 setuid/setgid 位，必须先于 chmod
    if privileged {
        std::os::unix::fs::lchown(path, Some(attrs.owner_id), Some(attrs.group_id))
            .with_context(|| format!("无法修改属主: {:?}", path))?;
    }

    if !node.is_link() {
        fs::set_permissions(path, Permissions::from_mode(attrs.permissions))
            .with_context(|| format!("无法修改权限: {:?}", path))?;
    }

    let mtime = FileTime::from_unix_time(attrs.mtime as i64, 0);
    filetime::set_symlink_file_times(path, mtime, mtime)
        .with_context(|| format!("无法修改时间戳: {:?}", path))?;

    Ok(())
}

pub fn effective_uid() -> u32 {
    // SAFETY: geteuid 没有前置条件且不会失败
    unsafe { libc::geteuid() }
}

pub fn is_privileged() -> bool {
    effective_uid() == 0
}

/// 给 `root` 下所有目录加上属主读写执行权限，使其中的内容可以被删除或覆盖
pub fn make_tree_writable(root: &Path) -> Result<()> {
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.with_context(|| format!("无法遍历目录: {:?}", root))?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let mode = entry.metadata()?.mode() & 0o7777;
        if mode & 0o700 != 0o700 {
            fs::set_permissions(entry.path(), Permissions::from_mode(mode | 0o700))
                .with_context(|| format!("无法修改权限: {:?}", entry.path()))?;
        }
    }
    Ok(())
}

/// 删除临时目录；解包出的只读目录会挡住删除，先恢复写权限
pub fn remove_staging(staging: TempDir) -> Result<()> {
    make_tree_writable(staging.path())?;
    staging.close().context("无法删除临时目录")
}
