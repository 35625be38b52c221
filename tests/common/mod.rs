#![allow(dead_code)]

use anyhow::Result;
use dir_patcher::delta::DeltaTool;
use dir_patcher::patch::file_checksum;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use walkdir::WalkDir;

pub fn write_file(root: &Path, relative: &str, contents: &[u8]) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, contents).unwrap();
    path
}

pub fn symlink(root: &Path, relative: &str, target: &str) -> PathBuf {
    let path = root.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    std::os::unix::fs::symlink(target, &path).unwrap();
    path
}

/// 目录树中一项的可比较快照
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub hash: Option<String>,
    pub link_target: Option<PathBuf>,
    pub is_dir: bool,
    /// 符号链接的权限位没有意义，记为 0
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// 以相对路径为键扫描 `dir` 下的所有成员，不跟随符号链接
pub fn scan(dir: &Path) -> HashMap<PathBuf, TreeEntry> {
    let mut entries = HashMap::new();
    for entry in WalkDir::new(dir).min_depth(1).follow_links(false) {
        let entry = entry.unwrap();
        let metadata = entry.path().symlink_metadata().unwrap();
        let file_type = metadata.file_type();
        let relative = entry.path().strip_prefix(dir).unwrap().to_path_buf();

        let snapshot = TreeEntry {
            hash: file_type
                .is_file()
                .then(|| file_checksum(entry.path()).unwrap()),
            link_target: file_type
                .is_symlink()
                .then(|| fs::read_link(entry.path()).unwrap()),
            is_dir: file_type.is_dir(),
            mode: if file_type.is_symlink() {
                0
            } else {
                metadata.mode() & 0o7777
            },
            uid: metadata.uid(),
            gid: metadata.gid(),
        };
        entries.insert(relative, snapshot);
    }
    entries
}

pub fn set_mode(path: &Path, mode: u32) {
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

/// 恢复目录的写权限，使 TempDir 可以清理只读目录
pub fn unlock(root: &Path) {
    dir_patcher::utils::make_tree_writable(root).unwrap();
}

/// 片段直接保存新文件全文的差分工具，测试中替代 xdelta3
#[derive(Default)]
pub struct FullCopy {
    pub diffs: Mutex<Vec<(Option<PathBuf>, PathBuf)>>,
    pub applies: Mutex<Vec<Option<PathBuf>>>,
}

impl DeltaTool for FullCopy {
    fn diff(&self, old: Option<&Path>, new: &Path, out: &Path) -> Result<()> {
        if let Some(old) = old {
            assert!(old.is_file(), "old side must be a staged regular file");
        }
        fs::copy(new, out)?;
        self.diffs
            .lock()
            .unwrap()
            .push((old.map(Path::to_path_buf), new.to_path_buf()));
        Ok(())
    }

    fn apply(&self, old: Option<&Path>, fragment: &Path, out: &Path) -> Result<()> {
        fs::copy(fragment, out)?;
        self.applies
            .lock()
            .unwrap()
            .push(old.map(Path::to_path_buf));
        Ok(())
    }
}

/// 总是失败的差分工具
pub struct Broken;

impl DeltaTool for Broken {
    fn diff(&self, _old: Option<&Path>, _new: &Path, _out: &Path) -> Result<()> {
        anyhow::bail!("delta tool exploded")
    }

    fn apply(&self, _old: Option<&Path>, _fragment: &Path, _out: &Path) -> Result<()> {
        anyhow::bail!("delta tool exploded")
    }
}
