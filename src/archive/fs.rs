use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use walkdir::WalkDir;

use super::node::is_within;
use super::{Attributes, Container, ContainerKind, Listing, MemberData, MetadataNode, NodeKind};
use crate::error::PatchError;
use crate::utils::{clear_path, create_symlink, is_privileged, restore_attributes};

/// 普通目录树
pub struct FsContainer {
    path: PathBuf,
    closed: AtomicBool,
    index: OnceLock<Listing>,
}

impl FsContainer {
    pub fn can_open(path: &Path) -> bool {
        path.is_dir()
    }

    pub fn open(path: &Path, create_mode: bool) -> Result<Self> {
        if create_mode {
            fs::create_dir_all(path).with_context(|| format!("无法创建目录: {:?}", path))?;
        } else if !path.is_dir() {
            return Err(PatchError::UnsupportedArchive(path.to_path_buf()).into());
        }

        Ok(Self {
            path: path.to_path_buf(),
            closed: AtomicBool::new(false),
            index: OnceLock::new(),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(PatchError::ResourceClosed(self.path.clone()).into());
        }
        Ok(())
    }

    fn build_listing(&self) -> Result<Listing> {
        let root = fs::symlink_metadata(&self.path)
            .with_context(|| format!("无法读取目录: {:?}", self.path))?;
        let mut listing = Listing::new(MetadataNode::root(attributes_of(&root)));

        let walker = WalkDir::new(&self.path)
            .min_depth(1)
            .follow_links(false)
            .sort_by_file_name();
        for entry in walker {
            let entry = entry.with_context(|| format!("无法遍历目录: {:?}", self.path))?;
            let relative = entry.path().strip_prefix(&self.path)?;
            let key = relative
                .components()
                .map(|part| part.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let name = entry.file_name().to_string_lossy().into_owned();

            let attrs = attributes_of(&entry.metadata()?);
            let data = MemberData::Fs {
                path: entry.path().to_path_buf(),
            };
            let file_type = entry.file_type();
            let node = if file_type.is_dir() {
                MetadataNode::dir(Some(name), data, attrs)
            } else if file_type.is_symlink() {
                let target = fs::read_link(entry.path())?;
                MetadataNode::file(name, data, attrs, Some(target))
            } else {
                MetadataNode::file(name, data, attrs, None)
            };
            listing.insert(key, node);
        }

        Ok(listing)
    }
}

impl Container for FsContainer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Filesystem
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn list_items(&self) -> Result<&Listing> {
        if let Some(listing) = self.index.get() {
            return Ok(listing);
        }
        self.ensure_open()?;
        let listing = self.build_listing()?;
        Ok(self.index.get_or_init(|| listing))
    }

    fn expand(&self, member: Option<&str>, dest_dir: &Path) -> Result<()> {
        self.ensure_open()?;
        let listing = self.list_items()?;
        if !listing.contains(member) {
            return Err(PatchError::MissingMember {
                container: self.path.clone(),
                member: member.unwrap_or_default().to_string(),
            }
            .into());
        }
        fs::create_dir_all(dest_dir)?;

        let privileged = is_privileged();
        let mut dirs = Vec::new();
        for (key, node) in listing.members().filter(|(key, _)| is_within(key, member)) {
            let target = dest_dir.join(key);
            match &node.kind {
                NodeKind::Dir => {
                    fs::create_dir_all(&target)?;
                    dirs.push((target, node));
                    continue;
                }
                NodeKind::Symlink(link) => create_symlink(link, &target)?,
                NodeKind::File => {
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    clear_path(&target)?;
                    fs::copy(self.path.join(key), &target)
                        .with_context(|| format!("无法复制 {} 到 {:?}", key, target))?;
                }
            }
            restore_attributes(&target, node, privileged)?;
        }

        // 子项写完后再设置目录权限，避免只读目录挡住后续写入
        for (dir, node) in dirs.iter().rev() {
            restore_attributes(dir, node, privileged)?;
        }
        Ok(())
    }

    fn create(&self, source_dir: &Path) -> Result<()> {
        self.ensure_open()?;
        FsContainer::open(source_dir, false)?.expand(None, &self.path)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn concurrent_read_safe(&self) -> bool {
        true
    }
}

fn attributes_of(metadata: &fs::Metadata) -> Attributes {
    Attributes {
        permissions: metadata.mode() & 0o7777,
        owner_name: None,
        owner_id: metadata.uid(),
        group_name: None,
        group_id: metadata.gid(),
        mtime: metadata.mtime().max(0) as u64,
    }
}
