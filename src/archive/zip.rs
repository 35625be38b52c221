use ::zip::write::FileOptions;
use ::zip::{CompressionMethod, ZipArchive, ZipWriter};
use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use filetime::FileTime;
use parking_lot::RwLock;
use std::fs::{self, File, Permissions};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use super::node::{file_name_of, is_within};
use super::{
    Attributes, Container, ContainerKind, FsContainer, Listing, MemberData, MetadataNode,
    NodeKind, normalize_key,
};
use crate::error::PatchError;
use crate::utils::{clear_path, create_symlink};

const LOCAL_HEADER_MAGIC: &[u8; 4] = b"PK\x03\x04";
const EMPTY_ARCHIVE_MAGIC: &[u8; 4] = b"PK\x05\x06";
const S_IFMT: u32 = 0o170000;
const S_IFLNK: u32 = 0o120000;

/// zip 归档
///
/// 中央目录在打开时解析一次；每次解包克隆一份归档句柄，底层用按偏移读取的
/// 共享文件描述符，因此多个线程可以同时解包。zip 只保存权限位，不保存属主。
pub struct ZipContainer {
    path: PathBuf,
    archive: RwLock<Option<ZipArchive<SharedReader>>>,
    index: OnceLock<Listing>,
}

impl ZipContainer {
    pub fn can_open(path: &Path) -> bool {
        let Ok(mut file) = File::open(path) else {
            return false;
        };
        let mut magic = [0u8; 4];
        file.metadata().is_ok_and(|metadata| metadata.is_file())
            && file.read_exact(&mut magic).is_ok()
            && (&magic == LOCAL_HEADER_MAGIC || &magic == EMPTY_ARCHIVE_MAGIC)
    }

    pub fn open(path: &Path, create_mode: bool) -> Result<Self> {
        let archive = if create_mode {
            None
        } else {
            let file = File::open(path).with_context(|| format!("无法打开归档: {:?}", path))?;
            let archive = ZipArchive::new(SharedReader::new(file))
                .map_err(|_| PatchError::UnsupportedArchive(path.to_path_buf()))?;
            Some(archive)
        };

        Ok(Self {
            path: path.to_path_buf(),
            archive: RwLock::new(archive),
            index: OnceLock::new(),
        })
    }

    fn archive(&self) -> Result<ZipArchive<SharedReader>> {
        self.archive
            .read()
            .clone()
            .ok_or_else(|| PatchError::ResourceClosed(self.path.clone()).into())
    }

    fn build_listing(&self) -> Result<Listing> {
        let mut archive = self.archive()?;
        let mut listing = Listing::new(MetadataNode::root(Attributes::with_permissions(0o755)));

        for index in 0..archive.len() {
            let mut file = archive.by_index(index)?;
            let Some(Some(key)) = file.enclosed_name().and_then(normalize_key) else {
                continue;
            };

            let mode = file.unix_mode();
            let is_dir = file.is_dir();
            let default_mode = if is_dir { 0o755 } else { 0o644 };
            let attrs = Attributes {
                permissions: mode.map_or(default_mode, |mode| mode & 0o7777),
                mtime: zip_mtime(file.last_modified()),
                ..Attributes::default()
            };
            let data = MemberData::Zip { index };
            let name = file_name_of(&key).to_string();

            let node = if is_dir {
                MetadataNode::dir(Some(name), data, attrs)
            } else if mode.is_some_and(is_symlink_mode) {
                let mut target = String::new();
                file.read_to_string(&mut target)?;
                MetadataNode::file(name, data, attrs, Some(PathBuf::from(target)))
            } else {
                MetadataNode::file(name, data, attrs, None)
            };
            listing.insert(key, node);
        }

        listing.synthesize_parents();
        Ok(listing)
    }
}

impl Container for ZipContainer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Zip
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn list_items(&self) -> Result<&Listing> {
        if let Some(listing) = self.index.get() {
            return Ok(listing);
        }
        let listing = self.build_listing()?;
        Ok(self.index.get_or_init(|| listing))
    }

    fn expand(&self, member: Option<&str>, dest_dir: &Path) -> Result<()> {
        let listing = self.list_items()?;
        if !listing.contains(member) {
            return Err(PatchError::MissingMember {
                container: self.path.clone(),
                member: member.unwrap_or_default().to_string(),
            }
            .into());
        }
        let mut archive = self.archive()?;
        fs::create_dir_all(dest_dir)?;

        let mut dirs = Vec::new();
        for (key, node) in listing.members().filter(|(key, _)| is_within(key, member)) {
            let target = dest_dir.join(key);
            match &node.kind {
                NodeKind::Dir => {
                    fs::create_dir_all(&target)?;
                    dirs.push((target, node));
                }
                NodeKind::Symlink(link) => create_symlink(link, &target)?,
                NodeKind::File => {
                    let MemberData::Zip { index } = node.data else {
                        bail!("zip 成员缺少中央目录序号: {}", key);
                    };
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    clear_path(&target)?;
                    let mut entry = archive.by_index(index)?;
                    let mut out = File::create(&target)
                        .with_context(|| format!("无法创建文件: {:?}", target))?;
                    io::copy(&mut entry, &mut out)?;
                    set_attributes(&target, &node.attrs)?;
                }
            }
        }

        // 子项写完后再设置目录权限
        for (dir, node) in dirs.iter().rev() {
            set_attributes(dir, &node.attrs)?;
        }
        Ok(())
    }

    fn create(&self, source_dir: &Path) -> Result<()> {
        let source = FsContainer::open(source_dir, false)?;
        let file = File::create(&self.path)
            .with_context(|| format!("无法创建归档: {:?}", self.path))?;
        let mut writer = ZipWriter::new(file);

        for (key, node) in source.list_items()?.members() {
            let options = FileOptions::default()
                .compression_method(CompressionMethod::Deflated)
                .unix_permissions(node.permissions());
            match &node.kind {
                NodeKind::Dir => writer.add_directory(key, options)?,
                NodeKind::Symlink(target) => {
                    writer.add_symlink(key, target.to_string_lossy(), options)?
                }
                NodeKind::File => {
                    writer.start_file(key, options)?;
                    let mut input = File::open(source_dir.join(key))?;
                    io::copy(&mut input, &mut writer)?;
                }
            }
        }

        writer.finish()?;
        Ok(())
    }

    fn close(&self) {
        self.archive.write().take();
    }

    fn concurrent_read_safe(&self) -> bool {
        true
    }
}

/// 共享文件描述符上的独立读取游标，克隆后互不影响
#[derive(Clone)]
struct SharedReader {
    file: Arc<File>,
    pos: u64,
}

impl SharedReader {
    fn new(file: File) -> Self {
        Self {
            file: Arc::new(file),
            pos: 0,
        }
    }
}

impl Read for SharedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.file.read_at(buf, self.pos)?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl Seek for SharedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let (base, offset) = match pos {
            SeekFrom::Start(pos) => {
                self.pos = pos;
                return Ok(pos);
            }
            SeekFrom::End(offset) => (self.file.metadata()?.len(), offset),
            SeekFrom::Current(offset) => (self.pos, offset),
        };
        self.pos = base.checked_add_signed(offset).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "seek 到文件起始位置之前")
        })?;
        Ok(self.pos)
    }
}

fn is_symlink_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

fn zip_mtime(time: ::zip::DateTime) -> u64 {
    NaiveDate::from_ymd_opt(time.year() as i32, time.month() as u32, time.day() as u32)
        .and_then(|date| {
            date.and_hms_opt(
                time.hour() as u32,
                time.minute() as u32,
                time.second() as u32,
            )
        })
        .map_or(0, |datetime| datetime.and_utc().timestamp().max(0) as u64)
}

fn set_attributes(path: &Path, attrs: &Attributes) -> Result<()> {
    fs::set_permissions(path, Permissions::from_mode(attrs.permissions))?;
    let mtime = FileTime::from_unix_time(attrs.mtime as i64, 0);
    filetime::set_file_mtime(path, mtime)?;
    Ok(())
}
