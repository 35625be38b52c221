use ::tar::{Archive, Builder, EntryType, Header};
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

use super::node::{file_name_of, is_within};
use super::{
    Attributes, Container, ContainerKind, FsContainer, Listing, MemberData, MetadataNode,
    NodeKind, normalize_key,
};
use crate::error::PatchError;
use crate::utils::{clear_path, is_privileged, restore_attributes};

const BLOCK_SIZE: usize = 512;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// tar / tar.gz 归档
///
/// tar 解码器只能顺序读取，不支持并发，所有读取都经过 `handle` 上的互斥锁。
pub struct TarContainer {
    path: PathBuf,
    compressed: bool,
    handle: Mutex<Option<File>>,
    index: OnceLock<Listing>,
}

impl TarContainer {
    /// 检查文件头：gzip 流解压后的首个块或未压缩文件的首个块必须带有 ustar 标记，
    /// 或者全为零 (空归档只有结束块)
    pub fn can_open(path: &Path) -> bool {
        detect_compression(path).is_some()
    }

    pub fn open(path: &Path, create_mode: bool) -> Result<Self> {
        let (handle, compressed) = if create_mode {
            (None, !is_plain_tar_name(path))
        } else {
            let compressed =
                detect_compression(path).ok_or_else(|| PatchError::UnsupportedArchive(path.to_path_buf()))?;
            let file = File::open(path).with_context(|| format!("无法打开归档: {:?}", path))?;
            (Some(file), compressed)
        };

        Ok(Self {
            path: path.to_path_buf(),
            compressed,
            handle: Mutex::new(handle),
            index: OnceLock::new(),
        })
    }

    fn reader<'a>(&self, file: &'a mut File) -> Result<Box<dyn Read + 'a>> {
        file.seek(SeekFrom::Start(0))?;
        let buffered = BufReader::new(file);
        Ok(if self.compressed {
            Box::new(GzDecoder::new(buffered))
        } else {
            Box::new(buffered)
        })
    }

    fn build_listing(&self) -> Result<Listing> {
        let mut guard = self.handle.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| PatchError::ResourceClosed(self.path.clone()))?;
        let mut archive = Archive::new(self.reader(file)?);

        let mut listing = Listing::new(MetadataNode::root(Attributes::with_permissions(0o755)));
        for entry in archive
            .entries()
            .with_context(|| format!("无法读取归档: {:?}", self.path))?
        {
            let entry = entry?;
            let path = entry.path()?.into_owned();
            let key = match normalize_key(&path) {
                Some(Some(key)) => key,
                Some(None) => continue,
                None => {
                    warn!("跳过越界路径: {}", path.display());
                    continue;
                }
            };

            let header = entry.header();
            let attrs = header_attributes(header)?;
            let data = MemberData::Tar {
                position: entry.raw_header_position(),
            };
            let name = file_name_of(&key).to_string();
            let node = match header.entry_type() {
                EntryType::Directory => MetadataNode::dir(Some(name), data, attrs),
                EntryType::Symlink => {
                    let target = entry
                        .link_name()?
                        .with_context(|| format!("符号链接缺少目标: {}", key))?
                        .into_owned();
                    MetadataNode::file(name, data, attrs, Some(target))
                }
                EntryType::Regular | EntryType::Continuous | EntryType::Link => {
                    MetadataNode::file(name, data, attrs, None)
                }
                other => {
                    debug!("跳过不支持的成员类型 {:?}: {}", other, key);
                    continue;
                }
            };
            listing.insert(key, node);
        }

        listing.synthesize_parents();
        Ok(listing)
    }
}

impl Container for TarContainer {
    fn kind(&self) -> ContainerKind {
        ContainerKind::Tar
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
        let node = listing
            .get(member)
            .ok_or_else(|| PatchError::MissingMember {
                container: self.path.clone(),
                member: member.unwrap_or_default().to_string(),
            })?;
        fs::create_dir_all(dest_dir)?;

        let mut guard = self.handle.lock();
        let file = guard
            .as_mut()
            .ok_or_else(|| PatchError::ResourceClosed(self.path.clone()))?;
        let privileged = is_privileged();
        let mut archive = Archive::new(self.reader(file)?);
        archive.set_preserve_permissions(true);
        archive.set_preserve_mtime(true);
        archive.set_preserve_ownerships(privileged);
        archive.set_overwrite(true);

        let mut dirs = Vec::new();
        for entry in archive.entries()? {
            let mut entry = entry?;
            let Some(Some(key)) = normalize_key(&entry.path()?) else {
                continue;
            };
            if !is_within(&key, member) {
                continue;
            }

            let target = dest_dir.join(&key);
            // 目录只创建，权限等子项写完后再设置，否则只读目录会挡住其中的文件
            if entry.header().entry_type() == EntryType::Directory {
                fs::create_dir_all(&target)
                    .with_context(|| format!("无法创建目录: {:?}", target))?;
                if let Some(dir) = listing.get(Some(key.as_str())) {
                    dirs.push((target, dir));
                }
                continue;
            }

            clear_path(&target)?;
            entry
                .unpack_in(dest_dir)
                .with_context(|| format!("无法解包 {} 到 {:?}", key, dest_dir))?;
        }

        // 推导出的目录在归档里没有对应成员
        if let (Some(member), true) = (member, node.is_dir()) {
            fs::create_dir_all(dest_dir.join(member))?;
        }

        for (dir, node) in dirs.iter().rev() {
            restore_attributes(dir, node, privileged)?;
        }
        Ok(())
    }

    fn create(&self, source_dir: &Path) -> Result<()> {
        let source = FsContainer::open(source_dir, false)?;
        let mut writer = TarWriter::create(&self.path, self.compressed)?;
        for (key, node) in source.list_items()?.members() {
            writer.append_node(key, node, Some(&source_dir.join(key)))?;
        }
        writer.finish()
    }

    fn close(&self) {
        self.handle.lock().take();
    }

    fn concurrent_read_safe(&self) -> bool {
        false
    }
}

/// 按节点元数据写入 GNU 格式成员的 tar 写入器
pub(crate) struct TarWriter {
    builder: Builder<Sink>,
}

impl TarWriter {
    pub(crate) fn create(path: &Path, compressed: bool) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = BufWriter::new(
            File::create(path).with_context(|| format!("无法创建归档: {:?}", path))?,
        );
        let sink = if compressed {
            Sink::Gzip(GzEncoder::new(file, Compression::default()))
        } else {
            Sink::Plain(file)
        };
        Ok(Self {
            builder: Builder::new(sink),
        })
    }

    /// 以 `name` 写入一个成员；普通文件的内容取自 `content`
    pub(crate) fn append_node(
        &mut self,
        name: &str,
        node: &MetadataNode,
        content: Option<&Path>,
    ) -> Result<()> {
        let mut header = Header::new_gnu();
        set_header_attributes(&mut header, &node.attrs)?;

        match &node.kind {
            NodeKind::Dir => {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                self.builder
                    .append_data(&mut header, name, io::empty())?;
            }
            NodeKind::Symlink(target) => {
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                self.builder.append_link(&mut header, name, target)?;
            }
            NodeKind::File => {
                let content =
                    content.with_context(|| format!("普通文件成员缺少内容来源: {}", name))?;
                let file =
                    File::open(content).with_context(|| format!("无法打开文件: {:?}", content))?;
                header.set_entry_type(EntryType::Regular);
                header.set_size(file.metadata()?.len());
                self.builder.append_data(&mut header, name, file)?;
            }
        }
        Ok(())
    }

    /// 写入一段原样保存的数据
    pub(crate) fn append_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_mode(0o644);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_size(bytes.len() as u64);
        self.builder.append_data(&mut header, name, bytes)?;
        Ok(())
    }

    pub(crate) fn finish(self) -> Result<()> {
        self.builder.into_inner()?.finish()?;
        Ok(())
    }
}

enum Sink {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

impl Sink {
    fn finish(self) -> io::Result<()> {
        match self {
            Sink::Plain(mut file) => file.flush(),
            Sink::Gzip(encoder) => encoder.finish()?.flush(),
        }
    }
}

impl Write for Sink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::Plain(file) => file.write(buf),
            Sink::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::Plain(file) => file.flush(),
            Sink::Gzip(encoder) => encoder.flush(),
        }
    }
}

fn header_attributes(header: &Header) -> Result<Attributes> {
    let name_of = |name: Result<Option<&str>, _>| {
        name.ok()
            .flatten()
            .filter(|name: &&str| !name.is_empty())
            .map(str::to_string)
    };

    Ok(Attributes {
        permissions: header.mode()? & 0o7777,
        owner_name: name_of(header.username()),
        owner_id: header.uid()? as u32,
        group_name: name_of(header.groupname()),
        group_id: header.gid()? as u32,
        mtime: header.mtime()?,
    })
}

fn set_header_attributes(header: &mut Header, attrs: &Attributes) -> Result<()> {
    header.set_mode(attrs.permissions);
    header.set_uid(attrs.owner_id as u64);
    header.set_gid(attrs.group_id as u64);
    header.set_mtime(attrs.mtime);
    if let Some(owner) = &attrs.owner_name {
        header.set_username(owner)?;
    }
    if let Some(group) = &attrs.group_name {
        header.set_groupname(group)?;
    }
    Ok(())
}

fn is_plain_tar_name(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "tar")
}

/// 返回 `Some(是否 gzip 压缩)`
fn detect_compression(path: &Path) -> Option<bool> {
    let mut file = File::open(path).ok()?;
    if !file.metadata().ok()?.is_file() {
        return None;
    }

    let mut magic = [0u8; 2];
    file.read_exact(&mut magic).ok()?;
    file.seek(SeekFrom::Start(0)).ok()?;

    if magic == GZIP_MAGIC {
        is_tar_block(GzDecoder::new(file)).then_some(true)
    } else {
        is_tar_block(file).then_some(false)
    }
}

/// 空归档只有全零的结束块
fn is_tar_block(mut reader: impl Read) -> bool {
    let mut block = [0u8; BLOCK_SIZE];
    reader.read_exact(&mut block).is_ok()
        && (&block[257..262] == b"ustar" || block.iter().all(|&byte| byte == 0))
}
