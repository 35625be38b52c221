use anyhow::Result;
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use super::{Container, FsContainer, TarContainer, ZipContainer};
use crate::error::PatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
    Tar,
    Zip,
    Filesystem,
}

impl ContainerKind {
    /// 打开已有路径时的探测顺序
    pub const DETECTION_ORDER: [ContainerKind; 3] =
        [ContainerKind::Tar, ContainerKind::Zip, ContainerKind::Filesystem];

    pub fn can_open(self, path: &Path) -> bool {
        match self {
            ContainerKind::Tar => TarContainer::can_open(path),
            ContainerKind::Zip => ZipContainer::can_open(path),
            ContainerKind::Filesystem => FsContainer::can_open(path),
        }
    }

    pub fn open(self, path: &Path, create_mode: bool) -> Result<Arc<dyn Container>> {
        Ok(match self {
            ContainerKind::Tar => Arc::new(TarContainer::open(path, create_mode)?),
            ContainerKind::Zip => Arc::new(ZipContainer::open(path, create_mode)?),
            ContainerKind::Filesystem => Arc::new(FsContainer::open(path, create_mode)?),
        })
    }

    /// 按扩展名决定新建容器的格式
    pub fn for_new_path(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.ends_with(".zip") {
            ContainerKind::Zip
        } else if name.ends_with(".tar") || name.ends_with(".tgz") || name.ends_with(".tar.gz") {
            ContainerKind::Tar
        } else {
            ContainerKind::Filesystem
        }
    }
}

pub struct ContainerFactory;

impl ContainerFactory {
    /// 依次用 tar、zip、目录三种实现探测 `path`，返回第一个能打开的容器
    pub fn open(path: &Path) -> Result<ScopedContainer> {
        for kind in ContainerKind::DETECTION_ORDER {
            if kind.can_open(path) {
                debug!("{:?} 作为 {:?} 打开", path, kind);
                return Ok(ScopedContainer::new(kind.open(path, false)?));
            }
        }
        Err(PatchError::UnsupportedArchive(path.to_path_buf()).into())
    }

    /// 以写入模式准备一个新容器
    pub fn create(path: &Path) -> Result<ScopedContainer> {
        let kind = ContainerKind::for_new_path(path);
        debug!("{:?} 作为 {:?} 创建", path, kind);
        Ok(ScopedContainer::new(kind.open(path, true)?))
    }
}

/// 离开作用域时自动关闭的容器
pub struct ScopedContainer {
    inner: Arc<dyn Container>,
}

impl ScopedContainer {
    pub fn new(inner: Arc<dyn Container>) -> Self {
        Self { inner }
    }

    /// 供并行任务持有的共享句柄
    pub fn shared(&self) -> &Arc<dyn Container> {
        &self.inner
    }
}

impl Deref for ScopedContainer {
    type Target = dyn Container;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl Drop for ScopedContainer {
    fn drop(&mut self) {
        self.inner.close();
    }
}
