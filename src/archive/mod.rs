//! 统一的容器抽象：tar 归档、zip 归档与普通目录树
//!
//! 每种容器都提供格式探测、带缓存的索引、成员解包、从目录创建和关闭。
//! 具体实现由 [`ContainerFactory`] 在打开时一次性选定，调用方只面对
//! [`Container`] trait。

mod factory;
mod fs;
mod node;
mod tar;
mod zip;

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;

use crate::runner::ParallelTaskRunner;

pub use self::factory::{ContainerFactory, ContainerKind, ScopedContainer};
pub use self::fs::FsContainer;
pub use self::node::{Attributes, Listing, MemberData, MetadataNode, NodeKind, normalize_key};
pub use self::tar::TarContainer;
pub(crate) use self::tar::TarWriter;
pub use self::zip::ZipContainer;

pub trait Container: Send + Sync {
    fn kind(&self) -> ContainerKind;

    fn path(&self) -> &Path;

    /// 首次调用时遍历底层存储建立索引，之后始终返回同一份缓存
    fn list_items(&self) -> Result<&Listing>;

    /// 将单个成员 (目录成员连同其子树) 解包到 `dest_dir`；`None` 表示整棵树
    fn expand(&self, member: Option<&str>, dest_dir: &Path) -> Result<()>;

    /// 用 `source_dir` 下的全部文件、目录与符号链接填充容器
    fn create(&self, source_dir: &Path) -> Result<()>;

    /// 释放底层资源，可重复调用
    fn close(&self);

    /// 同一个打开的容器能否被多个线程同时 `expand`
    fn concurrent_read_safe(&self) -> bool;
}

/// 将整个容器解包到 `dest_dir`
///
/// 容器支持并发读取时，按根目录下的直接子项分发到并行任务中。
pub fn expand_all(container: &Arc<dyn Container>, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir)?;

    if !container.concurrent_read_safe() {
        return container.expand(None, dest_dir);
    }

    let listing = container.list_items()?;
    let mut runner = ParallelTaskRunner::new();
    for key in listing.top_level() {
        let container = Arc::clone(container);
        let key = key.to_string();
        let dest_dir = dest_dir.to_path_buf();
        runner.add_task(move || container.expand(Some(&key), &dest_dir))?;
    }
    runner.join_all()
}
