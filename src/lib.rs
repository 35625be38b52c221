//! # Dir Patcher
//!
//! 目录树二进制增量补丁工具库
//!
//! ## 功能
//!
//! - 新旧版本可以是普通目录、tar (含 tar.gz) 或 zip，统一通过 [`archive::Container`] 访问
//! - 对比两个版本，将每个文件的二进制差分打包成一个补丁包
//! - 将补丁包应用到旧版本，还原出新版本的文件、目录、符号链接及其属性
//! - 支持并发读取的容器按顶层条目并行解包
//!
//! ## 使用示例
//!
//! ```no_run
//! use dir_patcher::delta::Xdelta3;
//! use dir_patcher::patch::{ApplyOptions, DiffOptions, TreeSynchronizer};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let synchronizer = TreeSynchronizer::new(Arc::new(Xdelta3::new()));
//!
//! // 生成补丁包
//! synchronizer.diff(
//!     Path::new("old_version.tar.gz"),
//!     Path::new("new_version"),
//!     Path::new("patch.tgz"),
//!     &DiffOptions::default(),
//! ).unwrap();
//!
//! // 应用补丁包
//! synchronizer.apply(
//!     Path::new("old_version.tar.gz"),
//!     Path::new("patch.tgz"),
//!     &ApplyOptions {
//!         target_dir: Some("new_version".into()),
//!         ..ApplyOptions::default()
//!     },
//! ).unwrap();
//! ```

pub mod archive;
pub mod cli;
pub mod config;
pub mod delta;
pub mod error;
pub mod patch;
pub mod runner;
pub mod utils;

// 重新导出常用类型
pub use archive::{Container, ContainerFactory, MetadataNode};
pub use config::{Action, Config};
pub use delta::{DeltaTool, Xdelta3};
pub use error::PatchError;
pub use patch::{ApplyOptions, DiffOptions, Manifest, TreeSynchronizer};
pub use runner::ParallelTaskRunner;
