use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// 目录树二进制增量补丁工具，支持目录、tar 与 zip
#[derive(Parser)]
#[command(name = "dir-patcher", version)]
#[command(about = "目录树二进制增量补丁工具", long_about = None)]
pub struct Cli {
    /// 输出调试日志
    #[arg(long, global = true)]
    pub debug: bool,

    /// 临时解包目录的父目录，默认使用系统临时目录
    #[arg(long, global = true, value_name = "DIR")]
    pub staging_dir: Option<PathBuf>,

    /// xdelta3 可执行文件
    #[arg(long, global = true, value_name = "PROGRAM", default_value = "xdelta3")]
    pub xdelta3: PathBuf,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// 对比新旧两个版本，生成补丁包
    Diff {
        /// 旧版本 (目录、tar 或 zip)
        old_version: PathBuf,
        /// 新版本 (目录、tar 或 zip)
        new_version: PathBuf,
        /// 输出补丁包路径
        patch_bundle: PathBuf,
        /// 原样打入补丁包的元数据文件
        #[arg(long, value_name = "FILE")]
        metadata: Option<PathBuf>,
    },
    /// 将补丁包应用到旧版本
    Apply {
        /// 旧版本 (目录、tar 或 zip)
        old_dir: PathBuf,
        /// 补丁包路径
        patch_bundle: PathBuf,
        /// 输出目录，缺省时原地更新旧版本目录
        target_dir: Option<PathBuf>,
        /// 只应用补丁包中该目录下的成员
        #[arg(short = 'd', long, value_name = "ROOT")]
        root_patch_dir: Option<String>,
        /// 跳过 root 权限检查
        #[arg(long)]
        ignore_euid: bool,
    },
}
