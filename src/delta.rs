//! 外部二进制差分工具
//!
//! 字节级差分算法不在本工具内实现，由 [`DeltaTool`] 交给外部程序完成。

use anyhow::{Context, Result};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::debug;

use crate::error::PatchError;

pub trait DeltaTool: Send + Sync {
    /// 生成由 `old` (缺省时视为空文件) 到 `new` 的差分片段，写入 `out`
    fn diff(&self, old: Option<&Path>, new: &Path, out: &Path) -> Result<()>;

    /// 将差分片段作用于 `old`，还原出的文件写入 `out`
    fn apply(&self, old: Option<&Path>, fragment: &Path, out: &Path) -> Result<()>;
}

/// 调用 xdelta3 命令行
#[derive(Debug, Clone)]
pub struct Xdelta3 {
    program: PathBuf,
}

impl Default for Xdelta3 {
    fn default() -> Self {
        Self::new()
    }
}

impl Xdelta3 {
    pub fn new() -> Self {
        Self::with_program("xdelta3")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// `-f -e [-s OLD] NEW OUT`
    pub fn diff_args(old: Option<&Path>, new: &Path, out: &Path) -> Vec<OsString> {
        Self::args("-e", old, new, out)
    }

    /// `-f -d [-s OLD] FRAGMENT OUT`
    pub fn apply_args(old: Option<&Path>, fragment: &Path, out: &Path) -> Vec<OsString> {
        Self::args("-d", old, fragment, out)
    }

    fn args(mode: &str, source: Option<&Path>, input: &Path, out: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-f".into(), mode.into()];
        if let Some(source) = source {
            args.push("-s".into());
            args.push(source.into());
        }
        args.push(input.into());
        args.push(out.into());
        args
    }

    fn run(&self, args: Vec<OsString>) -> Result<()> {
        let command = std::iter::once(self.program.as_os_str())
            .chain(args.iter().map(OsString::as_os_str))
            .map(|part| part.to_string_lossy())
            .collect::<Vec<_>>()
            .join(" ");
        debug!("执行: {}", command);

        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .with_context(|| format!("无法启动差分工具: {:?}", self.program))?;

        if !output.status.success() {
            let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
            captured.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(PatchError::DeltaToolFailure {
                command,
                status: output.status.to_string(),
                output: captured,
            }
            .into());
        }
        Ok(())
    }
}

impl DeltaTool for Xdelta3 {
    fn diff(&self, old: Option<&Path>, new: &Path, out: &Path) -> Result<()> {
        self.run(Self::diff_args(old, new, out))
    }

    fn apply(&self, old: Option<&Path>, fragment: &Path, out: &Path) -> Result<()> {
        self.run(Self::apply_args(old, fragment, out))
    }
}
