use std::path::PathBuf;

use crate::cli::{Cli, Commands};
use crate::patch::{ApplyOptions, DiffOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Diff,
    Apply,
}

/// 一次运行所需的全部参数
///
/// `Diff` 使用 `old_path`、`new_path`、`bundle_path` 与 `metadata_path`；
/// `Apply` 使用 `old_path`、`bundle_path`、`target_dir`、`root_patch_dir`
/// 与 `ignore_euid`。
#[derive(Debug, Clone)]
pub struct Config {
    pub action: Action,
    pub old_path: PathBuf,
    pub new_path: Option<PathBuf>,
    pub bundle_path: PathBuf,
    pub metadata_path: Option<PathBuf>,
    pub staging_dir: Option<PathBuf>,
    pub ignore_euid: bool,
    pub root_patch_dir: Option<String>,
    pub target_dir: Option<PathBuf>,
    pub debug: bool,
    pub delta_program: PathBuf,
}

impl Config {
    pub fn diff_options(&self) -> DiffOptions {
        DiffOptions {
            metadata_path: self.metadata_path.clone(),
            staging_dir: self.staging_dir.clone(),
        }
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            target_dir: Some(
                self.target_dir
                    .clone()
                    .unwrap_or_else(|| self.old_path.clone()),
            ),
            root_patch_dir: self.root_patch_dir.clone(),
            staging_dir: self.staging_dir.clone(),
            ignore_euid: self.ignore_euid,
        }
    }
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        let base = |action, old_path, bundle_path| Config {
            action,
            old_path,
            new_path: None,
            bundle_path,
            metadata_path: None,
            staging_dir: cli.staging_dir.clone(),
            ignore_euid: false,
            root_patch_dir: None,
            target_dir: None,
            debug: cli.debug,
            delta_program: cli.xdelta3.clone(),
        };

        match cli.command {
            Commands::Diff {
                old_version,
                new_version,
                patch_bundle,
                metadata,
            } => Config {
                new_path: Some(new_version),
                metadata_path: metadata,
                ..base(Action::Diff, old_version, patch_bundle)
            },
            Commands::Apply {
                old_dir,
                patch_bundle,
                target_dir,
                root_patch_dir,
                ignore_euid,
            } => Config {
                target_dir,
                root_patch_dir,
                ignore_euid,
                ..base(Action::Apply, old_dir, patch_bundle)
            },
        }
    }
}
