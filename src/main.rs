use anyhow::{Result, bail};
use clap::Parser;
use std::sync::Arc;
use tracing::Level;

use dir_patcher::cli::{Cli, Commands};
use dir_patcher::config::Config;
use dir_patcher::delta::Xdelta3;
use dir_patcher::patch::TreeSynchronizer;

fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_max_level(if cli.debug { Level::DEBUG } else { Level::INFO })
        .with_target(false)
        .init();

    match &cli.command {
        Commands::Diff {
            old_version,
            new_version,
            metadata,
            ..
        } => {
            if !old_version.exists() {
                bail!("旧版本不存在: {:?}", old_version);
            }
            if !new_version.exists() {
                bail!("新版本不存在: {:?}", new_version);
            }
            if let Some(metadata) = metadata
                && !metadata.is_file()
            {
                bail!("元数据文件不存在: {:?}", metadata);
            }
        }
        Commands::Apply {
            old_dir,
            patch_bundle,
            ..
        } => {
            if !old_dir.exists() {
                bail!("旧版本不存在: {:?}", old_dir);
            }
            if !patch_bundle.exists() {
                bail!("补丁包不存在: {:?}", patch_bundle);
            }
        }
    }

    let config = Config::from(cli);
    let synchronizer = TreeSynchronizer::new(Arc::new(Xdelta3::with_program(
        config.delta_program.clone(),
    )));
    synchronizer.run(&config)
}
