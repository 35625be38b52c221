use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

use super::{
    BUNDLE_ROOT, DiffOptions, MANIFEST_NAME, METADATA_NAME, Manifest, TreeSynchronizer,
    staging_area,
};
use crate::archive::{ContainerFactory, Listing, NodeKind, TarWriter, expand_all};
use crate::utils::remove_staging;

impl TreeSynchronizer {
    /// 对比 `old` 与 `new`，在 `bundle` 生成补丁包
    pub fn diff(&self, old: &Path, new: &Path, bundle: &Path, options: &DiffOptions) -> Result<()> {
        let old_container = ContainerFactory::open(old)?;
        let new_container = ContainerFactory::open(new)?;

        let staging = staging_area(options.staging_dir.as_deref())?;
        let old_dir = staging.path().join("old");
        let new_dir = staging.path().join("new");
        let fragment_dir = staging.path().join("fragments");

        info!("正在解压 {}...", old.display());
        expand_all(old_container.shared(), &old_dir)?;
        info!("正在解压 {}...", new.display());
        expand_all(new_container.shared(), &new_dir)?;

        let old_listing = old_container.list_items()?;
        let new_listing = new_container.list_items()?;

        info!("正在生成差分...");
        let mut manifest = Manifest::new();
        let mut writer = TarWriter::create(bundle, true)?;
        writer.append_node(BUNDLE_ROOT, new_listing.root(), None)?;

        for (key, node) in new_listing.members() {
            let name = format!("{}/{}", BUNDLE_ROOT, key);
            if node.kind != NodeKind::File {
                writer.append_node(&name, node, None)?;
                continue;
            }

            let new_file = new_dir.join(key);
            let old_file = has_regular_file(old_listing, key).then(|| old_dir.join(key));
            let fragment = fragment_dir.join(key);
            if let Some(parent) = fragment.parent() {
                fs::create_dir_all(parent)?;
            }

            self.delta
                .diff(old_file.as_deref(), &new_file, &fragment)
                .with_context(|| format!("无法生成差分: {}", key))?;
            manifest.record(key, &new_file)?;
            writer.append_node(&name, node, Some(&fragment))?;

            let marker = if old_file.is_some() { "*" } else { "+" };
            info!("  {} {}", marker, key);
        }

        // 类型在目录与非目录之间变化的路径也要先删除
        for (key, node) in old_listing.members() {
            let replaced = new_listing
                .get(Some(key))
                .is_some_and(|new_node| new_node.is_dir() != node.is_dir());
            if replaced || !new_listing.contains(Some(key)) {
                manifest.deleted.push(key.to_string());
                info!("  - {}", key);
            }
        }

        writer.append_bytes(MANIFEST_NAME, manifest.to_toml()?.as_bytes())?;
        if let Some(metadata_path) = &options.metadata_path {
            let metadata = fs::read(metadata_path)
                .with_context(|| format!("无法读取元数据文件: {:?}", metadata_path))?;
            writer.append_bytes(METADATA_NAME, &metadata)?;
        }
        writer.finish()?;

        drop(old_container);
        drop(new_container);
        remove_staging(staging)?;

        info!("补丁包已生成: {}", bundle.display());
        info!("  {}", manifest.summary());
        Ok(())
    }
}

fn has_regular_file(listing: &Listing, key: &str) -> bool {
    listing
        .get(Some(key))
        .is_some_and(|node| node.kind == NodeKind::File)
}
