mod common;

use anyhow::Result;
use clap::Parser;
use common::{Broken, FullCopy, scan, set_mode, symlink, unlock, write_file};
use dir_patcher::archive::{Container, ContainerFactory};
use dir_patcher::cli::Cli;
use dir_patcher::config::{Action, Config};
use dir_patcher::delta::{DeltaTool, Xdelta3};
use dir_patcher::error::PatchError;
use dir_patcher::patch::{
    ApplyOptions, DiffOptions, MANIFEST_NAME, Manifest, TreeSynchronizer, check_euid,
    file_checksum, read_metadata, remove_item,
};
use dir_patcher::utils::effective_uid;
use std::ffi::OsString;
use std::fs::{self, Permissions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

fn old_tree(root: &Path) {
    write_file(root, "keep.txt", b"same");
    write_file(root, "change.txt", b"version one");
    write_file(root, "remove.txt", b"old");
    write_file(root, "lib/keep.so", b"\x7fELF\x00\x01");
    write_file(root, "lib/drop.so", b"\x7fELF\x00\x02");
    write_file(root, "gone/inner/file.txt", b"bye");
    symlink(root, "current", "v1");
}

fn new_tree(root: &Path) {
    write_file(root, "keep.txt", b"same");
    write_file(root, "change.txt", b"version two, a bit longer");
    write_file(root, "lib/keep.so", b"\x7fELF\x00\x01");
    write_file(root, "add/new.txt", b"new file");
    let script = write_file(root, "bin/run.sh", b"#!/bin/sh\n");
    fs::set_permissions(script, Permissions::from_mode(0o750)).unwrap();
    fs::create_dir_all(root.join("empty")).unwrap();
    symlink(root, "current", "v2");
}

fn synchronizer() -> (Arc<FullCopy>, TreeSynchronizer) {
    let tool = Arc::new(FullCopy::default());
    let synchronizer = TreeSynchronizer::new(tool.clone());
    (tool, synchronizer)
}

fn apply_into(target: &Path) -> ApplyOptions {
    ApplyOptions {
        target_dir: Some(target.to_path_buf()),
        ignore_euid: true,
        ..ApplyOptions::default()
    }
}

fn archive(source: &Path, path: PathBuf) -> Result<PathBuf> {
    ContainerFactory::create(&path)?.create(source)?;
    Ok(path)
}

fn bundle_manifest(bundle: &Path) -> Result<Manifest> {
    let out = TempDir::new()?;
    let container = ContainerFactory::open(bundle)?;
    container.expand(Some(MANIFEST_NAME), out.path())?;
    Manifest::load(out.path())
}

fn patch_error(err: &anyhow::Error) -> &PatchError {
    err.downcast_ref::<PatchError>()
        .unwrap_or_else(|| panic!("unexpected error: {:#}", err))
}

#[test]
fn diff_and_apply_reproduce_new_tree() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    old_tree(old.path());
    new_tree(new.path());
    let old_before = scan(old.path());

    let (tool, synchronizer) = synchronizer();
    let bundle = work.path().join("patch.tgz");
    synchronizer.diff(old.path(), new.path(), &bundle, &DiffOptions::default())?;
    assert!(bundle.exists());

    let target = work.path().join("target");
    synchronizer.apply(old.path(), &bundle, &apply_into(&target))?;

    assert_eq!(scan(&target), scan(new.path()));
    assert_eq!(scan(old.path()), old_before);

    // 只有旧版本中已存在的普通文件才作为差分源
    let diffs = tool.diffs.lock().unwrap();
    let with_source: Vec<_> = diffs
        .iter()
        .filter(|(old, _)| old.is_some())
        .map(|(_, new)| new.file_name().unwrap().to_owned())
        .collect();
    assert_eq!(with_source.len(), 3);
    assert!(with_source.contains(&"keep.txt".into()));
    assert!(with_source.contains(&"change.txt".into()));
    assert!(with_source.contains(&"keep.so".into()));
    assert_eq!(diffs.len(), 5);
    Ok(())
}

#[test]
fn archives_on_both_sides_round_trip() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    old_tree(old.path());
    new_tree(new.path());

    let old_tar = archive(old.path(), work.path().join("old.tar.gz"))?;
    let new_zip = archive(new.path(), work.path().join("new.zip"))?;
    let old_zip = archive(old.path(), work.path().join("old.zip"))?;
    let new_tar = archive(new.path(), work.path().join("new.tar"))?;

    let (_, synchronizer) = synchronizer();
    for (index, (old_side, new_side)) in [(&old_tar, &new_zip), (&old_zip, &new_tar)]
        .into_iter()
        .enumerate()
    {
        let bundle = work.path().join(format!("patch{}.tgz", index));
        synchronizer.diff(old_side, new_side, &bundle, &DiffOptions::default())?;

        let target = work.path().join(format!("target{}", index));
        synchronizer.apply(old_side, &bundle, &apply_into(&target))?;

        assert_eq!(scan(&target), scan(new.path()), "{:?}", new_side);
    }
    Ok(())
}

#[test]
fn deleted_paths_go_while_siblings_stay() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    old_tree(old.path());
    new_tree(new.path());

    let (_, synchronizer) = synchronizer();
    let bundle = work.path().join("patch.tgz");
    synchronizer.diff(old.path(), new.path(), &bundle, &DiffOptions::default())?;

    let manifest = bundle_manifest(&bundle)?;
    let mut deleted = manifest.deleted.clone();
    deleted.sort();
    assert_eq!(
        deleted,
        [
            "gone",
            "gone/inner",
            "gone/inner/file.txt",
            "lib/drop.so",
            "remove.txt"
        ]
    );

    // 在旧版本的副本上原地更新
    let target = work.path().join("in_place");
    ContainerFactory::create(&target)?.create(old.path())?;
    synchronizer.apply(&target, &bundle, &apply_into(&target))?;

    assert!(!target.join("remove.txt").exists());
    assert!(!target.join("lib/drop.so").exists());
    assert!(!target.join("gone").exists());
    assert_eq!(fs::read(target.join("lib/keep.so"))?, b"\x7fELF\x00\x01");
    assert_eq!(scan(&target), scan(new.path()));
    Ok(())
}

#[test]
fn entries_changing_between_file_and_directory() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    write_file(old.path(), "thing", b"a plain file");
    write_file(old.path(), "other/child.txt", b"child");
    write_file(new.path(), "thing/inner.txt", b"now a directory");
    write_file(new.path(), "other", b"now a file");

    let (_, synchronizer) = synchronizer();
    let bundle = work.path().join("patch.tgz");
    synchronizer.diff(old.path(), new.path(), &bundle, &DiffOptions::default())?;

    let target = work.path().join("in_place");
    ContainerFactory::create(&target)?.create(old.path())?;
    synchronizer.apply(&target, &bundle, &apply_into(&target))?;

    assert_eq!(scan(&target), scan(new.path()));
    Ok(())
}

#[test]
fn metadata_file_travels_with_bundle() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    old_tree(old.path());
    new_tree(new.path());
    let info = write_file(work.path(), "release.json", b"{\"build\": 42}\n");

    let (_, synchronizer) = synchronizer();
    let with_info = work.path().join("with_info.tgz");
    synchronizer.diff(
        old.path(),
        new.path(),
        &with_info,
        &DiffOptions {
            metadata_path: Some(info),
            ..DiffOptions::default()
        },
    )?;
    let without_info = work.path().join("without_info.tgz");
    synchronizer.diff(old.path(), new.path(), &without_info, &DiffOptions::default())?;

    assert_eq!(
        read_metadata(&with_info)?.as_deref(),
        Some(&b"{\"build\": 42}\n"[..])
    );
    assert_eq!(read_metadata(&without_info)?, None);

    // 元数据不会出现在还原结果中
    let target = work.path().join("target");
    synchronizer.apply(old.path(), &with_info, &apply_into(&target))?;
    assert_eq!(scan(&target), scan(new.path()));
    Ok(())
}

#[test]
fn manifest_records_new_file_checksums() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    old_tree(old.path());
    new_tree(new.path());

    let (_, synchronizer) = synchronizer();
    let bundle = work.path().join("patch.tgz");
    synchronizer.diff(old.path(), new.path(), &bundle, &DiffOptions::default())?;

    let manifest = bundle_manifest(&bundle)?;
    let keys: Vec<_> = manifest.checksums.keys().map(String::as_str).collect();
    assert_eq!(
        keys,
        ["add/new.txt", "bin/run.sh", "change.txt", "keep.txt", "lib/keep.so"]
    );
    assert_eq!(
        manifest.checksums["change.txt"],
        file_checksum(&new.path().join("change.txt"))?
    );
    Ok(())
}

#[test]
fn corrupted_output_fails_checksum() -> Result<()> {
    struct Corrupting;

    impl DeltaTool for Corrupting {
        fn diff(&self, _old: Option<&Path>, new: &Path, out: &Path) -> Result<()> {
            fs::copy(new, out)?;
            Ok(())
        }

        fn apply(&self, _old: Option<&Path>, _fragment: &Path, out: &Path) -> Result<()> {
            fs::write(out, b"garbage")?;
            Ok(())
        }
    }

    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    write_file(old.path(), "data.bin", b"one");
    write_file(new.path(), "data.bin", b"two");

    let synchronizer = TreeSynchronizer::new(Arc::new(Corrupting));
    let bundle = work.path().join("patch.tgz");
    synchronizer.diff(old.path(), new.path(), &bundle, &DiffOptions::default())?;

    let err = synchronizer
        .apply(old.path(), &bundle, &apply_into(&work.path().join("target")))
        .unwrap_err();

    match patch_error(&err) {
        PatchError::ChecksumMismatch { path, .. } => assert!(path.ends_with("data.bin")),
        other => panic!("unexpected error: {}", other),
    }
    Ok(())
}

#[test]
fn read_only_directories_are_written_before_locking() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    old_tree(old.path());
    write_file(old.path(), "ro/f.txt", b"first");
    new_tree(new.path());
    write_file(new.path(), "ro/f.txt", b"second");
    write_file(new.path(), "ro/sub/g.txt", b"added under a locked dir");
    set_mode(&new.path().join("ro/sub"), 0o555);
    set_mode(&new.path().join("ro"), 0o555);

    let (_, synchronizer) = synchronizer();
    let bundle = work.path().join("patch.tgz");
    synchronizer.diff(old.path(), new.path(), &bundle, &DiffOptions::default())?;

    let target = work.path().join("target");
    synchronizer.apply(old.path(), &bundle, &apply_into(&target))?;
    assert_eq!(scan(&target), scan(new.path()));

    // 原地更新
    let options = ApplyOptions {
        ignore_euid: true,
        ..ApplyOptions::default()
    };
    synchronizer.apply(old.path(), &bundle, &options)?;
    assert_eq!(scan(old.path()), scan(new.path()));

    for dir in [old.path(), new.path(), work.path()] {
        unlock(dir);
    }
    Ok(())
}

#[test]
fn archived_old_version_needs_a_target() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    old_tree(old.path());
    new_tree(new.path());

    let (tool, synchronizer) = synchronizer();
    let bundle = work.path().join("patch.tgz");
    synchronizer.diff(old.path(), new.path(), &bundle, &DiffOptions::default())?;

    for name in ["old.tar.gz", "old.zip"] {
        let old_archive = archive(old.path(), work.path().join(name))?;
        let options = ApplyOptions {
            ignore_euid: true,
            ..ApplyOptions::default()
        };
        let err = synchronizer
            .apply(&old_archive, &bundle, &options)
            .unwrap_err();
        assert!(
            matches!(patch_error(&err), PatchError::TargetNotDirectory(path) if path == &old_archive),
            "{}",
            name
        );
        assert!(ContainerFactory::open(&old_archive).is_ok(), "{}", name);

        let target = work.path().join(format!("{}.target", name));
        synchronizer.apply(&old_archive, &bundle, &apply_into(&target))?;
        assert_eq!(scan(&target), scan(new.path()), "{}", name);
    }
    assert!(!tool.applies.lock().unwrap().is_empty());
    Ok(())
}

#[test]
fn root_patch_dir_applies_a_subtree() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    write_file(old.path(), "top.txt", b"top");
    write_file(new.path(), "top.txt", b"top changed");
    write_file(new.path(), "plugin/mod.txt", b"plugin");
    write_file(new.path(), "plugin/nested/deep.txt", b"deep");

    let (_, synchronizer) = synchronizer();
    let bundle = work.path().join("patch.tgz");
    synchronizer.diff(old.path(), new.path(), &bundle, &DiffOptions::default())?;

    let target = work.path().join("plugin_only");
    synchronizer.apply(
        old.path(),
        &bundle,
        &ApplyOptions {
            root_patch_dir: Some("xdelta/plugin/".to_string()),
            ..apply_into(&target)
        },
    )?;

    assert_eq!(fs::read(target.join("mod.txt"))?, b"plugin");
    assert_eq!(fs::read(target.join("nested/deep.txt"))?, b"deep");
    assert!(!target.join("top.txt").exists());

    let err = synchronizer
        .apply(
            old.path(),
            &bundle,
            &ApplyOptions {
                root_patch_dir: Some("no_such_dir".to_string()),
                ..apply_into(&work.path().join("never"))
            },
        )
        .unwrap_err();
    assert!(matches!(
        patch_error(&err),
        PatchError::InvalidBundle { .. }
    ));
    Ok(())
}

#[test]
fn config_from_cli_applies_in_place() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    old_tree(old.path());
    new_tree(new.path());
    let bundle = work.path().join("patch.tgz");

    let (_, synchronizer) = synchronizer();
    let diff = Config::from(Cli::try_parse_from([
        OsString::from("dir-patcher"),
        "diff".into(),
        old.path().into(),
        new.path().into(),
        bundle.clone().into(),
    ])?);
    assert_eq!(diff.action, Action::Diff);
    synchronizer.run(&diff)?;

    let apply = Config::from(Cli::try_parse_from([
        OsString::from("dir-patcher"),
        "--debug".into(),
        "apply".into(),
        old.path().into(),
        bundle.into(),
        "--ignore-euid".into(),
    ])?);
    assert_eq!(apply.action, Action::Apply);
    assert!(apply.debug);
    assert!(apply.target_dir.is_none());
    assert_eq!(
        apply.apply_options().target_dir.as_deref(),
        Some(old.path())
    );
    synchronizer.run(&apply)?;

    assert_eq!(scan(old.path()), scan(new.path()));
    Ok(())
}

#[test]
fn staging_directory_is_cleaned_up() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    old_tree(old.path());
    new_tree(new.path());
    let staging = work.path().join("staging");

    let (_, synchronizer) = synchronizer();
    let bundle = work.path().join("patch.tgz");
    synchronizer.diff(
        old.path(),
        new.path(),
        &bundle,
        &DiffOptions {
            staging_dir: Some(staging.clone()),
            ..DiffOptions::default()
        },
    )?;
    assert_eq!(fs::read_dir(&staging)?.count(), 0);

    synchronizer.apply(
        old.path(),
        &bundle,
        &ApplyOptions {
            staging_dir: Some(staging.clone()),
            ..apply_into(&work.path().join("target"))
        },
    )?;
    assert_eq!(fs::read_dir(&staging)?.count(), 0);
    Ok(())
}

#[test]
fn delta_tool_failure_aborts_diff() -> Result<()> {
    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    old_tree(old.path());
    new_tree(new.path());

    let synchronizer = TreeSynchronizer::new(Arc::new(Broken));
    let err = synchronizer
        .diff(
            old.path(),
            new.path(),
            &work.path().join("patch.tgz"),
            &DiffOptions::default(),
        )
        .unwrap_err();

    assert!(format!("{:#}", err).contains("delta tool exploded"));
    Ok(())
}

#[test]
fn unsupported_old_version_is_rejected() -> Result<()> {
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    new_tree(new.path());
    let bogus = write_file(work.path(), "old.bin", b"no archive here");

    let (_, synchronizer) = synchronizer();
    let err = synchronizer
        .diff(
            &bogus,
            new.path(),
            &work.path().join("patch.tgz"),
            &DiffOptions::default(),
        )
        .unwrap_err();

    assert!(matches!(
        patch_error(&err),
        PatchError::UnsupportedArchive(path) if path == &bogus
    ));
    Ok(())
}

#[test]
fn euid_gate() {
    assert!(check_euid(false, || 0).is_ok());
    assert!(check_euid(true, || 1000).is_ok());

    let err = check_euid(false, || 1000).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<PatchError>(),
        Some(PatchError::PrivilegeRequired { euid: 1000 })
    ));
}

#[test]
fn apply_requires_root_unless_ignored() -> Result<()> {
    if effective_uid() == 0 {
        return Ok(());
    }

    let old = TempDir::new()?;
    let new = TempDir::new()?;
    let work = TempDir::new()?;
    write_file(old.path(), "a.txt", b"a");
    write_file(new.path(), "a.txt", b"b");

    let (_, synchronizer) = synchronizer();
    let bundle = work.path().join("patch.tgz");
    synchronizer.diff(old.path(), new.path(), &bundle, &DiffOptions::default())?;

    let target = work.path().join("target");
    let err = synchronizer
        .apply(
            old.path(),
            &bundle,
            &ApplyOptions {
                ignore_euid: false,
                ..apply_into(&target)
            },
        )
        .unwrap_err();

    assert!(matches!(
        patch_error(&err),
        PatchError::PrivilegeRequired { .. }
    ));
    assert!(!target.exists());
    Ok(())
}

#[test]
fn remove_item_keeps_non_empty_directories() -> Result<()> {
    let root = TempDir::new()?;
    write_file(root.path(), "full/file.txt", b"x");
    write_file(root.path(), "plain.txt", b"x");
    fs::create_dir_all(root.path().join("empty"))?;
    symlink(root.path(), "dir_link", "full");

    assert!(!remove_item(root.path(), "full")?);
    assert!(root.path().join("full/file.txt").exists());

    assert!(remove_item(root.path(), "empty")?);
    assert!(remove_item(root.path(), "plain.txt")?);
    assert!(remove_item(root.path(), "dir_link")?);
    assert!(!remove_item(root.path(), "missing")?);

    assert!(!root.path().join("empty").exists());
    assert!(!root.path().join("plain.txt").exists());
    assert!(fs::symlink_metadata(root.path().join("dir_link")).is_err());
    assert!(root.path().join("full").is_dir());
    Ok(())
}

#[test]
fn xdelta3_arguments() {
    let old = Path::new("old.bin");
    let new = Path::new("new.bin");
    let out = Path::new("out.vcdiff");

    let strings = |args: Vec<OsString>| {
        args.into_iter()
            .map(|arg| arg.into_string().unwrap())
            .collect::<Vec<_>>()
    };

    assert_eq!(
        strings(Xdelta3::diff_args(Some(old), new, out)),
        ["-f", "-e", "-s", "old.bin", "new.bin", "out.vcdiff"]
    );
    assert_eq!(
        strings(Xdelta3::diff_args(None, new, out)),
        ["-f", "-e", "new.bin", "out.vcdiff"]
    );
    assert_eq!(
        strings(Xdelta3::apply_args(Some(old), out, new)),
        ["-f", "-d", "-s", "old.bin", "out.vcdiff", "new.bin"]
    );
    assert_eq!(
        strings(Xdelta3::apply_args(None, out, new)),
        ["-f", "-d", "out.vcdiff", "new.bin"]
    );
}

#[test]
fn failing_delta_program_reports_its_status() -> Result<()> {
    let work = TempDir::new()?;
    let input = write_file(work.path(), "in.bin", b"data");

    let err = Xdelta3::with_program("false")
        .diff(None, &input, &work.path().join("out.bin"))
        .unwrap_err();

    match patch_error(&err) {
        PatchError::DeltaToolFailure { command, .. } => assert!(command.starts_with("false -f -e")),
        other => panic!("unexpected error: {}", other),
    }
    Ok(())
}
