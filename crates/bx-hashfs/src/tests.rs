use std::fs;
use std::sync::Arc;

use camino::Utf8PathBuf;

use bx_digest::{ContentStore, Digest};

use crate::{FileEntry, FsError, HashFS, Options, RegularEntry, Source, SymlinkEntry};

struct Fixture {
    _dir: tempfile::TempDir,
    root: String,
    fs: HashFS,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let root = root.to_str().unwrap().to_string();
        let store_root = Utf8PathBuf::from(format!("{}/.bx-store", root));
        let store = Arc::new(ContentStore::new(store_root).unwrap());
        let fs = HashFS::new(Options { store });
        Self {
            _dir: dir,
            root,
            fs,
        }
    }

    fn write(&self, rel: &str, contents: &str) {
        let path = format!("{}/{}", self.root, rel);
        let parent = std::path::Path::new(&path).parent().unwrap();
        fs::create_dir_all(parent).unwrap();
        fs::write(&path, contents).unwrap();
    }

    #[cfg(unix)]
    fn symlink(&self, target: &str, rel: &str) {
        let path = format!("{}/{}", self.root, rel);
        let parent = std::path::Path::new(&path).parent().unwrap();
        fs::create_dir_all(parent).unwrap();
        std::os::unix::fs::symlink(target, &path).unwrap();
    }

    fn regular(&self, contents: &[u8]) -> FileEntry {
        FileEntry::Regular(RegularEntry {
            digest: Digest::from_bytes(contents),
            mtime_ns: HashFS::now_ns(),
            executable: false,
            action_digest: Digest::empty(),
            cmd_hash: b"cmdhash".to_vec(),
            is_changed: false,
            updated_time: 0,
        })
    }
}

#[test]
fn stat_reads_through_to_disk() {
    let fx = Fixture::new();
    fx.write("base/base.h", "#pragma once\n");

    let fi = fx.fs.stat(&fx.root, "base/base.h").unwrap();
    match &fi.entry {
        FileEntry::Regular(r) => {
            assert_eq!(r.digest, Digest::from_bytes(b"#pragma once\n"));
            assert!(!r.executable);
            assert!(r.action_digest.is_zero());
        }
        other => panic!("want regular entry, got {:?}", other),
    }

    // Parent directory became known too.
    let dir = fx.fs.stat(&fx.root, "base").unwrap();
    assert!(dir.is_dir());
}

#[test]
fn stat_missing_is_not_found() {
    let fx = Fixture::new();
    let err = fx.fs.stat(&fx.root, "no/such/file.h").unwrap_err();
    assert!(err.is_not_found(), "got {err}");
}

#[test]
fn update_wins_over_disk_and_last_update_wins() {
    let fx = Fixture::new();
    fx.write("gen/out.h", "stale on disk");

    let first = fx.regular(b"first");
    fx.fs
        .update(&fx.root, "gen/out.h", first.clone(), Source::Remote)
        .unwrap();
    let fi = fx.fs.stat(&fx.root, "gen/out.h").unwrap();
    assert_eq!(fi.entry.digest(), first.digest());

    let second = fx.regular(b"second, longer");
    fx.fs
        .update(&fx.root, "gen/out.h", second.clone(), Source::Remote)
        .unwrap();
    let fi = fx.fs.stat(&fx.root, "gen/out.h").unwrap();
    assert_eq!(fi.entry.digest(), second.digest());
}

#[test]
fn remote_entries_survive_epoch_refresh() {
    let fx = Fixture::new();
    let entry = fx.regular(b"generated remotely");
    fx.fs
        .update(&fx.root, "out/gen.h", entry.clone(), Source::Remote)
        .unwrap();

    // A new build starts; remote entries have no disk backing but stay
    // authoritative.
    fx.fs.set_build_epoch(HashFS::now_ns() + 1);
    let fi = fx.fs.stat(&fx.root, "out/gen.h").unwrap();
    assert_eq!(fi.entry.digest(), entry.digest());
}

#[test]
fn epoch_refresh_detects_disk_change() {
    let fx = Fixture::new();
    fx.write("src/a.cc", "int a;");
    let before = fx.fs.stat(&fx.root, "src/a.cc").unwrap();

    fx.write("src/a.cc", "int a; int b; // changed");
    fx.fs.set_build_epoch(HashFS::now_ns() + 1);

    let after = fx.fs.stat(&fx.root, "src/a.cc").unwrap();
    assert_ne!(before.entry.digest(), after.entry.digest());
    match after.entry {
        FileEntry::Regular(r) => assert!(r.is_changed),
        _ => panic!("want regular"),
    }
}

#[test]
fn epoch_refresh_detects_deletion() {
    let fx = Fixture::new();
    fx.write("src/gone.cc", "int x;");
    fx.fs.stat(&fx.root, "src/gone.cc").unwrap();

    fs::remove_file(format!("{}/src/gone.cc", fx.root)).unwrap();
    fx.fs.set_build_epoch(HashFS::now_ns() + 1);

    let err = fx.fs.stat(&fx.root, "src/gone.cc").unwrap_err();
    assert!(err.is_not_found());
}

#[cfg(unix)]
#[test]
fn intermediate_symlink_is_signalled_not_followed() {
    let fx = Fixture::new();
    fx.write("real/hdr.h", "// hdr");
    fx.symlink("real", "linkdir");

    let err = fx.fs.stat(&fx.root, "linkdir/hdr.h").unwrap_err();
    match err {
        FsError::Symlink { path, target } => {
            assert_eq!(path, format!("{}/linkdir", fx.root));
            assert_eq!(target, "real");
        }
        other => panic!("want Symlink, got {other}"),
    }
}

#[cfg(unix)]
#[test]
fn final_symlink_is_returned_as_entry() {
    let fx = Fixture::new();
    fx.write("real/hdr.h", "// hdr");
    fx.symlink("real/hdr.h", "alias.h");

    let fi = fx.fs.stat(&fx.root, "alias.h").unwrap();
    assert_eq!(fi.target(), "real/hdr.h");
}

#[cfg(unix)]
#[test]
fn stat_follow_records_chained_links() {
    let fx = Fixture::new();
    // Foo.framework/Headers -> Versions/Current/Headers -> Versions/A/Headers
    fx.write("Foo.framework/Versions/A/Headers/Bar.h", "// Bar");
    fx.symlink("Versions/Current/Headers", "Foo.framework/Headers");
    fx.symlink("A", "Foo.framework/Versions/Current");

    let st = fx
        .fs
        .stat_follow(&fx.root, "Foo.framework/Headers/Bar.h")
        .unwrap();
    assert_eq!(
        st.info.path,
        format!("{}/Foo.framework/Versions/A/Headers/Bar.h", fx.root)
    );
    let visited = fx.fs.visited_paths(&fx.root, &st);
    assert!(visited.contains(&"Foo.framework/Headers".to_string()), "{visited:?}");
    assert!(visited.contains(&"Foo.framework/Versions/Current".to_string()), "{visited:?}");
    assert!(visited.contains(&"Foo.framework/Versions/A/Headers/Bar.h".to_string()));
}

#[cfg(unix)]
#[test]
fn read_file_follows_symlinks() {
    let fx = Fixture::new();
    fx.write("real/data.h", "payload");
    fx.symlink("real", "link");
    let buf = fx.fs.read_file(&fx.root, "link/data.h").unwrap();
    assert_eq!(buf, b"payload");
}

#[cfg(unix)]
#[test]
fn symlink_loop_fails() {
    let fx = Fixture::new();
    fx.symlink("b", "a");
    fx.symlink("a", "b");
    let err = fx.fs.read_file(&fx.root, "a").unwrap_err();
    assert!(matches!(err, FsError::Loop { .. }), "got {err}");
}

#[cfg(unix)]
#[test]
fn dangling_symlink_is_observable() {
    let fx = Fixture::new();
    fx.symlink("no/such/target", "dangling");

    // stat returns the link itself.
    let fi = fx.fs.stat(&fx.root, "dangling").unwrap();
    assert_eq!(fi.target(), "no/such/target");

    // following fails NotFound.
    let err = fx.fs.stat_follow(&fx.root, "dangling").unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn dangling_generated_symlink_is_a_valid_output() {
    let fx = Fixture::new();
    // A step produced a symlink whose target does not exist; the entry is
    // the link record and it round-trips through stat untouched.
    let entry = FileEntry::Symlink(SymlinkEntry {
        target: "libfoo.so.1".to_string(),
        mtime_ns: HashFS::now_ns(),
        updated_time: 0,
    });
    fx.fs
        .update(&fx.root, "out/libfoo.so", entry, Source::Remote)
        .unwrap();
    let fi = fx.fs.stat(&fx.root, "out/libfoo.so").unwrap();
    assert_eq!(fi.target(), "libfoo.so.1");
}

#[test]
fn read_dir_merges_disk_and_overlay() {
    let fx = Fixture::new();
    fx.write("dir/on_disk.h", "");
    fx.fs
        .update(&fx.root, "dir/generated.h", fx.regular(b"gen"), Source::Remote)
        .unwrap();

    let ents = fx.fs.read_dir(&fx.root, "dir").unwrap();
    let names: Vec<_> = ents.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["generated.h", "on_disk.h"]);
}

#[test]
fn forget_reloads_from_disk() {
    let fx = Fixture::new();
    fx.write("src/f.cc", "v1");
    fx.fs.stat(&fx.root, "src/f.cc").unwrap();

    fx.fs
        .update(&fx.root, "src/f.cc", fx.regular(b"overlaid"), Source::Remote)
        .unwrap();
    fx.fs.forget(&fx.root, "src/f.cc");

    let fi = fx.fs.stat(&fx.root, "src/f.cc").unwrap();
    assert_eq!(fi.entry.digest(), Digest::from_bytes(b"v1"));
}

#[test]
fn parent_dir_mtime_covers_children() {
    let fx = Fixture::new();
    let entry = fx.regular(b"child");
    let child_mtime = entry.mtime_ns();
    fx.fs
        .update(&fx.root, "out/sub/child.o", entry, Source::Remote)
        .unwrap();

    let sub = fx.fs.stat(&fx.root, "out/sub").unwrap();
    let out = fx.fs.stat(&fx.root, "out").unwrap();
    assert!(sub.entry.mtime_ns() >= child_mtime);
    assert!(out.entry.mtime_ns() >= child_mtime);
}

#[test]
fn read_file_serves_store_only_content() {
    let fx = Fixture::new();
    let data = b"remote object bytes";
    let digest = fx.fs.store().put(data).unwrap();
    fx.fs
        .update(
            &fx.root,
            "out/remote.o",
            FileEntry::Regular(RegularEntry {
                digest,
                mtime_ns: HashFS::now_ns(),
                executable: false,
                action_digest: Digest::from_bytes(b"some action"),
                cmd_hash: Vec::new(),
                is_changed: true,
                updated_time: 0,
            }),
            Source::Remote,
        )
        .unwrap();

    let buf = fx.fs.read_file(&fx.root, "out/remote.o").unwrap();
    assert_eq!(buf, data);
    // Not on disk until flushed.
    assert!(fs::metadata(format!("{}/out/remote.o", fx.root)).is_err());
}

#[cfg(unix)]
#[test]
fn flush_materializes_store_only_entries() {
    let fx = Fixture::new();
    let data = b"#!/bin/sh\necho hi\n";
    let digest = fx.fs.store().put(data).unwrap();
    fx.fs
        .update(
            &fx.root,
            "out/tool.sh",
            FileEntry::Regular(RegularEntry {
                digest,
                mtime_ns: HashFS::now_ns(),
                executable: true,
                action_digest: Digest::from_bytes(b"act"),
                cmd_hash: Vec::new(),
                is_changed: true,
                updated_time: 0,
            }),
            Source::Remote,
        )
        .unwrap();

    fx.fs
        .flush(&fx.root, &["out/tool.sh".to_string()])
        .unwrap();
    let disk = fs::read(format!("{}/out/tool.sh", fx.root)).unwrap();
    assert_eq!(disk, data);
    use std::os::unix::fs::PermissionsExt;
    let mode = fs::metadata(format!("{}/out/tool.sh", fx.root))
        .unwrap()
        .permissions()
        .mode();
    assert_ne!(mode & 0o111, 0);
}

#[test]
fn entries_ingests_local_digests() {
    let fx = Fixture::new();
    fx.write("src/in.cc", "int in;");
    let got = fx
        .fs
        .entries(&fx.root, &["src/in.cc".to_string()])
        .unwrap();
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].0, "src/in.cc");
    // The digest is now resolvable via the content store.
    assert!(fx.fs.store().exists(&got[0].1.digest()));
}

#[cfg(unix)]
#[test]
fn expand_symlinks_lists_intermediate_links() {
    let fx = Fixture::new();
    fx.write("include/android/log.h", "");
    fx.symlink("../include/android", "include_vndk/android");

    let got = fx.fs.expand_symlinks(&fx.root, "include_vndk/android/log.h");
    assert!(got.contains(&"include_vndk/android".to_string()), "{got:?}");
    assert!(got.contains(&"include/android/log.h".to_string()), "{got:?}");
}

#[test]
fn state_round_trips_modulo_updated_time() {
    let fx = Fixture::new();
    fx.write("src/a.cc", "int a;");
    fx.fs.stat(&fx.root, "src/a.cc").unwrap();
    fx.fs
        .update(
            &fx.root,
            "out/gen.h",
            FileEntry::Regular(RegularEntry {
                digest: Digest::from_bytes(b"gen"),
                mtime_ns: 123_456_789,
                executable: true,
                action_digest: Digest::from_bytes(b"action"),
                cmd_hash: b"cmd".to_vec(),
                is_changed: false,
                updated_time: 0,
            }),
            Source::Remote,
        )
        .unwrap();
    fx.fs
        .update(
            &fx.root,
            "out/link",
            FileEntry::Symlink(SymlinkEntry {
                target: "gen.h".to_string(),
                mtime_ns: 42,
                updated_time: 0,
            }),
            Source::Remote,
        )
        .unwrap();
    fx.fs.note_missing(&format!("{}/out/absent.h", fx.root));

    let state_path = Utf8PathBuf::from(format!("{}/.bx_fs_state", fx.root));
    fx.fs.save(&state_path).unwrap();

    let store = fx.fs.store().clone();
    let reloaded = HashFS::new(Options { store });
    reloaded.load(&state_path).unwrap();

    let strip = |mut entries: Vec<(String, FileEntry)>| {
        for (_, e) in entries.iter_mut() {
            match e {
                FileEntry::Regular(r) => r.updated_time = 0,
                FileEntry::Symlink(s) => s.updated_time = 0,
                FileEntry::Directory { mtime_ns } => *mtime_ns = 0,
            }
        }
        entries
    };
    assert_eq!(strip(fx.fs.snapshot()), strip(reloaded.snapshot()));
    assert_eq!(fx.fs.missing_paths(), reloaded.missing_paths());
}

#[test]
fn state_load_rejects_bad_magic() {
    let fx = Fixture::new();
    let state_path = Utf8PathBuf::from(format!("{}/.bx_fs_state", fx.root));
    fs::write(&state_path, b"not a state file").unwrap();
    let err = fx.fs.load(&state_path).unwrap_err();
    assert!(matches!(err, FsError::InvalidState { .. }), "got {err}");
}

#[test]
fn state_load_rejects_future_version() {
    let fx = Fixture::new();
    let state_path = Utf8PathBuf::from(format!("{}/.bx_fs_state", fx.root));
    let mut buf = Vec::new();
    buf.extend_from_slice(&crate::state::STATE_MAGIC.to_le_bytes());
    buf.extend_from_slice(&99u32.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&0u32.to_le_bytes());
    fs::write(&state_path, &buf).unwrap();
    let err = fx.fs.load(&state_path).unwrap_err();
    assert!(matches!(err, FsError::InvalidState { .. }), "got {err}");
}
