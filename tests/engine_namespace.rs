mod support;

use quayfs::engine::{CreateDisposition, RenameFlags};
use quayfs::error::EngineError;
use quayfs::inode::{InodeKind, SetAttrPatch};
use quayfs::settings::SettingsPatch;
use quayfs::share::BlockedOp;

use support::Fixture;

#[tokio::test]
async fn hard_link_survives_original_unlink() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = fx.root().await;

    let f = fx.make_file("f", b"hello").await;
    fx.engine.link(&ctx, f, root, "g").await.unwrap();
    assert_eq!(fx.engine.get_attr(&ctx, f).await.unwrap().nlink, 2);

    fx.engine.remove(&ctx, root, "f", false).await.unwrap();

    let (g, attrs) = fx.engine.lookup(&ctx, root, "g").await.unwrap();
    assert_eq!(g, f);
    assert_eq!(attrs.nlink, 1);
    assert_eq!(fx.read_all(g).await, b"hello");
}

#[tokio::test]
async fn exclusive_create_retry_returns_same_inode() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = fx.root().await;
    let token = [0xAB; 8];

    let (first, _) = fx
        .engine
        .create(&ctx, root, "x", &SetAttrPatch::default(), CreateDisposition::Exclusive(token))
        .await
        .unwrap();
    let (retry, _) = fx
        .engine
        .create(&ctx, root, "x", &SetAttrPatch::default(), CreateDisposition::Exclusive(token))
        .await
        .unwrap();
    assert_eq!(first, retry);

    let err = fx
        .engine
        .create(
            &ctx,
            root,
            "x",
            &SetAttrPatch::default(),
            CreateDisposition::Exclusive([0xCD; 8]),
        )
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Exists);
}

#[tokio::test]
async fn guarded_create_fails_on_existing_entry() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = fx.root().await;
    fx.make_file("f", b"").await;
    let err = fx
        .engine
        .create(&ctx, root, "f", &SetAttrPatch::default(), CreateDisposition::Guarded)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Exists);

    // unchecked reuses the entry
    let (id, _) = fx
        .engine
        .create(&ctx, root, "f", &SetAttrPatch::default(), CreateDisposition::Unchecked)
        .await
        .unwrap();
    assert_eq!(fx.engine.lookup(&ctx, root, "f").await.unwrap().0, id);
}

#[tokio::test]
async fn rename_back_and_forth_restores_state() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = fx.root().await;
    let f = fx.make_file("a", b"content").await;
    let before = fx.engine.get_attr(&ctx, f).await.unwrap();

    fx.engine.rename(&ctx, root, "a", root, "b", RenameFlags::default()).await.unwrap();
    fx.engine.rename(&ctx, root, "b", root, "a", RenameFlags::default()).await.unwrap();

    let (found, after) = fx.engine.lookup(&ctx, root, "a").await.unwrap();
    assert_eq!(found, f);
    assert_eq!(after.size, before.size);
    assert_eq!(after.nlink, before.nlink);
    assert_eq!(after.mode, before.mode);
    assert_eq!(fx.read_all(f).await, b"content");
}

#[tokio::test]
async fn rename_overwrite_rules() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = fx.root().await;
    fx.make_file("src", b"new").await;
    fx.make_file("dst", b"old").await;

    // NoOverwrite flag refuses an existing destination
    let err = fx
        .engine
        .rename(&ctx, root, "src", root, "dst", RenameFlags { no_overwrite: true })
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::Exists);

    // default semantics replace it atomically
    fx.engine.rename(&ctx, root, "src", root, "dst", RenameFlags::default()).await.unwrap();
    assert_eq!(fx.engine.lookup(&ctx, root, "src").await.unwrap_err(), EngineError::NoEntry);
    let (dst, _) = fx.engine.lookup(&ctx, root, "dst").await.unwrap();
    assert_eq!(fx.read_all(dst).await, b"new");

    // a file never overwrites a directory
    fx.engine.mkdir(&ctx, root, "dir", &SetAttrPatch::default()).await.unwrap();
    fx.make_file("plain", b"").await;
    let err = fx
        .engine
        .rename(&ctx, root, "plain", root, "dir", RenameFlags::default())
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::IsDir);
}

#[tokio::test]
async fn remove_requires_empty_directory() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = fx.root().await;
    let (dir, _) = fx.engine.mkdir(&ctx, root, "d", &SetAttrPatch::default()).await.unwrap();
    fx.engine
        .create(&ctx, dir, "child", &SetAttrPatch::default(), CreateDisposition::Unchecked)
        .await
        .unwrap();

    let err = fx.engine.remove(&ctx, root, "d", true).await.unwrap_err();
    assert_eq!(err, EngineError::NotEmpty);

    fx.engine.remove(&ctx, dir, "child", false).await.unwrap();
    fx.engine.remove(&ctx, root, "d", true).await.unwrap();
    assert_eq!(fx.engine.lookup(&ctx, root, "d").await.unwrap_err(), EngineError::NoEntry);
}

#[tokio::test]
async fn symlink_and_mknod_round_trip() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = fx.root().await;

    let (link, attrs) = fx
        .engine
        .symlink(&ctx, root, "ln", "../target", &SetAttrPatch::default())
        .await
        .unwrap();
    assert_eq!(attrs.kind, InodeKind::Symlink);
    assert_eq!(fx.engine.readlink(&ctx, link).await.unwrap(), "../target");

    let (fifo, attrs) = fx
        .engine
        .mknod(&ctx, root, "pipe", InodeKind::Fifo, None, &SetAttrPatch::default())
        .await
        .unwrap();
    assert_eq!(attrs.kind, InodeKind::Fifo);
    assert_eq!(fx.engine.readlink(&ctx, fifo).await.unwrap_err(), EngineError::NotSymlink);
}

#[tokio::test]
async fn readdir_pages_cover_every_stable_entry_once() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = fx.root().await;
    for i in 0..10 {
        fx.make_file(&format!("f{i:02}"), b"").await;
    }

    let mut seen = Vec::new();
    let mut cookie = 0;
    let mut verifier = None;
    loop {
        let page = fx.engine.readdir(&ctx, root, cookie, verifier, 3).await.unwrap();
        for entry in &page.entries {
            seen.push(entry.name.clone());
            cookie = entry.cookie;
        }
        verifier = Some(page.verifier);
        if page.eof {
            break;
        }
    }
    let expected: Vec<String> = (0..10).map(|i| format!("f{i:02}")).collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn readdir_with_unknown_verifier_is_stale() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = fx.root().await;
    for i in 0..4 {
        fx.make_file(&format!("f{i}"), b"").await;
    }
    let page = fx.engine.readdir(&ctx, root, 0, None, 2).await.unwrap();
    let resume = page.entries.last().unwrap().cookie;

    let err = fx
        .engine
        .readdir(&ctx, root, resume, Some(page.verifier + 999), 2)
        .await
        .unwrap_err();
    assert_eq!(err, EngineError::StaleCookie);

    // the handed-out verifier still resumes, even after a mutation
    fx.make_file("later", b"").await;
    fx.engine.readdir(&ctx, root, resume, Some(page.verifier), 2).await.unwrap();
}

#[tokio::test]
async fn blocked_operations_reject_immediately() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = fx.root().await;
    let f = fx.make_file("f", b"data").await;

    let patch = SettingsPatch {
        blocked_operations: Some(vec![BlockedOp::Write, BlockedOp::Rename]),
        ..Default::default()
    };
    fx.settings.apply(&patch, false, false).unwrap();

    let err = fx.engine.write(&ctx, f, 0, b"x", quayfs::engine::Stability::Unstable).await;
    assert_eq!(err.unwrap_err(), EngineError::Blocked);
    let err =
        fx.engine.rename(&ctx, root, "f", root, "g", RenameFlags::default()).await.unwrap_err();
    assert_eq!(err, EngineError::Blocked);

    // reads are untouched, and the next settings change lifts the block
    assert_eq!(fx.read_all(f).await, b"data");
    fx.settings
        .apply(
            &SettingsPatch { blocked_operations: Some(vec![]), ..Default::default() },
            false,
            false,
        )
        .unwrap();
    fx.engine.write(&ctx, f, 0, b"x", quayfs::engine::Stability::Unstable).await.unwrap();
}

#[tokio::test]
async fn permission_bits_are_enforced_for_other_users() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let root = fx.root().await;
    let patch = SetAttrPatch { mode: Some(0o600), ..Default::default() };
    let (f, _) = fx
        .engine
        .create(&ctx, root, "private", &patch, CreateDisposition::Unchecked)
        .await
        .unwrap();
    fx.engine.write(&ctx, f, 0, b"secret", quayfs::engine::Stability::FileSync).await.unwrap();

    let other = fx.other_ctx();
    let err = fx.engine.read(&other, f, 0, 16).await.unwrap_err();
    assert_eq!(err, EngineError::Perm);

    // owner still reads
    assert_eq!(fx.read_all(f).await, b"secret");
}

#[tokio::test]
async fn chmod_projects_onto_acl_special_entries() {
    use quayfs::acl::{Ace, AceMask, Acl, Who};

    let fx = Fixture::new();
    let ctx = fx.ctx();
    let f = fx.make_file("f", b"").await;

    let mut acl = Acl::new();
    acl.push(Ace::allow(Who::Named(4242), AceMask::READ_DATA));
    acl.push(Ace::allow(Who::Owner, AceMask::READ_DATA | AceMask::WRITE_DATA));
    fx.engine.set_acl(&ctx, f, &acl).await.unwrap();

    let patch = SetAttrPatch { mode: Some(0o400), ..Default::default() };
    fx.engine.set_attr(&ctx, f, &patch).await.unwrap();

    let stored = fx.engine.get_acl(&ctx, f).await.unwrap().unwrap();
    // named entry survives, owner entry no longer grants write
    assert!(stored.iter().any(|a| a.who == Who::Named(4242)));
    let owner = stored.iter().find(|a| a.who == Who::Owner).unwrap();
    assert!(!owner.mask.contains(AceMask::WRITE_DATA));
    assert!(owner.mask.contains(AceMask::READ_DATA));
}

#[tokio::test]
async fn xattrs_round_trip() {
    let fx = Fixture::new();
    let ctx = fx.ctx();
    let f = fx.make_file("f", b"").await;

    fx.engine.set_xattr(&ctx, f, "user.note", b"hi").await.unwrap();
    assert_eq!(fx.engine.get_xattr(&ctx, f, "user.note").await.unwrap(), b"hi");
    assert_eq!(fx.engine.list_xattr(&ctx, f).await.unwrap(), vec!["user.note"]);
    fx.engine.remove_xattr(&ctx, f, "user.note").await.unwrap();
    assert_eq!(
        fx.engine.get_xattr(&ctx, f, "user.note").await.unwrap_err(),
        EngineError::NoEntry
    );
}
