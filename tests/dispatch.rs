mod support;

use std::collections::HashMap;

use quayfs::dispatch::mount::{MountDispatcher, MountReply, MountRequest, MountStatus};
use quayfs::dispatch::nfs3::{DupCache, Nfs3Dispatcher, Nfs3Reply, Nfs3Request};
use quayfs::dispatch::smb2::{
    Smb2Dispatcher, Smb2Reply, Smb2Request, SmbCreateDisposition, ACCESS_READ, ACCESS_WRITE,
    DIALECT_202, DIALECT_210, FILE_SHARE_READ, FILE_SHARE_WRITE,
};
use quayfs::engine::{CreateDisposition, Stability};
use quayfs::error::{ntstatus, Nfs3Status};
use quayfs::ident::{smb_proof, Credentials, User};
use quayfs::inode::SetAttrPatch;
use sha2::{Digest, Sha256};

use support::Fixture;

fn creds() -> Credentials {
    Credentials::Unix { uid: 1000, gid: 1000, gids: vec![1000] }
}

fn add_smb_user(fx: &Fixture, name: &str, password: &[u8]) {
    let mut hasher = Sha256::new();
    hasher.update(password);
    fx.registry.add_user(User {
        name: name.to_string(),
        uid: 1000,
        gid: 1000,
        member_groups: vec![1000],
        password_hash: Some(hasher.finalize().into()),
        share_permissions: HashMap::new(),
    });
}

/// Authenticates an SMB session and connects a tree to `/export`.
async fn smb_session(dispatcher: &Smb2Dispatcher, password: &[u8]) -> (u64, u32) {
    let reply = dispatcher
        .handle(Smb2Request::Negotiate { dialects: vec![DIALECT_202, DIALECT_210] })
        .await;
    assert_eq!(
        reply,
        Smb2Reply::Negotiate { status: ntstatus::STATUS_SUCCESS, dialect: DIALECT_210 }
    );

    let reply = dispatcher
        .handle(Smb2Request::SessionSetup {
            session: None,
            user: "alice".into(),
            proof: None,
        })
        .await;
    let (session, challenge) = match reply {
        Smb2Reply::SessionSetup { status, session, challenge } => {
            assert_eq!(status, ntstatus::STATUS_MORE_PROCESSING_REQUIRED);
            (session, challenge.unwrap())
        }
        other => panic!("unexpected reply {other:?}"),
    };

    let mut hasher = Sha256::new();
    hasher.update(password);
    let hash: [u8; 32] = hasher.finalize().into();
    let reply = dispatcher
        .handle(Smb2Request::SessionSetup {
            session: Some(session),
            user: "alice".into(),
            proof: Some(smb_proof(&challenge, &hash)),
        })
        .await;
    assert_eq!(
        reply,
        Smb2Reply::SessionSetup {
            status: ntstatus::STATUS_SUCCESS,
            session,
            challenge: None
        }
    );

    let reply = dispatcher
        .handle(Smb2Request::TreeConnect { session, path: "\\\\server\\export".into() })
        .await;
    let tree = match reply {
        Smb2Reply::TreeConnect { status, tree } => {
            assert_eq!(status, ntstatus::STATUS_SUCCESS);
            tree
        }
        other => panic!("unexpected reply {other:?}"),
    };
    (session, tree)
}

#[tokio::test]
async fn nfs3_lookup_maps_errors_to_protocol_codes() {
    let fx = Fixture::new();
    let dispatcher = Nfs3Dispatcher::new(fx.svc.clone());
    let dup = DupCache::default();
    let root_fh = fx.fh(fx.root().await);

    let reply = dispatcher
        .handle(&dup, 1, &creds(), Nfs3Request::Lookup {
            dir: root_fh.clone(),
            name: "missing".into(),
        })
        .await;
    match &*reply {
        Nfs3Reply::Lookup { status, .. } => assert_eq!(*status, Nfs3Status::NFS3ERR_NOENT),
        other => panic!("unexpected reply {other:?}"),
    }

    // a stale handle from another boot decodes as NFS3ERR_STALE
    let bogus = vec![0u8; 32];
    let reply = dispatcher
        .handle(&dup, 2, &creds(), Nfs3Request::GetAttr { fh: bogus })
        .await;
    match &*reply {
        Nfs3Reply::GetAttr { status, .. } => assert_eq!(*status, Nfs3Status::NFS3ERR_STALE),
        other => panic!("unexpected reply {other:?}"),
    }

    // names with slashes are rejected before touching the store
    let reply = dispatcher
        .handle(&dup, 3, &creds(), Nfs3Request::Lookup {
            dir: root_fh,
            name: "a/b".into(),
        })
        .await;
    match &*reply {
        Nfs3Reply::Lookup { status, .. } => assert_eq!(*status, Nfs3Status::NFS3ERR_INVAL),
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn nfs3_duplicate_request_cache_replays_the_reply() {
    let fx = Fixture::new();
    let dispatcher = Nfs3Dispatcher::new(fx.svc.clone());
    let dup = DupCache::default();
    let root_fh = fx.fh(fx.root().await);

    let request = Nfs3Request::Create {
        dir: root_fh,
        name: "once".into(),
        disposition: CreateDisposition::Guarded,
        patch: SetAttrPatch::default(),
    };
    let first = dispatcher.handle(&dup, 77, &creds(), request.clone()).await;
    match &*first {
        Nfs3Reply::Create { status, .. } => assert_eq!(*status, Nfs3Status::NFS3_OK),
        other => panic!("unexpected reply {other:?}"),
    }

    // the retransmission replays the cached reply instead of failing with
    // a guarded-create collision
    let second = dispatcher.handle(&dup, 77, &creds(), request.clone()).await;
    assert!(std::sync::Arc::ptr_eq(&first, &second));

    // a different connection's cache re-executes and sees the collision
    let other_dup = DupCache::default();
    let third = dispatcher.handle(&other_dup, 77, &creds(), request).await;
    match &*third {
        Nfs3Reply::Create { status, .. } => assert_eq!(*status, Nfs3Status::NFS3ERR_EXIST),
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn nfs3_write_then_readdirplus_shows_the_file() {
    let fx = Fixture::new();
    let dispatcher = Nfs3Dispatcher::new(fx.svc.clone());
    let dup = DupCache::default();
    let root_fh = fx.fh(fx.root().await);

    let reply = dispatcher
        .handle(&dup, 1, &creds(), Nfs3Request::Create {
            dir: root_fh.clone(),
            name: "hello.txt".into(),
            disposition: CreateDisposition::Unchecked,
            patch: SetAttrPatch::default(),
        })
        .await;
    let fh = match &*reply {
        Nfs3Reply::Create { status, fh, .. } => {
            assert_eq!(*status, Nfs3Status::NFS3_OK);
            fh.clone().unwrap()
        }
        other => panic!("unexpected reply {other:?}"),
    };

    let reply = dispatcher
        .handle(&dup, 2, &creds(), Nfs3Request::Write {
            fh: fh.clone(),
            offset: 0,
            data: b"hello".to_vec(),
            stable: Stability::FileSync,
        })
        .await;
    match &*reply {
        Nfs3Reply::Write { status, count, verifier, .. } => {
            assert_eq!(*status, Nfs3Status::NFS3_OK);
            assert_eq!(*count, 5);
            assert_eq!(*verifier, fx.engine.write_verifier());
        }
        other => panic!("unexpected reply {other:?}"),
    }

    let reply = dispatcher
        .handle(&dup, 3, &creds(), Nfs3Request::ReadDirPlus {
            fh: root_fh,
            cookie: 0,
            verifier: 0,
            count: 32,
        })
        .await;
    match &*reply {
        Nfs3Reply::ReadDirPlus { status, entries, eof, .. } => {
            assert_eq!(*status, Nfs3Status::NFS3_OK);
            assert!(*eof);
            let entry = entries.iter().find(|e| e.name == "hello.txt").unwrap();
            assert_eq!(entry.attrs.size, 5);
            assert_eq!(entry.fh, fh);
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn mount_export_and_mnt_produce_usable_root_handle() {
    let fx = Fixture::new();
    let mount = MountDispatcher::new(fx.svc.clone());

    let reply = mount.handle("10.0.0.1:900", &creds(), MountRequest::Export).await;
    assert_eq!(reply, MountReply::Export { exports: vec!["/export".into()] });

    let reply = mount
        .handle("10.0.0.1:900", &creds(), MountRequest::Mnt { path: "/export".into() })
        .await;
    let fh = match reply {
        MountReply::Mnt { status, fh, auth_flavors } => {
            assert_eq!(status, MountStatus::Ok);
            assert_eq!(auth_flavors, vec![quayfs::dispatch::mount::AUTH_SYS]);
            fh.unwrap()
        }
        other => panic!("unexpected reply {other:?}"),
    };
    assert_eq!(mount.mount_count(), 1);

    // the returned handle works against the NFS dispatcher
    let nfs3 = Nfs3Dispatcher::new(fx.svc.clone());
    let dup = DupCache::default();
    let reply = nfs3.handle(&dup, 9, &creds(), Nfs3Request::GetAttr { fh }).await;
    match &*reply {
        Nfs3Reply::GetAttr { status, attrs } => {
            assert_eq!(*status, Nfs3Status::NFS3_OK);
            assert!(attrs.is_some());
        }
        other => panic!("unexpected reply {other:?}"),
    }

    let reply = mount
        .handle("10.0.0.1:900", &creds(), MountRequest::Umnt { path: "/export".into() })
        .await;
    assert_eq!(reply, MountReply::Umnt);
    assert_eq!(mount.mount_count(), 0);

    let reply = mount
        .handle("10.0.0.1:900", &creds(), MountRequest::Mnt { path: "/nope".into() })
        .await;
    match reply {
        MountReply::Mnt { status, .. } => assert_eq!(status, MountStatus::NoEnt),
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn smb2_full_file_round_trip() {
    let fx = Fixture::new();
    add_smb_user(&fx, "alice", b"hunter2");
    let smb = Smb2Dispatcher::new(fx.svc.clone());
    let (session, tree) = smb_session(&smb, b"hunter2").await;

    let reply = smb
        .handle(Smb2Request::Create {
            session,
            tree,
            path: "docs\\note.txt".into(),
            access: ACCESS_READ | ACCESS_WRITE,
            share_access: FILE_SHARE_READ | FILE_SHARE_WRITE,
            disposition: SmbCreateDisposition::Create,
        })
        .await;
    // intermediate directory is missing
    match reply {
        Smb2Reply::Create { status, .. } => {
            assert_eq!(status, ntstatus::STATUS_OBJECT_NAME_NOT_FOUND)
        }
        other => panic!("unexpected reply {other:?}"),
    }

    let reply = smb
        .handle(Smb2Request::Create {
            session,
            tree,
            path: "note.txt".into(),
            access: ACCESS_READ | ACCESS_WRITE,
            share_access: FILE_SHARE_READ | FILE_SHARE_WRITE,
            disposition: SmbCreateDisposition::Create,
        })
        .await;
    let file = match reply {
        Smb2Reply::Create { status, file, .. } => {
            assert_eq!(status, ntstatus::STATUS_SUCCESS);
            file
        }
        other => panic!("unexpected reply {other:?}"),
    };

    let reply = smb
        .handle(Smb2Request::Write { session, file, offset: 0, data: b"smb data".to_vec() })
        .await;
    assert_eq!(reply, Smb2Reply::Write { status: ntstatus::STATUS_SUCCESS, count: 8 });

    let reply = smb.handle(Smb2Request::Flush { session, file }).await;
    assert_eq!(reply, Smb2Reply::Flush { status: ntstatus::STATUS_SUCCESS });

    let reply = smb.handle(Smb2Request::Read { session, file, offset: 0, count: 64 }).await;
    match reply {
        Smb2Reply::Read { status, data, .. } => {
            assert_eq!(status, ntstatus::STATUS_SUCCESS);
            assert_eq!(data, b"smb data");
        }
        other => panic!("unexpected reply {other:?}"),
    }

    let reply = smb.handle(Smb2Request::Close { session, file }).await;
    assert_eq!(reply, Smb2Reply::Close { status: ntstatus::STATUS_SUCCESS });
}

#[tokio::test]
async fn smb2_wrong_password_is_logon_failure() {
    let fx = Fixture::new();
    add_smb_user(&fx, "alice", b"correct");
    let smb = Smb2Dispatcher::new(fx.svc.clone());

    let reply = smb
        .handle(Smb2Request::SessionSetup {
            session: None,
            user: "alice".into(),
            proof: None,
        })
        .await;
    let (session, challenge) = match reply {
        Smb2Reply::SessionSetup { session, challenge, .. } => (session, challenge.unwrap()),
        other => panic!("unexpected reply {other:?}"),
    };

    let mut hasher = Sha256::new();
    hasher.update(b"wrong");
    let hash: [u8; 32] = hasher.finalize().into();
    let reply = smb
        .handle(Smb2Request::SessionSetup {
            session: Some(session),
            user: "alice".into(),
            proof: Some(smb_proof(&challenge, &hash)),
        })
        .await;
    match reply {
        Smb2Reply::SessionSetup { status, .. } => {
            assert_eq!(status, ntstatus::STATUS_LOGON_FAILURE)
        }
        other => panic!("unexpected reply {other:?}"),
    }

    // an unauthenticated session cannot connect a tree
    let reply = smb
        .handle(Smb2Request::TreeConnect { session, path: "/export".into() })
        .await;
    match reply {
        Smb2Reply::TreeConnect { status, .. } => {
            assert_eq!(status, ntstatus::STATUS_ACCESS_DENIED)
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn nfs_write_is_visible_over_smb_within_the_bound() {
    let fx = Fixture::new();
    add_smb_user(&fx, "alice", b"pw");
    let nfs3 = Nfs3Dispatcher::new(fx.svc.clone());
    let smb = Smb2Dispatcher::new(fx.svc.clone());
    let dup = DupCache::default();
    let root_fh = fx.fh(fx.root().await);

    // NFS client writes "hello" with a committing write
    let reply = nfs3
        .handle(&dup, 1, &creds(), Nfs3Request::Create {
            dir: root_fh,
            name: "f".into(),
            disposition: CreateDisposition::Unchecked,
            patch: SetAttrPatch::default(),
        })
        .await;
    let fh = match &*reply {
        Nfs3Reply::Create { fh, .. } => fh.clone().unwrap(),
        other => panic!("unexpected reply {other:?}"),
    };
    nfs3.handle(&dup, 2, &creds(), Nfs3Request::Write {
        fh: fh.clone(),
        offset: 0,
        data: b"hello".to_vec(),
        stable: Stability::FileSync,
    })
    .await;

    // an SMB client immediately observes the content and size
    let (session, tree) = smb_session(&smb, b"pw").await;
    let reply = smb
        .handle(Smb2Request::Create {
            session,
            tree,
            path: "f".into(),
            access: ACCESS_READ,
            share_access: FILE_SHARE_READ | FILE_SHARE_WRITE,
            disposition: SmbCreateDisposition::Open,
        })
        .await;
    let file = match reply {
        Smb2Reply::Create { status, file, attrs } => {
            assert_eq!(status, ntstatus::STATUS_SUCCESS);
            assert_eq!(attrs.unwrap().size, 5);
            file
        }
        other => panic!("unexpected reply {other:?}"),
    };
    let reply = smb.handle(Smb2Request::Read { session, file, offset: 0, count: 64 }).await;
    match reply {
        Smb2Reply::Read { data, .. } => assert_eq!(data, b"hello"),
        other => panic!("unexpected reply {other:?}"),
    }

    // and the NFS view of the size agrees
    let reply = nfs3.handle(&dup, 3, &creds(), Nfs3Request::GetAttr { fh }).await;
    match &*reply {
        Nfs3Reply::GetAttr { attrs, .. } => assert_eq!(attrs.as_ref().unwrap().size, 5),
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn smb2_directory_enumeration_pages_until_exhausted() {
    let fx = Fixture::new();
    add_smb_user(&fx, "alice", b"pw");
    for i in 0..3 {
        fx.make_file(&format!("doc{i}"), b"x").await;
    }
    let smb = Smb2Dispatcher::new(fx.svc.clone());
    let (session, tree) = smb_session(&smb, b"pw").await;

    // an empty path opens the share root as an enumeration handle
    let reply = smb
        .handle(Smb2Request::Create {
            session,
            tree,
            path: "".into(),
            access: ACCESS_READ,
            share_access: FILE_SHARE_READ | FILE_SHARE_WRITE,
            disposition: SmbCreateDisposition::Open,
        })
        .await;
    let dir = match reply {
        Smb2Reply::Create { status, file, .. } => {
            assert_eq!(status, ntstatus::STATUS_SUCCESS);
            file
        }
        other => panic!("unexpected reply {other:?}"),
    };

    let reply = smb
        .handle(Smb2Request::QueryDirectory { session, file: dir, restart: false })
        .await;
    match reply {
        Smb2Reply::QueryDirectory { status, entries } => {
            assert_eq!(status, ntstatus::STATUS_SUCCESS);
            let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
            assert_eq!(names, vec!["doc0", "doc1", "doc2"]);
        }
        other => panic!("unexpected reply {other:?}"),
    }

    // the cursor is exhausted
    let reply = smb
        .handle(Smb2Request::QueryDirectory { session, file: dir, restart: false })
        .await;
    match reply {
        Smb2Reply::QueryDirectory { status, .. } => {
            assert_eq!(status, ntstatus::STATUS_NO_MORE_FILES)
        }
        other => panic!("unexpected reply {other:?}"),
    }

    // restart rewinds it
    let reply = smb
        .handle(Smb2Request::QueryDirectory { session, file: dir, restart: true })
        .await;
    match reply {
        Smb2Reply::QueryDirectory { status, entries } => {
            assert_eq!(status, ntstatus::STATUS_SUCCESS);
            assert_eq!(entries.len(), 3);
        }
        other => panic!("unexpected reply {other:?}"),
    }
}

#[tokio::test]
async fn smb2_share_deny_blocks_second_session() {
    let fx = Fixture::new();
    add_smb_user(&fx, "alice", b"pw");
    let smb = Smb2Dispatcher::new(fx.svc.clone());

    let (s1, t1) = smb_session(&smb, b"pw").await;
    let reply = smb
        .handle(Smb2Request::Create {
            session: s1,
            tree: t1,
            path: "locked.txt".into(),
            access: ACCESS_READ | ACCESS_WRITE,
            // share nothing: deny read and write to others
            share_access: 0,
            disposition: SmbCreateDisposition::OpenIf,
        })
        .await;
    match reply {
        Smb2Reply::Create { status, .. } => assert_eq!(status, ntstatus::STATUS_SUCCESS),
        other => panic!("unexpected reply {other:?}"),
    }

    let (s2, t2) = smb_session(&smb, b"pw").await;
    let reply = smb
        .handle(Smb2Request::Create {
            session: s2,
            tree: t2,
            path: "locked.txt".into(),
            access: ACCESS_READ,
            share_access: FILE_SHARE_READ | FILE_SHARE_WRITE,
            disposition: SmbCreateDisposition::Open,
        })
        .await;
    match reply {
        Smb2Reply::Create { status, .. } => {
            assert_eq!(status, ntstatus::STATUS_SHARING_VIOLATION)
        }
        other => panic!("unexpected reply {other:?}"),
    }
}
