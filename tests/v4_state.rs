mod support;

use std::sync::Arc;
use std::time::Duration;

use quayfs::dispatch::nfs4::{
    Compound, Nfs4Op, Nfs4ResOp, OpenCreate, OPEN4_SHARE_ACCESS_READ, OPEN4_SHARE_ACCESS_WRITE,
};
use quayfs::engine::Stability;
use quayfs::error::Nfs4Status;
use quayfs::ident::Credentials;
use quayfs::settings::Settings;
use quayfs::v4::{CallbackMsg, StateId};

use support::Fixture;

fn creds() -> Credentials {
    Credentials::Unix { uid: 1000, gid: 1000, gids: vec![1000] }
}

fn compound(minor: u32, ops: Vec<Nfs4Op>) -> Compound {
    Compound { tag: String::new(), minor, ops }
}

/// Establishes a confirmed v4.1 client with a session.
async fn session_for(fx: &Fixture, owner: &[u8]) -> (u64, [u8; 16]) {
    let dispatcher = quayfs::dispatch::nfs4::Nfs4Dispatcher::new(fx.svc.clone());
    let reply = dispatcher
        .handle(&creds(), compound(1, vec![Nfs4Op::ExchangeId {
            owner: owner.to_vec(),
            verifier: 1,
        }]))
        .await;
    let client_id = match reply.results[0] {
        Nfs4ResOp::ExchangeId { status, client_id, .. } => {
            assert_eq!(status, Nfs4Status::NFS4_OK);
            client_id
        }
        ref other => panic!("unexpected result {other:?}"),
    };
    let reply = dispatcher
        .handle(&creds(), compound(1, vec![Nfs4Op::CreateSession { client_id, sequence: 1 }]))
        .await;
    let session = match reply.results[0] {
        Nfs4ResOp::CreateSession { status, session } => {
            assert_eq!(status, Nfs4Status::NFS4_OK);
            session.unwrap()
        }
        ref other => panic!("unexpected result {other:?}"),
    };
    (client_id, session)
}

#[tokio::test]
async fn slot_replay_returns_identical_reply_without_reexecuting() {
    let fx = Fixture::new();
    let dispatcher = quayfs::dispatch::nfs4::Nfs4Dispatcher::new(fx.svc.clone());
    let (_client, session) = session_for(&fx, b"replay-client").await;

    let f = fx.make_file("f", b"").await;
    let fh = fx.fh(f);
    let write = compound(
        1,
        vec![
            Nfs4Op::Sequence { session, slot: 0, sequence: 1 },
            Nfs4Op::PutFh { fh: fh.clone() },
            Nfs4Op::Write {
                stateid: StateId::anonymous(),
                offset: 0,
                data: b"A".to_vec(),
                stable: Stability::FileSync,
            },
        ],
    );

    let first = dispatcher.handle(&creds(), write.clone()).await;
    assert_eq!(first.status, Nfs4Status::NFS4_OK);

    // byte-identical retransmission on the same slot and sequence
    let second = dispatcher.handle(&creds(), write).await;
    assert_eq!(first, second);
    assert!(Arc::ptr_eq(&first, &second));

    // the write executed exactly once
    assert_eq!(fx.read_all(f).await, b"A");
}

#[tokio::test]
async fn misordered_sequence_is_rejected() {
    let fx = Fixture::new();
    let dispatcher = quayfs::dispatch::nfs4::Nfs4Dispatcher::new(fx.svc.clone());
    let (_client, session) = session_for(&fx, b"seq-client").await;

    let reply = dispatcher
        .handle(
            &creds(),
            compound(1, vec![Nfs4Op::Sequence { session, slot: 0, sequence: 7 }]),
        )
        .await;
    assert_eq!(reply.status, Nfs4Status::NFS4ERR_SEQ_MISORDERED);
}

#[tokio::test]
async fn compound_short_circuits_on_first_error() {
    let fx = Fixture::new();
    let dispatcher = quayfs::dispatch::nfs4::Nfs4Dispatcher::new(fx.svc.clone());
    let (_client, session) = session_for(&fx, b"short-circuit").await;

    let root_fh = fx.fh(fx.root().await);
    let reply = dispatcher
        .handle(
            &creds(),
            compound(
                1,
                vec![
                    Nfs4Op::Sequence { session, slot: 0, sequence: 1 },
                    Nfs4Op::PutFh { fh: root_fh },
                    Nfs4Op::Lookup { name: "missing".into() },
                    Nfs4Op::Getattr,
                ],
            ),
        )
        .await;
    assert_eq!(reply.status, Nfs4Status::NFS4ERR_NOENT);
    // sequence + putfh + failed lookup; getattr never ran
    assert_eq!(reply.results.len(), 3);
}

#[tokio::test]
async fn open_write_close_through_compounds() {
    let fx = Fixture::new();
    let dispatcher = quayfs::dispatch::nfs4::Nfs4Dispatcher::new(fx.svc.clone());
    let (_client, session) = session_for(&fx, b"open-client").await;

    let root_fh = fx.fh(fx.root().await);
    let reply = dispatcher
        .handle(
            &creds(),
            compound(
                1,
                vec![
                    Nfs4Op::Sequence { session, slot: 0, sequence: 1 },
                    Nfs4Op::PutFh { fh: root_fh },
                    Nfs4Op::Open {
                        owner: b"owner-1".to_vec(),
                        client_id: None,
                        access: OPEN4_SHARE_ACCESS_WRITE | OPEN4_SHARE_ACCESS_READ,
                        deny: 0,
                        name: "created.txt".into(),
                        create: OpenCreate::Create {
                            disposition: quayfs::engine::CreateDisposition::Unchecked,
                            patch: Default::default(),
                        },
                    },
                    Nfs4Op::GetFh,
                ],
            ),
        )
        .await;
    assert_eq!(reply.status, Nfs4Status::NFS4_OK);
    let stateid = match &reply.results[2] {
        Nfs4ResOp::Open { stateid, .. } => stateid.unwrap(),
        other => panic!("unexpected result {other:?}"),
    };
    let fh = match &reply.results[3] {
        Nfs4ResOp::GetFh(_, Some(fh)) => fh.clone(),
        other => panic!("unexpected result {other:?}"),
    };

    let reply = dispatcher
        .handle(
            &creds(),
            compound(
                1,
                vec![
                    Nfs4Op::Sequence { session, slot: 0, sequence: 2 },
                    Nfs4Op::PutFh { fh: fh.clone() },
                    Nfs4Op::Write {
                        stateid,
                        offset: 0,
                        data: b"via compound".to_vec(),
                        stable: Stability::FileSync,
                    },
                    Nfs4Op::Close { stateid },
                ],
            ),
        )
        .await;
    assert_eq!(reply.status, Nfs4Status::NFS4_OK);

    let decoded = fx.svc.handles.decode(&fh).unwrap();
    assert_eq!(fx.read_all(decoded.inode).await, b"via compound");
}

#[tokio::test]
async fn lease_expiry_reaps_client_and_cascades_state() {
    let mut settings = Settings::default();
    settings.lease_time = 1;
    let fx = Fixture::with_settings(settings);
    let ctx = fx.ctx().with_client(0);
    let f = fx.make_file("f", b"data").await;

    let result = fx.v4.exchange_id(b"doomed", 9).unwrap();
    let client = result.client_id;
    fx.v4.create_session(client, 1).unwrap();

    // the client takes an open and a lock through the engine
    let open = fx
        .engine
        .open(
            &ctx,
            f,
            quayfs::engine::OpenOwner { client, owner: b"o".to_vec() },
            quayfs::engine::AccessBits::BOTH,
            quayfs::engine::AccessBits::BOTH,
        )
        .await
        .unwrap();
    let lock_owner = quayfs::engine::LockOwner { client, owner: b"o".to_vec() };
    fx.engine
        .lock(
            &ctx,
            f,
            &lock_owner,
            quayfs::engine::LockRange::new(0, 10),
            quayfs::engine::LockKind::Exclusive,
            false,
        )
        .await
        .unwrap();
    assert!(fx.engine.open_state(open.id).is_some());

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let reaped = fx.v4.reap_expired();
    assert_eq!(reaped, vec![client]);

    // open and lock are gone; another client takes both freely
    assert!(fx.engine.open_state(open.id).is_none());
    let other = fx.ctx().with_client(999);
    fx.engine
        .open(
            &other,
            f,
            quayfs::engine::OpenOwner { client: 999, owner: b"x".to_vec() },
            quayfs::engine::AccessBits::READ,
            quayfs::engine::AccessBits::NONE,
        )
        .await
        .unwrap();
    let other_owner = quayfs::engine::LockOwner { client: 999, owner: b"x".to_vec() };
    fx.engine
        .lock(
            &other,
            f,
            &other_owner,
            quayfs::engine::LockRange::new(0, 10),
            quayfs::engine::LockKind::Exclusive,
            false,
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn delegation_recall_on_conflicting_open() {
    let mut settings = Settings::default();
    settings.callback_timeout = 5;
    let fx = Arc::new(Fixture::with_settings(settings));
    let dispatcher = Arc::new(quayfs::dispatch::nfs4::Nfs4Dispatcher::new(fx.svc.clone()));
    fx.make_file("shared.txt", b"cached").await;

    let (c1, s1) = session_for(&fx, b"holder").await;
    let (_c2, s2) = session_for(&fx, b"challenger").await;
    let mut callbacks = fx.v4.client(c1).unwrap().take_callback().unwrap();

    // holder opens for read and receives a read delegation
    let root_fh = fx.fh(fx.root().await);
    let reply = dispatcher
        .handle(
            &creds(),
            compound(
                1,
                vec![
                    Nfs4Op::Sequence { session: s1, slot: 0, sequence: 1 },
                    Nfs4Op::PutFh { fh: root_fh.clone() },
                    Nfs4Op::Open {
                        owner: b"holder-owner".to_vec(),
                        client_id: None,
                        access: OPEN4_SHARE_ACCESS_READ,
                        deny: 0,
                        name: "shared.txt".into(),
                        create: OpenCreate::NoCreate,
                    },
                ],
            ),
        )
        .await;
    assert_eq!(reply.status, Nfs4Status::NFS4_OK);
    let delegation = match &reply.results[2] {
        Nfs4ResOp::Open { delegation, .. } => delegation.expect("read delegation granted").0,
        other => panic!("unexpected result {other:?}"),
    };

    // challenger opens for write; the server recalls the delegation
    let challenger = {
        let dispatcher = dispatcher.clone();
        let root_fh = root_fh.clone();
        tokio::spawn(async move {
            dispatcher
                .handle(
                    &creds(),
                    compound(
                        1,
                        vec![
                            Nfs4Op::Sequence { session: s2, slot: 0, sequence: 1 },
                            Nfs4Op::PutFh { fh: root_fh },
                            Nfs4Op::Open {
                                owner: b"challenger-owner".to_vec(),
                                client_id: None,
                                access: OPEN4_SHARE_ACCESS_WRITE,
                                deny: 0,
                                name: "shared.txt".into(),
                                create: OpenCreate::NoCreate,
                            },
                        ],
                    ),
                )
                .await
        })
    };

    // the recall lands on the holder's callback channel
    let msg = tokio::time::timeout(Duration::from_secs(2), callbacks.recv())
        .await
        .expect("recall delivered")
        .unwrap();
    let CallbackMsg::Recall { stateid, .. } = msg;
    assert_eq!(stateid.other, delegation.other);

    // holder returns the delegation; the challenger's open completes
    let reply = dispatcher
        .handle(
            &creds(),
            compound(
                1,
                vec![
                    Nfs4Op::Sequence { session: s1, slot: 0, sequence: 2 },
                    Nfs4Op::DelegReturn { stateid: delegation },
                ],
            ),
        )
        .await;
    assert_eq!(reply.status, Nfs4Status::NFS4_OK);

    let reply = challenger.await.unwrap();
    assert_eq!(reply.status, Nfs4Status::NFS4_OK);
}

#[tokio::test]
async fn pseudofs_walk_crosses_into_the_share() {
    let fx = Fixture::new();
    let dispatcher = quayfs::dispatch::nfs4::Nfs4Dispatcher::new(fx.svc.clone());
    let (_client, session) = session_for(&fx, b"walker").await;
    fx.make_file("hello.txt", b"walked").await;

    let reply = dispatcher
        .handle(
            &creds(),
            compound(
                1,
                vec![
                    Nfs4Op::Sequence { session, slot: 0, sequence: 1 },
                    Nfs4Op::PutRootFh,
                    Nfs4Op::Lookup { name: "export".into() },
                    Nfs4Op::Lookup { name: "hello.txt".into() },
                    Nfs4Op::GetFh,
                    Nfs4Op::Getattr,
                ],
            ),
        )
        .await;
    assert_eq!(reply.status, Nfs4Status::NFS4_OK);
    let fh = match &reply.results[4] {
        Nfs4ResOp::GetFh(_, Some(fh)) => fh.clone(),
        other => panic!("unexpected result {other:?}"),
    };
    let decoded = fx.svc.handles.decode(&fh).unwrap();
    assert!(!decoded.is_pseudo());
    assert_eq!(fx.read_all(decoded.inode).await, b"walked");

    match &reply.results[5] {
        Nfs4ResOp::Getattr(status, Some(attrs)) => {
            assert_eq!(*status, Nfs4Status::NFS4_OK);
            assert_eq!(attrs.size, 6);
        }
        other => panic!("unexpected result {other:?}"),
    }
}
