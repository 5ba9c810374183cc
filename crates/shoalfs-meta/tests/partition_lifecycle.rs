//! End-to-end lifecycle tests across the public partition surface:
//! inode lifecycle through trash and reclamation, replay determinism,
//! and follower snapshot joins.

use std::sync::{Arc, Mutex};

use shoalfs_meta::config::{NodeConfig, PartitionMeta};
use shoalfs_meta::reclaim::{ExtentDeleter, Reclaimer};
use shoalfs_meta::snapshot;
use shoalfs_meta::{
    CommandEnvelope, ExtentKey, InodeId, MemBackend, MetaCommand, MetaError, Partition,
    PartitionId, Status,
};

const TS: u64 = 1_700_000_000;

fn open_partition(dir: &std::path::Path) -> Arc<Partition> {
    let meta = PartitionMeta {
        partition_id: PartitionId::new(1),
        volume: "vol".to_string(),
        start: 1,
        end: 1_000,
        peers: vec![],
    };
    Partition::open(
        dir,
        meta,
        &NodeConfig::default(),
        Arc::new(MemBackend::new()),
        TS,
    )
    .unwrap()
}

fn submit(p: &Partition, cmd: MetaCommand) -> shoalfs_meta::ApplyResult {
    p.submit(CommandEnvelope::internal("10.0.0.1:9021", cmd))
        .unwrap()
}

fn create_file(p: &Partition) -> InodeId {
    let res = submit(
        p,
        MetaCommand::CreateInode {
            mode: 0o100644,
            uid: 1000,
            gid: 1000,
            target: vec![],
            ts: TS,
        },
    );
    assert_eq!(res.status, Status::Ok);
    res.inode.unwrap().ino
}

/// Records every delete batch; all partitions succeed.
#[derive(Default)]
struct AckAllDeleter {
    calls: Mutex<Vec<(u64, usize)>>,
}

impl ExtentDeleter for AckAllDeleter {
    fn delete_extents(&self, dp: u64, extents: &[ExtentKey]) -> Result<(), MetaError> {
        self.calls.lock().unwrap().push((dp, extents.len()));
        Ok(())
    }
}

#[test]
fn create_unlink_evict_clean_reaches_empty_trash() {
    let dir = tempfile::tempdir().unwrap();
    let p = open_partition(dir.path());
    let ino = create_file(&p);
    assert_eq!(p.stat_fs().unwrap().inode_count, 1);

    assert_eq!(
        submit(&p, MetaCommand::UnlinkInode { ino, ts: TS + 1 }).status,
        Status::Ok
    );
    let stat = p.stat_fs().unwrap();
    assert_eq!(stat.inode_count, 0);
    assert_eq!(stat.deleted_inode_count, 1);
    let (_, trash) = p.deleted_inode_get(ino).unwrap();
    assert!(!trash.unwrap().is_expired);

    assert_eq!(
        submit(&p, MetaCommand::EvictInode { ino }).status,
        Status::Ok
    );
    let (_, trash) = p.deleted_inode_get(ino).unwrap();
    assert!(trash.unwrap().is_expired);
    assert!(p.applier().free_list().contains(ino));

    let deleter = Arc::new(AckAllDeleter::default());
    let reclaimer = Reclaimer::new(p.clone(), deleter.clone(), NodeConfig::default().reclaim);
    let stats = reclaimer.run_cycle(TS + 2).unwrap();
    assert_eq!(stats.cleaned, 1);
    assert_eq!(p.stat_fs().unwrap().deleted_inode_count, 0);
    // No extents, so no data-node traffic.
    assert!(deleter.calls.lock().unwrap().is_empty());
}

#[test]
fn directory_unlink_requires_empty() {
    let dir = tempfile::tempdir().unwrap();
    let p = open_partition(dir.path());
    let dir_res = submit(
        &p,
        MetaCommand::CreateInode {
            mode: 0o040755,
            uid: 0,
            gid: 0,
            target: vec![],
            ts: TS,
        },
    );
    let dir_ino = dir_res.inode.unwrap().ino;
    let child = create_file(&p);
    submit(
        &p,
        MetaCommand::CreateDentry {
            dentry: shoalfs_meta::Dentry {
                parent: dir_ino,
                name: "a".to_string(),
                ino: child,
                dtype: 0o100000,
            },
            ts: TS,
        },
    );

    assert_eq!(
        submit(&p, MetaCommand::UnlinkInode { ino: dir_ino, ts: TS }).status,
        Status::Exists
    );
    submit(
        &p,
        MetaCommand::DeleteDentry {
            parent: dir_ino,
            name: "a".to_string(),
            ts: TS,
        },
    );
    submit(&p, MetaCommand::UnlinkInode { ino: child, ts: TS });
    assert_eq!(
        submit(&p, MetaCommand::UnlinkInode { ino: dir_ino, ts: TS }).status,
        Status::Ok
    );
}

#[test]
fn identical_command_streams_yield_identical_trees() {
    // Two replicas applying the same ordered stream must match CRC for
    // CRC, which is what crash replay relies on.
    let commands: Vec<MetaCommand> = vec![
        MetaCommand::CreateInode {
            mode: 0o100644,
            uid: 1,
            gid: 1,
            target: vec![],
            ts: TS,
        },
        MetaCommand::CreateInode {
            mode: 0o040755,
            uid: 1,
            gid: 1,
            target: vec![],
            ts: TS + 1,
        },
        MetaCommand::CreateDentry {
            dentry: shoalfs_meta::Dentry {
                parent: InodeId::new(2),
                name: "f".to_string(),
                ino: InodeId::new(1),
                dtype: 0o100000,
            },
            ts: TS + 2,
        },
        MetaCommand::ExtentAppend {
            ino: InodeId::new(1),
            extent: ExtentKey {
                file_offset: 0,
                partition_id: 9,
                extent_id: 4,
                extent_offset: 0,
                size: 512,
                crc: 77,
            },
            ts: TS + 3,
        },
        MetaCommand::SetXAttr {
            ino: InodeId::new(1),
            key: "user.tag".to_string(),
            value: b"x".to_vec(),
        },
        MetaCommand::DeleteDentry {
            parent: InodeId::new(2),
            name: "f".to_string(),
            ts: TS + 4,
        },
        MetaCommand::UnlinkInode {
            ino: InodeId::new(1),
            ts: TS + 5,
        },
        MetaCommand::EvictInode {
            ino: InodeId::new(1),
        },
    ];

    let dir_a = tempfile::tempdir().unwrap();
    let dir_b = tempfile::tempdir().unwrap();
    let a = open_partition(dir_a.path());
    let b = open_partition(dir_b.path());
    for cmd in &commands {
        submit(&a, cmd.clone());
        submit(&b, cmd.clone());
    }

    let stat_a = a.stat_fs().unwrap();
    let stat_b = b.stat_fs().unwrap();
    assert_eq!(stat_a.applied_index, stat_b.applied_index);
    assert_eq!(stat_a.live_size, stat_b.live_size);
    assert_eq!(stat_a.deleted_size, stat_b.deleted_size);
    assert_eq!(
        snapshot::tree_crcs(a.applier().backend().as_ref()).unwrap(),
        snapshot::tree_crcs(b.applier().backend().as_ref()).unwrap()
    );
}

#[test]
fn follower_snapshot_join_matches_leader() {
    let dir_a = tempfile::tempdir().unwrap();
    let leader = open_partition(dir_a.path());
    for _ in 0..10 {
        create_file(&leader);
    }
    let ino = InodeId::new(3);
    submit(&leader, MetaCommand::UnlinkInode { ino, ts: TS + 1 });
    submit(
        &leader,
        MetaCommand::SetXAttr {
            ino: InodeId::new(4),
            key: "user.a".to_string(),
            value: vec![1],
        },
    );

    for version in [snapshot::VERSION_V1, snapshot::VERSION_V2] {
        let items = leader.build_snapshot(version).unwrap();
        let wire = snapshot::encode(&items, version);
        let received = snapshot::decode(&wire).unwrap();

        let dir_b = tempfile::tempdir().unwrap();
        let follower = open_partition(dir_b.path());
        follower.install_snapshot(&received).unwrap();

        assert_eq!(
            snapshot::tree_crcs(leader.applier().backend().as_ref()).unwrap(),
            snapshot::tree_crcs(follower.applier().backend().as_ref()).unwrap()
        );
        assert_eq!(
            leader.stat_fs().unwrap().applied_index,
            follower.stat_fs().unwrap().applied_index
        );
    }
}

#[test]
fn replayed_fingerprint_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let p = open_partition(dir.path());
    let env = CommandEnvelope {
        from: "10.0.0.1:9021".to_string(),
        command: MetaCommand::CreateInode {
            mode: 0o100644,
            uid: 0,
            gid: 0,
            target: vec![],
            ts: TS,
        },
        fingerprint: Some(shoalfs_meta::RequestFingerprint {
            client_id: 11,
            client_start: TS,
            request_id: 1,
            client_ip: 0x0a000001,
            payload_crc: 42,
        }),
    };
    let first = p.submit(env.clone()).unwrap();
    let before = snapshot::tree_crcs(p.applier().backend().as_ref()).unwrap();
    for _ in 0..3 {
        let retry = p.submit(env.clone()).unwrap();
        assert_eq!(retry.status, first.status);
    }
    let after = snapshot::tree_crcs(p.applier().backend().as_ref()).unwrap();
    assert_eq!(before, after);
    assert_eq!(p.stat_fs().unwrap().inode_count, 1);
}

#[test]
fn trash_recover_restores_file() {
    let dir = tempfile::tempdir().unwrap();
    let p = open_partition(dir.path());
    let ino = create_file(&p);
    submit(&p, MetaCommand::UnlinkInode { ino, ts: TS + 1 });
    assert_eq!(p.stat_fs().unwrap().deleted_inode_count, 1);

    let res = submit(&p, MetaCommand::RecoverDeletedInode { ino });
    assert_eq!(res.status, Status::Ok);
    assert_eq!(res.inode.as_ref().unwrap().nlink, 1);
    let stat = p.stat_fs().unwrap();
    assert_eq!(stat.inode_count, 1);
    assert_eq!(stat.deleted_inode_count, 0);
}
