use crate::shardfs_test_server::ShardfsTestServer;
use serial_test::serial;
use shardfs::client::CoordinatorClient;
use shardfs::path::LogicalPath;
use shardfs::placement::ShardId;
use std::collections::BTreeMap;
use std::fs;
use tempfile::tempdir;

mod shardfs_test_server;

#[test]
#[serial]
fn test_serves_all_shards() {
    let server = ShardfsTestServer::default().wait_until_ready().unwrap();
    let sources = tempdir().unwrap();
    let files: Vec<_> = ["main.c", "paper.pdf", "notes.txt", "bundle.zip"]
        .into_iter()
        .map(|name| {
            let path = sources.path().join(name);
            fs::write(&path, name).unwrap();
            path
        })
        .collect();

    let mut client = CoordinatorClient::connect(ShardfsTestServer::addr(ShardId::S1)).unwrap();
    let dest = LogicalPath::parse("~S1/data").unwrap();
    assert_eq!(
        client.upload(&files[..3], &dest).unwrap(),
        "Successfully processed 3 out of 3 files"
    );
    assert_eq!(
        client.upload(&files[3..], &dest).unwrap(),
        "Successfully processed 1 out of 1 files"
    );
    assert_eq!(
        client.list(&dest).unwrap(),
        "Files found: 4 (.c: 1, .pdf: 1, .txt: 1, .zip: 1)\n\
         main.c\npaper.pdf\nnotes.txt\nbundle.zip\n"
    );
    for (name, shard) in [
        ("main.c", ShardId::S1),
        ("paper.pdf", ShardId::S2),
        ("notes.txt", ShardId::S3),
        ("bundle.zip", ShardId::S4),
    ] {
        assert_eq!(
            fs::read_to_string(server.root(shard).join("data").join(name)).unwrap(),
            name
        );
    }
}

#[test]
#[serial]
fn test_rejects_coordinator_shard_as_node() {
    let server = ShardfsTestServer::new(&["node", "S1"], &BTreeMap::default());
    assert!(!server.wait_for_exit().unwrap());
}

#[test]
#[serial]
fn test_rejects_invalid_log_level() {
    let server = ShardfsTestServer::new(
        &["coordinator"],
        &BTreeMap::from([("SHARDFS_LOG_LEVEL".to_string(), "chatty".to_string())]),
    );
    assert!(!server.wait_for_exit().unwrap());
}
