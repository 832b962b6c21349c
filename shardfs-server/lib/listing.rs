//! Aggregation of the directory listings of all shards.

use shardfs::client::NodeClient;
use shardfs::error::ShardError;
use shardfs::path::LogicalPath;
use shardfs::placement::ShardId;
use shardfs::report::{Listing, NodeListing};
use shardfs::storage::filesystem::FilesystemStorage;
use std::thread;
use tracing::{debug, warn};

/// Lists `path` on the local shard and on every storage node.
///
/// The nodes are queried concurrently. Sources appear in the fixed shard order, local shard
/// first. A source that cannot answer contributes no entries.
pub fn aggregate(local: &FilesystemStorage, nodes: &[NodeClient], path: &LogicalPath) -> Listing {
    let remote: Vec<(ShardId, Vec<String>)> = thread::scope(|scope| {
        let handles: Vec<_> = nodes
            .iter()
            .map(|node| (node.shard(), scope.spawn(move || list_remote(node, path))))
            .collect();
        handles
            .into_iter()
            .map(|(shard, handle)| (shard, handle.join().unwrap_or_default()))
            .collect()
    });

    let mut listing = Listing::new();
    listing.push(ShardId::S1, list_local(local, path));
    for shard in ShardId::REMOTE {
        let names = remote
            .iter()
            .find(|(source, _)| *source == shard)
            .map(|(_, names)| names.clone())
            .unwrap_or_default();
        listing.push(shard, names);
    }
    listing
}

fn list_local(storage: &FilesystemStorage, path: &LogicalPath) -> Vec<String> {
    match storage.list(path, |name| ShardId::S1.matches_listing(name)) {
        Ok(names) => names,
        Err(ShardError::NotFound) => {
            debug!(%path, "directory to list not found in local shard");
            Vec::new()
        }
        Err(err) => {
            warn!(%path, "failed to list local shard: {err}");
            Vec::new()
        }
    }
}

fn list_remote(node: &NodeClient, path: &LogicalPath) -> Vec<String> {
    match node.list(path) {
        Ok(NodeListing::Found(names)) => names,
        Ok(NodeListing::DirectoryNotFound) => {
            debug!(shard = %node.shard(), %path, "directory to list not found");
            Vec::new()
        }
        Err(err) => {
            warn!(shard = %node.shard(), %path, "failed to list storage node: {err}");
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::net::TcpListener;
    use tempfile::tempdir;

    fn unused_addr() -> std::net::SocketAddr {
        TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
    }

    #[test]
    fn test_unreachable_nodes_contribute_nothing() {
        let tempdir = tempdir().unwrap();
        fs::create_dir(tempdir.path().join("src")).unwrap();
        for name in ["b.c", "a.c", "notes.txt"] {
            fs::write(tempdir.path().join("src").join(name), "").unwrap();
        }
        let storage = FilesystemStorage::new(tempdir.path().to_path_buf());
        let nodes: Vec<_> = ShardId::REMOTE
            .into_iter()
            .map(|shard| NodeClient::new(shard, unused_addr()))
            .collect();

        let listing = aggregate(&storage, &nodes, &LogicalPath::parse("~S1/src").unwrap());
        assert_eq!(listing.total(), 2);
        assert_eq!(listing.count(ShardId::S1), 2);
        assert_eq!(listing.names().collect::<Vec<_>>(), vec!["a.c", "b.c"]);
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let tempdir = tempdir().unwrap();
        let storage = FilesystemStorage::new(tempdir.path().to_path_buf());
        let listing = aggregate(&storage, &[], &LogicalPath::parse("~S1/missing").unwrap());
        assert_eq!(listing.total(), 0);
        assert_eq!(
            listing.to_string(),
            "No files found in the specified directory"
        );
    }
}
