//! The placement policy: a static mapping from file extension to the shard that stores the file.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

/// Number of leading bytes needed by [ShardId::signature_matches].
pub const SIGNATURE_LEN: usize = 4;

const PDF_SIGNATURE: &[u8] = b"%PDF";
const ZIP_SIGNATURES: [&[u8]; 3] = [b"PK\x03\x04", b"PK\x05\x06", b"PK\x07\x08"];
const MIN_ZIP_SIZE: u64 = 22;

/// Identifies one of the four shards.
///
/// `S1` is owned by the coordinator itself, the others by storage nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ShardId {
    S1,
    S2,
    S3,
    S4,
}

impl ShardId {
    /// All shards in listing order: the local shard first, then the remote shards.
    pub const ALL: [ShardId; 4] = [ShardId::S1, ShardId::S2, ShardId::S3, ShardId::S4];

    /// The shards owned by storage nodes.
    pub const REMOTE: [ShardId; 3] = [ShardId::S2, ShardId::S3, ShardId::S4];

    /// The name used as marker in logical paths (`~S1`, `~S2`, ...).
    pub fn name(self) -> &'static str {
        match self {
            ShardId::S1 => "S1",
            ShardId::S2 => "S2",
            ShardId::S3 => "S3",
            ShardId::S4 => "S4",
        }
    }

    /// The file extension (including the dot) stored by this shard.
    pub fn extension(self) -> &'static str {
        match self {
            ShardId::S1 => ".c",
            ShardId::S2 => ".pdf",
            ShardId::S3 => ".txt",
            ShardId::S4 => ".zip",
        }
    }

    pub fn is_local(self) -> bool {
        self == ShardId::S1
    }

    /// Whether a directory entry belongs into a listing of this shard.
    ///
    /// The match is case-sensitive except for `.zip`, which also accepts `.ZIP` and friends.
    pub fn matches_listing(self, file_name: &str) -> bool {
        let ext = extension(file_name);
        match self {
            ShardId::S4 => ext.eq_ignore_ascii_case(self.extension()),
            _ => ext == self.extension(),
        }
    }

    /// Whether an archive of this shard's file type can be built.
    pub fn supports_archive(self) -> bool {
        self != ShardId::S4
    }

    /// Checks the format signature of a stored file given its first bytes and its size.
    ///
    /// `.pdf` files must start with `%PDF`, `.zip` files must be at least 22 bytes long and start
    /// with a local file header, an end of central directory record or a spanning marker. `.c`
    /// and `.txt` files have no signature.
    pub fn signature_matches(self, head: &[u8], size: u64) -> bool {
        match self {
            ShardId::S2 => head.starts_with(PDF_SIGNATURE),
            ShardId::S4 => {
                size >= MIN_ZIP_SIZE && ZIP_SIGNATURES.iter().any(|sig| head.starts_with(sig))
            }
            ShardId::S1 | ShardId::S3 => true,
        }
    }
}

impl Display for ShardId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ShardId {
    type Err = UnknownShard;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ShardId::ALL
            .into_iter()
            .find(|shard| shard.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownShard(s.to_string()))
    }
}

/// Returned when parsing an unknown shard name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownShard(pub String);

impl Display for UnknownShard {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown shard: {}", self.0)
    }
}

impl std::error::Error for UnknownShard {}

/// Returns the extension of a file name including the leading dot.
///
/// Only the part after the last dot counts. A name without dot, or whose only dot is the first
/// character, has no extension and an empty string is returned.
pub fn extension(file_name: &str) -> &str {
    match file_name.rfind('.') {
        Some(0) | None => "",
        Some(pos) => &file_name[pos..],
    }
}

/// Maps a file name (or path) to the shard responsible for it.
///
/// The match is an exact, case-sensitive comparison of the extension of the last path
/// component.
pub fn locate(file_name: &str) -> Option<ShardId> {
    let base = file_name.rsplit('/').next().unwrap_or(file_name);
    shard_for_extension(extension(base))
}

/// Maps an extension (including the dot) to its shard.
pub fn shard_for_extension(ext: &str) -> Option<ShardId> {
    ShardId::ALL
        .into_iter()
        .find(|shard| shard.extension() == ext)
}
