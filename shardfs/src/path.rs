//! Logical paths of the form `~<SHARD>/<relative path>`.
//!
//! Clients address every file below the namespace root `~S1`. The coordinator rewrites these
//! paths to the marker of the shard that owns the file (`~S2`, `~S3`, `~S4`) before forwarding
//! a request, so storage nodes only ever see their own marker.

use crate::error::{ShardError, ShardResult};
use crate::placement::ShardId;
use std::fmt::{Display, Formatter};
use std::path::{Path, PathBuf};

/// The shard whose marker clients use for all paths.
pub const NAMESPACE_ROOT: ShardId = ShardId::S1;

const MARKER_PREFIX: char = '~';

/// A normalized logical path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPath {
    shard: ShardId,
    relative: String,
}

impl LogicalPath {
    /// Parses a logical path with any shard marker.
    ///
    /// Empty segments and `.` are dropped, `..` is rejected so that a path can never leave the
    /// storage root it is resolved against.
    pub fn parse(path: &str) -> ShardResult<Self> {
        let invalid = || ShardError::InvalidPath(path.to_string());
        let rest = path.strip_prefix(MARKER_PREFIX).ok_or_else(invalid)?;
        let (marker, relative) = rest.split_once('/').unwrap_or((rest, ""));
        let shard = ShardId::ALL
            .into_iter()
            .find(|shard| shard.name() == marker)
            .ok_or_else(invalid)?;
        let mut segments = Vec::new();
        for segment in relative.split('/') {
            match segment {
                "" | "." => {}
                ".." => return Err(invalid()),
                segment => segments.push(segment),
            }
        }
        Ok(Self {
            shard,
            relative: segments.join("/"),
        })
    }

    /// Parses a logical path that must carry the marker of the given shard.
    pub fn parse_for(path: &str, shard: ShardId) -> ShardResult<Self> {
        let parsed = Self::parse(path)?;
        if parsed.shard != shard {
            return Err(ShardError::InvalidPath(path.to_string()));
        }
        Ok(parsed)
    }

    /// The root of the given shard (`~Sx`).
    pub fn root(shard: ShardId) -> Self {
        Self {
            shard,
            relative: String::new(),
        }
    }

    pub fn shard(&self) -> ShardId {
        self.shard
    }

    /// The path relative to the shard's storage root, without leading slash.
    pub fn relative(&self) -> &str {
        &self.relative
    }

    /// The last path segment, if the path is not a shard root.
    pub fn file_name(&self) -> Option<&str> {
        if self.relative.is_empty() {
            None
        } else {
            self.relative.rsplit('/').next()
        }
    }

    /// Returns the same relative path under another shard's marker.
    pub fn with_shard(&self, shard: ShardId) -> Self {
        Self {
            shard,
            relative: self.relative.clone(),
        }
    }

    /// Appends a single file name to the path.
    pub fn join(&self, file_name: &str) -> ShardResult<Self> {
        let file_name = validate_file_name(file_name)?;
        let relative = if self.relative.is_empty() {
            file_name.to_string()
        } else {
            format!("{}/{}", self.relative, file_name)
        };
        Ok(Self {
            shard: self.shard,
            relative,
        })
    }

    /// Maps the path to a location in the filesystem below `root`.
    pub fn resolve(&self, root: &Path) -> PathBuf {
        if self.relative.is_empty() {
            root.to_path_buf()
        } else {
            root.join(&self.relative)
        }
    }
}

impl Display for LogicalPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{MARKER_PREFIX}{}", self.shard)?;
        if !self.relative.is_empty() {
            write!(f, "/{}", self.relative)?;
        }
        Ok(())
    }
}

/// Checks that `name` is a plain file name: non-empty, no separators, not `.` or `..`.
pub fn validate_file_name(name: &str) -> ShardResult<&str> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\0']) {
        return Err(ShardError::InvalidPath(name.to_string()));
    }
    Ok(name)
}
