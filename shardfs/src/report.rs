//! Structured results of multi-file commands and node requests, and their text rendering.
//!
//! Results are collected per file and only rendered to text when the reply is sent. Node replies
//! are parsed back into the same structures by the coordinator.

use crate::placement::ShardId;
use std::fmt::{Display, Formatter};

/// Outcome of one file of an `uploadf` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub file_name: String,
    /// The shard the file was stored on, or the reason it was not.
    pub result: Result<ShardId, String>,
}

/// Per-file results of an `uploadf` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadReport {
    outcomes: Vec<UploadOutcome>,
}

impl UploadReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stored(&mut self, file_name: &str, shard: ShardId) {
        self.outcomes.push(UploadOutcome {
            file_name: file_name.to_string(),
            result: Ok(shard),
        });
    }

    pub fn push_failed(&mut self, file_name: &str, reason: impl Display) {
        self.outcomes.push(UploadOutcome {
            file_name: file_name.to_string(),
            result: Err(reason.to_string()),
        });
    }

    /// Number of files that reached their shard.
    pub fn processed(&self) -> usize {
        self.outcomes.iter().filter(|o| o.result.is_ok()).count()
    }

    pub fn requested(&self) -> usize {
        self.outcomes.len()
    }

    pub fn outcomes(&self) -> &[UploadOutcome] {
        &self.outcomes
    }
}

impl Display for UploadReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Successfully processed {} out of {} files",
            self.processed(),
            self.requested()
        )?;
        for outcome in &self.outcomes {
            if let Err(reason) = &outcome.result {
                write!(f, "; {}: {reason}", outcome.file_name)?;
            }
        }
        Ok(())
    }
}

/// Outcome of removing one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveOutcome {
    Deleted(ShardId),
    NotFound(ShardId),
    Failed,
    Unreachable(ShardId),
    UnsupportedType,
    InvalidPath,
}

impl Display for RemoveOutcome {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoveOutcome::Deleted(shard) => write!(f, "Deleted from {shard}"),
            RemoveOutcome::NotFound(shard) => write!(f, "File not found in {shard}"),
            RemoveOutcome::Failed => write!(f, "Failed to delete"),
            RemoveOutcome::Unreachable(shard) => write!(f, "Failed to contact {shard} for"),
            RemoveOutcome::UnsupportedType => write!(f, "Unsupported file type"),
            RemoveOutcome::InvalidPath => write!(f, "Invalid path"),
        }
    }
}

/// Per-file results of a `removef` command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoveReport {
    outcomes: Vec<(String, RemoveOutcome)>,
}

impl RemoveReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, path: impl Display, outcome: RemoveOutcome) {
        self.outcomes.push((path.to_string(), outcome));
    }

    pub fn removed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| matches!(outcome, RemoveOutcome::Deleted(_)))
            .count()
    }

    pub fn outcomes(&self) -> &[(String, RemoveOutcome)] {
        &self.outcomes
    }
}

impl Display for RemoveReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Remove operation completed. Processed {} out of {} files. ",
            self.removed(),
            self.outcomes.len()
        )?;
        for (path, outcome) in &self.outcomes {
            write!(f, "{outcome}: {path}; ")?;
        }
        Ok(())
    }
}

/// Combined listing of all shards, kept in the fixed order in which sources were added.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    sources: Vec<(ShardId, Vec<String>)>,
}

impl Listing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the entries of one source, sorting them.
    pub fn push(&mut self, shard: ShardId, mut names: Vec<String>) {
        names.sort();
        self.sources.push((shard, names));
    }

    pub fn total(&self) -> usize {
        self.sources.iter().map(|(_, names)| names.len()).sum()
    }

    pub fn count(&self, shard: ShardId) -> usize {
        self.sources
            .iter()
            .filter(|(source, _)| *source == shard)
            .map(|(_, names)| names.len())
            .sum()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources
            .iter()
            .flat_map(|(_, names)| names.iter().map(String::as_str))
    }
}

impl Display for Listing {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.total() == 0 {
            return write!(f, "No files found in the specified directory");
        }
        write!(f, "Files found: {} (", self.total())?;
        for (i, shard) in ShardId::ALL.into_iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", shard.extension(), self.count(shard))?;
        }
        writeln!(f, ")")?;
        for name in self.names() {
            writeln!(f, "{name}")?;
        }
        Ok(())
    }
}

/// Reply of a storage node to a `DELETE` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteReply {
    Deleted,
    NotFound,
    Failed,
}

impl DeleteReply {
    pub fn render(self, shard: ShardId) -> String {
        match self {
            DeleteReply::Deleted => format!("SUCCESS: File deleted from {shard}"),
            DeleteReply::NotFound => format!("WARNING: File not found in {shard}"),
            DeleteReply::Failed => format!("ERROR: Failed to delete file from {shard}"),
        }
    }

    pub fn parse(reply: &str) -> Self {
        if reply.starts_with("SUCCESS") {
            DeleteReply::Deleted
        } else if reply.starts_with("WARNING") {
            DeleteReply::NotFound
        } else {
            DeleteReply::Failed
        }
    }
}

/// Reply of a storage node to a `LIST` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeListing {
    Found(Vec<String>),
    DirectoryNotFound,
}

impl NodeListing {
    pub fn render(&self, shard: ShardId) -> String {
        match self {
            NodeListing::Found(names) if names.is_empty() => {
                format!("No {} files found in {shard}", shard.extension())
            }
            NodeListing::Found(names) => {
                let mut reply = format!("Files found in {shard}: {}\n", names.len());
                for name in names {
                    reply.push_str(name);
                    reply.push('\n');
                }
                reply
            }
            NodeListing::DirectoryNotFound => format!("ERROR: Directory not found in {shard}"),
        }
    }

    pub fn parse(reply: &str) -> Self {
        if reply.starts_with("ERROR") {
            return NodeListing::DirectoryNotFound;
        }
        if !reply.starts_with("Files found") {
            return NodeListing::Found(Vec::new());
        }
        NodeListing::Found(
            reply
                .lines()
                .skip(1)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        )
    }
}

/// Reply of a storage node to an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreReply {
    Stored,
    Rejected(String),
}

impl StoreReply {
    pub fn render(&self, shard: ShardId) -> String {
        match self {
            StoreReply::Stored => format!("SUCCESS: File stored in {shard}"),
            StoreReply::Rejected(reason) => format!("ERROR: {reason}"),
        }
    }

    pub fn parse(reply: &str) -> Self {
        if reply.starts_with("SUCCESS") {
            StoreReply::Stored
        } else {
            let reason = reply.strip_prefix("ERROR: ").unwrap_or(reply);
            StoreReply::Rejected(if reason.is_empty() {
                "no confirmation from storage node".to_string()
            } else {
                reason.to_string()
            })
        }
    }
}
