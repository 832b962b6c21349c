//! Grammar of the text commands.
//!
//! [Command] covers the commands a client sends to the coordinator, [NodeCommand] the commands
//! the coordinator sends to a storage node. Both are single lines of space-separated tokens.

use crate::path::{LogicalPath, NAMESPACE_ROOT};
use std::fmt::{Display, Formatter};

pub const MAX_UPLOAD_FILES: usize = 3;
pub const MAX_DOWNLOAD_FILES: usize = 2;
pub const MAX_REMOVE_FILES: usize = 2;

/// A command sent by a client to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `uploadf <file>... <dest>`; each file follows as size header and payload.
    Upload {
        files: Vec<String>,
        dest: LogicalPath,
    },
    /// `downlf <path>...`
    Download { paths: Vec<LogicalPath> },
    /// `downltar <extension>`
    DownloadArchive { extension: String },
    /// `removef <path>...`
    Remove { paths: Vec<LogicalPath> },
    /// `dispfnames <path>`
    List { path: LogicalPath },
}

/// Reasons a command line is rejected. The [Display] output is the reply sent to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Unknown,
    InvalidFormat,
    MissingPath,
    OutsideNamespace,
}

impl Display for CommandError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Unknown => write!(f, "Error: Unknown command"),
            CommandError::InvalidFormat => write!(f, "Error: Invalid command format"),
            CommandError::MissingPath => write!(f, "Error: Path must be specified"),
            CommandError::OutsideNamespace => {
                write!(f, "Error: Path must start with ~{NAMESPACE_ROOT}")
            }
        }
    }
}

impl std::error::Error for CommandError {}

impl Command {
    pub fn parse(line: &str) -> Result<Self, CommandError> {
        let mut tokens = line.split_whitespace();
        let word = tokens.next().ok_or(CommandError::Unknown)?;
        let args: Vec<&str> = tokens.collect();
        match word {
            "uploadf" => {
                let (dest, files) = args.split_last().ok_or(CommandError::InvalidFormat)?;
                if files.is_empty() || files.len() > MAX_UPLOAD_FILES {
                    return Err(CommandError::InvalidFormat);
                }
                if files.iter().any(|file| upload_name(file).is_empty()) {
                    return Err(CommandError::InvalidFormat);
                }
                Ok(Command::Upload {
                    files: files.iter().map(|file| file.to_string()).collect(),
                    dest: parse_namespace_path(dest)?,
                })
            }
            "downlf" => Ok(Command::Download {
                paths: parse_file_paths(&args, MAX_DOWNLOAD_FILES)?,
            }),
            "downltar" => match args.as_slice() {
                [extension] => Ok(Command::DownloadArchive {
                    extension: extension.to_string(),
                }),
                _ => Err(CommandError::InvalidFormat),
            },
            "removef" => Ok(Command::Remove {
                paths: parse_file_paths(&args, MAX_REMOVE_FILES)?,
            }),
            "dispfnames" => match args.as_slice() {
                [] => Err(CommandError::MissingPath),
                [path] => Ok(Command::List {
                    path: parse_namespace_path(path)?,
                }),
                _ => Err(CommandError::InvalidFormat),
            },
            _ => Err(CommandError::Unknown),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Upload { files, dest } => write!(f, "uploadf {} {dest}", files.join(" ")),
            Command::Download { paths } => write!(f, "downlf {}", join_paths(paths)),
            Command::DownloadArchive { extension } => write!(f, "downltar {extension}"),
            Command::Remove { paths } => write!(f, "removef {}", join_paths(paths)),
            Command::List { path } => write!(f, "dispfnames {path}"),
        }
    }
}

/// The name a file is stored under: the last component of the path given to `uploadf`.
pub fn upload_name(file: &str) -> &str {
    file.rsplit('/').next().unwrap_or(file)
}

fn parse_namespace_path(token: &str) -> Result<LogicalPath, CommandError> {
    if !token.starts_with(&format!("~{NAMESPACE_ROOT}")) {
        return Err(CommandError::OutsideNamespace);
    }
    LogicalPath::parse_for(token, NAMESPACE_ROOT).map_err(|_| CommandError::InvalidFormat)
}

fn parse_file_paths(args: &[&str], max: usize) -> Result<Vec<LogicalPath>, CommandError> {
    if args.is_empty() || args.len() > max {
        return Err(CommandError::InvalidFormat);
    }
    args.iter()
        .map(|arg| {
            let path = parse_namespace_path(arg)?;
            if path.file_name().is_none() {
                return Err(CommandError::InvalidFormat);
            }
            Ok(path)
        })
        .collect()
}

fn join_paths(paths: &[LogicalPath]) -> String {
    paths
        .iter()
        .map(LogicalPath::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}

/// A command sent by the coordinator to a storage node.
///
/// A node connection that does not start with one of these keywords carries an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeCommand {
    GetFile(LogicalPath),
    Delete(LogicalPath),
    List(LogicalPath),
    CreateTar(String),
}

impl NodeCommand {
    const KEYWORDS: [&'static str; 4] = ["GET_FILE", "DELETE", "LIST", "CREATE_TAR"];

    /// Whether the first bytes received on a node connection begin a text command.
    pub fn is_command_prefix(buf: &[u8]) -> bool {
        Self::KEYWORDS.iter().any(|keyword| {
            buf.strip_prefix(keyword.as_bytes())
                .is_some_and(|rest| matches!(rest.first(), Some(b' ' | b'\n' | b'\0') | None))
        })
    }

    /// Parses a command line. Returns `None` for malformed lines or unknown keywords.
    pub fn parse(line: &str) -> Option<Self> {
        let mut tokens = line.split_whitespace();
        let keyword = tokens.next()?;
        let arg = tokens.next()?;
        if tokens.next().is_some() {
            return None;
        }
        match keyword {
            "GET_FILE" => LogicalPath::parse(arg).ok().map(NodeCommand::GetFile),
            "DELETE" => LogicalPath::parse(arg).ok().map(NodeCommand::Delete),
            "LIST" => LogicalPath::parse(arg).ok().map(NodeCommand::List),
            "CREATE_TAR" => Some(NodeCommand::CreateTar(arg.to_string())),
            _ => None,
        }
    }
}

impl Display for NodeCommand {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeCommand::GetFile(path) => write!(f, "GET_FILE {path}"),
            NodeCommand::Delete(path) => write!(f, "DELETE {path}"),
            NodeCommand::List(path) => write!(f, "LIST {path}"),
            NodeCommand::CreateTar(extension) => write!(f, "CREATE_TAR {extension}"),
        }
    }
}
