//! Building type-filtered archives of a storage root.
//!
//! An [Archiver] turns a list of files below a root directory into a single TAR archive. The
//! archive is written to an [ArchiveArtifact], a temporary file inside the storage root that is
//! removed once it is dropped.

use crate::error::{ShardResult, WithPath};
use crate::storage::filesystem::{FilesystemStorage, is_tmp_file_name};
use std::fs::File;
use std::io;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::NamedTempFile;

const ARTIFACT_PREFIX: &str = ".shardfs-archive-";
const ARTIFACT_SUFFIX: &str = ".tar";

/// Writes the files (given relative to `root`) into a TAR archive at `out`.
pub trait Archiver: Send + Sync {
    fn write_archive(&self, root: &Path, files: &[PathBuf], out: &Path) -> io::Result<()>;
}

/// Archiver using the `tar` crate.
#[derive(Debug, Clone, Copy, Default)]
pub struct TarArchiver;

impl Archiver for TarArchiver {
    fn write_archive(&self, root: &Path, files: &[PathBuf], out: &Path) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(out)?);
        {
            let mut archive = tar::Builder::new(&mut writer);
            archive.follow_symlinks(false);
            for file in files {
                archive.append_path_with_name(root.join(file), file)?;
            }
            archive.finish()?;
        }
        writer.into_inner().map_err(io::IntoInnerError::into_error)?;
        Ok(())
    }
}

/// Archiver invoking an external `tar`-compatible executable as
/// `<tool> -cf <out> -C <root> <files...>`.
#[derive(Debug, Clone)]
pub struct CommandArchiver {
    tool: PathBuf,
}

impl CommandArchiver {
    pub fn new(tool: PathBuf) -> Self {
        Self { tool }
    }
}

impl Archiver for CommandArchiver {
    fn write_archive(&self, root: &Path, files: &[PathBuf], out: &Path) -> io::Result<()> {
        if files.is_empty() {
            // Common tar implementations refuse to create empty archives.
            return TarArchiver.write_archive(root, files, out);
        }
        let status = Command::new(&self.tool)
            .arg("-cf")
            .arg(out)
            .arg("-C")
            .arg(root)
            .args(files)
            .status()?;
        if !status.success() {
            return Err(io::Error::other(format!(
                "{} exited with {status}",
                self.tool.display()
            )));
        }
        Ok(())
    }
}

/// A finished archive in the storage root. The file is deleted on drop.
#[derive(Debug)]
pub struct ArchiveArtifact {
    file: NamedTempFile,
    size: u64,
}

impl ArchiveArtifact {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Opens the artifact for reading from the start.
    pub fn open(&self) -> ShardResult<File> {
        File::open(self.file.path()).with_path(self.file.path())
    }
}

/// Collects all files below the storage root accepted by `filter` and archives them.
///
/// Staging files and other archive artifacts are never included.
pub fn build_archive<F: Fn(&str) -> bool>(
    storage: &FilesystemStorage,
    filter: F,
    archiver: &dyn Archiver,
) -> ShardResult<ArchiveArtifact> {
    let files = storage.collect(|name| {
        !is_tmp_file_name(name) && !is_artifact_name(name) && filter(name)
    })?;
    let file = tempfile::Builder::new()
        .prefix(ARTIFACT_PREFIX)
        .suffix(ARTIFACT_SUFFIX)
        .tempfile_in(storage.root())
        .with_path(storage.root())?;
    archiver
        .write_archive(storage.root(), &files, file.path())
        .with_path(file.path())?;
    let size = file.path().metadata().with_path(file.path())?.len();
    Ok(ArchiveArtifact { file, size })
}

fn is_artifact_name(name: &str) -> bool {
    name.starts_with(ARTIFACT_PREFIX) && name.ends_with(ARTIFACT_SUFFIX)
}
