//! Storage of files below a root directory in the local filesystem.

mod staged_file;

pub use crate::storage::filesystem::staged_file::{
    StagedFile, clean_leftover_tmp_files, is_tmp_file_name,
};
use crate::error::{ShardError, ShardResult, WithPath};
use crate::path::{LogicalPath, validate_file_name};
use crate::storage::DeleteOutcome;
use rand::rngs::ThreadRng;
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::{fs, io};

/// Storage implementation using the local filesystem.
///
/// Multiple instances of this storage with the same root directory may be used in parallel, e.g.
/// by concurrent connection workers. Files become visible atomically once completely written.
///
/// # Examples
///
/// ```rust
/// # use std::io::{Read, Write};
/// use shardfs::path::LogicalPath;
/// use shardfs::storage::filesystem::FilesystemStorage;
/// use shardfs::util::close::Close;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// # let tempdir = tempfile::tempdir()?;
/// let storage = FilesystemStorage::new(tempdir.path().to_path_buf());
/// let dir = LogicalPath::parse("~S3/docs")?;
/// let mut writer = storage.put(&dir, "notes.txt")?;
/// writer.write_all(b"hello world!")?;
/// writer.close()?;
///
/// let (mut file, size) = storage.open(&dir.join("notes.txt")?)?;
/// let mut buf = String::new();
/// file.read_to_string(&mut buf)?;
/// assert_eq!((buf.as_str(), size), ("hello world!", 12));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root: PathBuf,
}

impl FilesystemStorage {
    /// Creates a new filesystem storage with the given root directory.
    ///
    /// The root directory itself is never created by the storage.
    pub fn new(root: PathBuf) -> Self {
        FilesystemStorage { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Cleans up leftover staging files in the storage.
    ///
    /// Staging files are deleted when the writer is dropped. However, if the process is killed
    /// hard, these files might be left behind. This method can be used to clean them up.
    pub fn clean_leftover_tmp_files(&self) -> io::Result<()> {
        clean_leftover_tmp_files(&self.root)
    }

    /// Opens a regular file for reading and returns it together with its size.
    pub fn open(&self, path: &LogicalPath) -> ShardResult<(File, u64)> {
        let full_path = path.resolve(&self.root);
        let file = match File::open(&full_path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(ShardError::NotFound),
            Err(err) => return Err(err).with_path(&full_path),
        };
        let metadata = file.metadata().with_path(&full_path)?;
        if !metadata.is_file() {
            return Err(ShardError::NotFound);
        }
        Ok((file, metadata.len()))
    }

    /// Returns a writer for `file_name` in the directory `dir`.
    ///
    /// Missing directories below the root are created. The file becomes available under its
    /// name when the writer is closed; dropping the writer discards everything written.
    pub fn put(&self, dir: &LogicalPath, file_name: &str) -> ShardResult<StagedFile<PathBuf>> {
        let file_name = validate_file_name(file_name)?;
        let dir_path = dir.resolve(&self.root);
        if !self.root.is_dir() {
            return Err(ShardError::Io {
                error: io::Error::new(ErrorKind::NotFound, "storage root does not exist"),
                path: Some(self.root.clone()),
            });
        }
        fs::create_dir_all(&dir_path).with_path(&dir_path)?;
        let target_path = dir_path.join(file_name);
        StagedFile::new(target_path.clone(), &mut ThreadRng::default()).with_path(&target_path)
    }

    /// Deletes a regular file.
    pub fn delete(&self, path: &LogicalPath) -> ShardResult<DeleteOutcome> {
        let full_path = path.resolve(&self.root);
        match fs::remove_file(&full_path) {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(DeleteOutcome::NotFound),
            Err(err) => Err(err).with_path(&full_path),
        }
    }

    /// Returns the sorted names of the regular files directly in `dir` accepted by `filter`.
    ///
    /// Listings are line-based, so names containing a line break are skipped.
    ///
    /// Fails with [ShardError::NotFound] if the directory does not exist.
    pub fn list<F: Fn(&str) -> bool>(
        &self,
        dir: &LogicalPath,
        filter: F,
    ) -> ShardResult<Vec<String>> {
        let dir_path = dir.resolve(&self.root);
        let entries = match dir_path.read_dir() {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Err(ShardError::NotFound),
            Err(err) => return Err(err).with_path(&dir_path),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.with_path(&dir_path)?;
            if !entry.file_type().with_path(entry.path())?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str()
                && !name.contains(['\n', '\r'])
                && filter(name)
            {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    /// Recursively collects the regular files accepted by `filter`, as sorted paths relative to
    /// the root.
    pub fn collect<F: Fn(&str) -> bool>(&self, filter: F) -> ShardResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        collect_into(&self.root, Path::new(""), &filter, &mut files)?;
        files.sort();
        Ok(files)
    }
}

fn collect_into<F: Fn(&str) -> bool>(
    root: &Path,
    relative: &Path,
    filter: &F,
    files: &mut Vec<PathBuf>,
) -> ShardResult<()> {
    let dir_path = root.join(relative);
    for entry in dir_path.read_dir().with_path(&dir_path)? {
        let entry = entry.with_path(&dir_path)?;
        let file_type = entry.file_type().with_path(entry.path())?;
        let entry_relative = relative.join(entry.file_name());
        if file_type.is_dir() {
            collect_into(root, &entry_relative, filter, files)?;
        } else if file_type.is_file()
            && entry.file_name().to_str().is_some_and(filter)
        {
            files.push(entry_relative);
        }
    }
    Ok(())
}
