use crate::util::close::Close;
use crate::util::encoding::ICASE_NOPAD_ALPHANUMERIC_ENCODING;
use data_encoding::Encoding;
use fs2::FileExt;
use rand::{CryptoRng, RngCore};
use std::ffi::OsStr;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::{fs, io};

const TMP_FILE_SUFFIX_ENCODING: Encoding = ICASE_NOPAD_ALPHANUMERIC_ENCODING;
const TMP_FILE_SUFFIX_BYTES: usize = 4;
const TMP_FILE_SUFFIX_ENCODED_LEN: usize = 7;

/// A file that is staged to be atomically moved to a target path.
///
/// The file is created with a temporary name in the same directory as the target path.
/// Once [Close::close] is called, the file is moved to the target path. If the instance is
/// dropped without being closed, e.g. because a transfer ended early, the temporary file is
/// removed and the target path is left untouched.
pub struct StagedFile<P: AsRef<Path>> {
    file: File,
    tmp_path: PathBuf,
    target_path: P,
    finalized: bool,
}

impl<P: AsRef<Path>> StagedFile<P> {
    pub fn new<R: CryptoRng + RngCore>(target_path: P, rng: &mut R) -> io::Result<Self> {
        let mut bytes = [0; TMP_FILE_SUFFIX_BYTES];
        rng.fill_bytes(&mut bytes);
        Self::new_with_suffix(
            target_path,
            &TMP_FILE_SUFFIX_ENCODING.encode(bytes.as_ref()),
        )
    }

    fn new_with_suffix(target_path: P, suffix: &str) -> io::Result<Self> {
        let filename = target_path
            .as_ref()
            .file_name()
            .and_then(OsStr::to_str)
            .ok_or(io::Error::new(ErrorKind::InvalidInput, "Invalid filename"))?;
        let tmp_path = target_path
            .as_ref()
            .with_file_name(format!("{}.tmp.{}", filename, suffix));
        for _ in 0..5 {
            let file = OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&tmp_path)?;
            file.lock_exclusive()?;
            if !tmp_path.exists() {
                // Deleted by clean_leftover_tmp_files before we could lock it.
                continue;
            }
            return Ok(Self {
                file,
                tmp_path,
                target_path,
                finalized: false,
            });
        }
        Err(io::Error::other("Failed to create and lock temporary file"))
    }

    pub fn target_path(&self) -> &Path {
        self.target_path.as_ref()
    }
}

impl<P: AsRef<Path>> Write for StagedFile<P> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl<P: AsRef<Path>> Close for StagedFile<P> {
    fn close(mut self) -> io::Result<()> {
        let result = self
            .file
            .flush()
            .and_then(|()| fs::rename(&self.tmp_path, self.target_path.as_ref()));
        self.finalized = result.is_ok();
        result
    }
}

impl<P: AsRef<Path>> Drop for StagedFile<P> {
    fn drop(&mut self) {
        if !self.finalized {
            let _ = fs::remove_file(&self.tmp_path);
        }
    }
}

/// Cleans up leftover temporary files of [StagedFile] in the given directory and its
/// subdirectories.
///
/// Usually the temporary file will be deleted when the [StagedFile] is closed or dropped. However,
/// if a process is killed hard, the temporary file may be left behind.
pub fn clean_leftover_tmp_files<P_: AsRef<Path>>(path: P_) -> io::Result<()> {
    for entry in path.as_ref().read_dir()? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_file() {
            if let Some(file_name) = entry.file_name().to_str()
                && is_tmp_file_name(file_name)
            {
                let is_locked = OpenOptions::new()
                    .read(true)
                    .open(entry.path())
                    .and_then(|file_handle| file_handle.try_lock_exclusive())
                    .is_ok();
                if is_locked {
                    fs::remove_file(entry.path())?;
                }
            }
        } else if file_type.is_dir() {
            clean_leftover_tmp_files(entry.path())?;
        }
    }
    Ok(())
}

/// Whether a file name has the form used for the temporary files of [StagedFile].
pub fn is_tmp_file_name(file_name: &str) -> bool {
    let mut parts = file_name.rsplitn(3, '.');
    let suffix = parts.next();
    let ext = parts.next();
    ext == Some("tmp") && suffix.map(|s| s.len()) == Some(TMP_FILE_SUFFIX_ENCODED_LEN)
}
