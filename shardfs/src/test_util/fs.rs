//! Helpers for creating test files.

use rand::RngCore;
use std::fs;
use std::io;
use std::path::Path;

/// Writes `size` random bytes to a new file at `path` and returns them.
pub fn write_random_file(path: &Path, size: usize, rng: &mut impl RngCore) -> io::Result<Vec<u8>> {
    let mut content = vec![0; size];
    rng.fill_bytes(&mut content);
    fs::write(path, &content)?;
    Ok(content)
}
