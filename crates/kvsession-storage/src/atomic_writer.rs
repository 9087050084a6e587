//! Whole-file replacement for session files
//!
//! Data goes to a uniquely named sibling temp file which is renamed over the
//! target on commit, so readers see either the old file or the new one.

use crate::traits::StorageResult;
use rand::RngCore;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Suffix of in-flight temp files
pub const TEMP_SUFFIX: &str = "tmp";

pub struct AtomicWriter {
    temp_path: PathBuf,
    final_path: PathBuf,
    file: Option<File>,
}

impl AtomicWriter {
    pub fn new<P: AsRef<Path>>(path: P) -> StorageResult<Self> {
        let final_path = path.as_ref().to_path_buf();
        let temp_path = Self::temp_path(&final_path);
        let file = File::create(&temp_path)?;

        Ok(Self {
            temp_path,
            final_path,
            file: Some(file),
        })
    }

    /// Replace `path` with the concatenation of `parts`
    pub fn write_parts<P: AsRef<Path>>(path: P, parts: &[&[u8]]) -> StorageResult<()> {
        let mut writer = Self::new(path)?;
        for part in parts {
            writer.write(part)?;
        }
        writer.commit()
    }

    pub fn write(&mut self, data: &[u8]) -> StorageResult<()> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(data)?;
        }
        Ok(())
    }

    pub fn commit(mut self) -> StorageResult<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        fs::rename(&self.temp_path, &self.final_path)?;
        Ok(())
    }

    /// Temp name is unique per writer so concurrent saves of one session never
    /// share a temp file
    fn temp_path(final_path: &Path) -> PathBuf {
        let mut temp = final_path.as_os_str().to_owned();
        temp.push(format!(".{:016x}.{}", rand::rng().next_u64(), TEMP_SUFFIX));
        PathBuf::from(temp)
    }
}

impl Drop for AtomicWriter {
    fn drop(&mut self) {
        // After a successful commit the temp file no longer exists
        let _ = fs::remove_file(&self.temp_path);
    }
}
