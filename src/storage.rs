//! Directory abstraction consumed by flushes and merges.
//!
//! The write path never interprets file contents beyond their length; codecs
//! own the bytes. Two backends are provided:
//!
//! - [`memory::RamDirectory`]: in-memory files, used by tests and
//!   short-lived indexes
//! - [`file::FsDirectory`]: one file per name below a root path, with a
//!   one-time probe for spinning media
//!
//! [`rate_limit::RateLimitedDirectory`] decorates any directory so that every
//! output created through it is throttled (and abortable) by a merge's
//! [`rate_limit::MergeRateLimiter`].

use std::fmt::Debug;
use std::io::{Read, Write};

use crate::error::{Result, SluiceError};

pub mod file;
pub mod memory;
pub mod rate_limit;

/// A named, flat collection of files.
pub trait Directory: Send + Sync + Debug {
    /// Create (or truncate) a file for writing.
    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>>;

    /// Open an existing file for reading.
    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>>;

    /// Delete a file. Deleting a missing file is an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Length of a file in bytes.
    fn file_length(&self, name: &str) -> Result<u64>;

    /// All file names, sorted.
    fn list_all(&self) -> Result<Vec<String>>;

    /// Atomically rename a file.
    fn rename(&self, source: &str, dest: &str) -> Result<()>;

    /// Make the named files durable.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Whether the backing storage is spinning media.
    ///
    /// Used once by the concurrent merge scheduler to pick default thread and
    /// merge counts.
    fn is_spinning(&self) -> bool {
        false
    }

    /// Read a whole file into memory.
    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        let mut input = self.open_input(name)?;
        let mut bytes = Vec::with_capacity(input.length() as usize);
        input.read_to_end(&mut bytes)?;
        Ok(bytes)
    }

    /// Write a whole file and close it.
    fn write_file(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut output = self.create_output(name)?;
        output.write_all(bytes)?;
        output.close()
    }

    /// Delete a file if it exists, ignoring missing files.
    fn delete_if_exists(&self, name: &str) -> Result<()> {
        if self.file_exists(name) {
            self.delete_file(name)?;
        }
        Ok(())
    }
}

/// A readable file.
pub trait IndexInput: Read + Send + Debug {
    /// Length of the file in bytes.
    fn length(&self) -> u64;
}

/// A writable file. Data becomes visible to readers once closed.
pub trait IndexOutput: Write + Send + Debug {
    /// Number of bytes written so far.
    fn position(&self) -> u64;

    /// Flush and publish the file.
    fn close(&mut self) -> Result<()>;
}

/// Sum of the lengths of `files`; missing files are an error.
pub fn total_file_length(directory: &dyn Directory, files: &[String]) -> Result<u64> {
    let mut total = 0u64;
    for name in files {
        total = total.checked_add(directory.file_length(name)?).ok_or_else(|| {
            SluiceError::illegal_state(format!("file sizes overflow while summing {name}"))
        })?;
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::memory::RamDirectory;
    use super::*;

    #[test]
    fn test_read_write_helpers() {
        let dir = RamDirectory::new();
        dir.write_file("a.bin", b"hello").unwrap();
        dir.write_file("b.bin", b"world!").unwrap();

        assert_eq!(dir.read_file("a.bin").unwrap(), b"hello");
        assert_eq!(
            total_file_length(&dir, &["a.bin".to_string(), "b.bin".to_string()]).unwrap(),
            11
        );

        dir.delete_if_exists("a.bin").unwrap();
        dir.delete_if_exists("a.bin").unwrap();
        assert!(!dir.file_exists("a.bin"));
        assert!(total_file_length(&dir, &["a.bin".to_string()]).is_err());
    }
}
