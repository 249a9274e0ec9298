//! In-memory directory implementation for testing and temporary indexes.

use std::collections::HashMap;
use std::io::{Cursor, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, SluiceError};
use crate::storage::{Directory, IndexInput, IndexOutput};

type FileMap = Arc<Mutex<HashMap<String, Arc<[u8]>>>>;

/// An in-memory directory.
///
/// Files are immutable once their output is closed; readers share the
/// published bytes without copying.
#[derive(Debug, Default)]
pub struct RamDirectory {
    /// The files stored in memory.
    files: FileMap,
    /// Reported spinning flag, settable for scheduler tests.
    spinning: bool,
}

impl RamDirectory {
    /// Create a new empty memory directory.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a directory that claims to sit on spinning media.
    pub fn spinning() -> Self {
        RamDirectory {
            files: FileMap::default(),
            spinning: true,
        }
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }

    /// Overwrite one byte of a stored file; lets tests simulate corruption.
    pub fn corrupt_byte(&self, name: &str, offset: usize) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| SluiceError::other(format!("File not found: {name}")))?;
        let mut bytes = data.to_vec();
        let byte = bytes
            .get_mut(offset)
            .ok_or_else(|| SluiceError::invalid_argument(format!("offset {offset} past end")))?;
        *byte ^= 0xFF;
        files.insert(name.to_string(), bytes.into());
        Ok(())
    }

    fn not_found(name: &str) -> SluiceError {
        std::io::Error::new(std::io::ErrorKind::NotFound, format!("File not found: {name}")).into()
    }
}

impl Directory for RamDirectory {
    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        Ok(Box::new(RamOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        let files = self.files.lock();
        let data = files.get(name).ok_or_else(|| Self::not_found(name))?;
        Ok(Box::new(RamInput::new(Arc::clone(data))))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files
            .lock()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(name))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files.get(name).ok_or_else(|| Self::not_found(name))?;
        Ok(data.len() as u64)
    }

    fn list_all(&self) -> Result<Vec<String>> {
        let mut file_names: Vec<String> = self.files.lock().keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn rename(&self, source: &str, dest: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files.remove(source).ok_or_else(|| Self::not_found(source))?;
        files.insert(dest.to_string(), data);
        Ok(())
    }

    fn sync(&self, _names: &[String]) -> Result<()> {
        // Memory is as durable as it gets.
        Ok(())
    }

    fn is_spinning(&self) -> bool {
        self.spinning
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct RamInput {
    cursor: Cursor<Arc<[u8]>>,
}

impl RamInput {
    fn new(data: Arc<[u8]>) -> Self {
        RamInput {
            cursor: Cursor::new(data),
        }
    }
}

impl Read for RamInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl IndexInput for RamInput {
    fn length(&self) -> u64 {
        self.cursor.get_ref().len() as u64
    }
}

/// A memory-based output implementation.
#[derive(Debug)]
pub struct RamOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    closed: bool,
}

impl RamOutput {
    fn new(name: String, files: FileMap) -> Self {
        RamOutput {
            name,
            buffer: Vec::new(),
            files,
            closed: false,
        }
    }

    fn publish(&mut self) {
        let data: Arc<[u8]> = std::mem::take(&mut self.buffer).into();
        self.files.lock().insert(self.name.clone(), data);
        self.closed = true;
    }
}

impl Write for RamOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other(format!(
                "output {} already closed",
                self.name
            )));
        }
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl IndexOutput for RamOutput {
    fn position(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.publish();
        }
        Ok(())
    }
}

impl Drop for RamOutput {
    fn drop(&mut self) {
        if !self.closed {
            self.publish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ram_directory_basic_operations() {
        let dir = RamDirectory::new();

        let mut output = dir.create_output("test.txt").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        assert_eq!(output.position(), 13);
        output.close().unwrap();

        assert!(dir.file_exists("test.txt"));
        assert_eq!(dir.file_length("test.txt").unwrap(), 13);

        let mut input = dir.open_input("test.txt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"Hello, World!");

        assert_eq!(dir.list_all().unwrap(), vec!["test.txt"]);
        dir.delete_file("test.txt").unwrap();
        assert!(!dir.file_exists("test.txt"));
        assert!(dir.delete_file("test.txt").is_err());
    }

    #[test]
    fn test_unclosed_output_is_invisible() {
        let dir = RamDirectory::new();
        let mut output = dir.create_output("pending.bin").unwrap();
        output.write_all(b"abc").unwrap();
        assert!(!dir.file_exists("pending.bin"));
        drop(output);
        assert!(dir.file_exists("pending.bin"));
    }

    #[test]
    fn test_rename_and_corrupt() {
        let dir = RamDirectory::new();
        dir.write_file("a", &[1, 2, 3]).unwrap();
        dir.rename("a", "b").unwrap();
        assert!(!dir.file_exists("a"));

        dir.corrupt_byte("b", 1).unwrap();
        assert_eq!(dir.read_file("b").unwrap(), vec![1, 0xFD, 3]);
        assert!(dir.corrupt_byte("b", 10).is_err());
    }

    #[test]
    fn test_spinning_flag() {
        assert!(!RamDirectory::new().is_spinning());
        assert!(RamDirectory::spinning().is_spinning());
    }
}
