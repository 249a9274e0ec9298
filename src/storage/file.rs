//! File-based directory implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::{Result, SluiceError};
use crate::storage::{Directory, IndexInput, IndexOutput};

const BUFFER_SIZE: usize = 64 * 1024;

/// A directory backed by one file per name below a root path.
#[derive(Debug)]
pub struct FsDirectory {
    /// The root directory.
    directory: PathBuf,
    /// Cached result of the spinning-media probe.
    spinning: OnceLock<bool>,
}

impl FsDirectory {
    /// Open (and create if needed) a directory at the given path.
    pub fn open<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)?;
        }

        if !directory.is_dir() {
            return Err(SluiceError::invalid_argument(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FsDirectory {
            directory,
            spinning: OnceLock::new(),
        })
    }

    /// The root path.
    pub fn path(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn sync_dir(&self) -> Result<()> {
        // Directory fsync makes renames durable; not supported everywhere.
        #[cfg(unix)]
        {
            File::open(&self.directory)?.sync_all()?;
        }
        Ok(())
    }
}

impl Directory for FsDirectory {
    fn create_output(&self, name: &str) -> Result<Box<dyn IndexOutput>> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(self.file_path(name))?;
        Ok(Box::new(FsOutput::new(file)))
    }

    fn open_input(&self, name: &str) -> Result<Box<dyn IndexInput>> {
        let file = File::open(self.file_path(name))?;
        let length = file.metadata()?.len();
        Ok(Box::new(FsInput {
            reader: BufReader::with_capacity(BUFFER_SIZE, file),
            length,
        }))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        std::fs::remove_file(self.file_path(name))?;
        Ok(())
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).is_file()
    }

    fn file_length(&self, name: &str) -> Result<u64> {
        Ok(self.file_path(name).metadata()?.len())
    }

    fn list_all(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.directory)? {
            let path = entry?.path();
            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
        }
        files.sort();
        Ok(files)
    }

    fn rename(&self, source: &str, dest: &str) -> Result<()> {
        std::fs::rename(self.file_path(source), self.file_path(dest))?;
        self.sync_dir()
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            File::open(self.file_path(name))?.sync_all()?;
        }
        self.sync_dir()
    }

    fn is_spinning(&self) -> bool {
        *self
            .spinning
            .get_or_init(|| probe_spinning(&self.directory).unwrap_or(false))
    }
}

/// Reads the block device's `queue/rotational` flag for the device holding `path`.
#[cfg(target_os = "linux")]
fn probe_spinning(path: &Path) -> Option<bool> {
    use std::os::unix::fs::MetadataExt;

    let dev = std::fs::metadata(path).ok()?.dev();
    let major = ((dev >> 8) & 0xfff) | ((dev >> 32) & !0xfff);
    let minor = (dev & 0xff) | ((dev >> 12) & !0xff);
    let base = PathBuf::from(format!("/sys/dev/block/{major}:{minor}"));

    // Partitions keep their queue on the parent device.
    [base.join("queue/rotational"), base.join("../queue/rotational")]
        .iter()
        .find_map(|candidate| std::fs::read_to_string(candidate).ok())
        .map(|flag| flag.trim() == "1")
}

#[cfg(not(target_os = "linux"))]
fn probe_spinning(_path: &Path) -> Option<bool> {
    None
}

/// A file-based input.
#[derive(Debug)]
pub struct FsInput {
    reader: BufReader<File>,
    length: u64,
}

impl Read for FsInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl IndexInput for FsInput {
    fn length(&self) -> u64 {
        self.length
    }
}

/// A file-based output.
#[derive(Debug)]
pub struct FsOutput {
    writer: Option<BufWriter<File>>,
    position: u64,
}

impl FsOutput {
    fn new(file: File) -> Self {
        FsOutput {
            writer: Some(BufWriter::with_capacity(BUFFER_SIZE, file)),
            position: 0,
        }
    }
}

impl Write for FsOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| std::io::Error::other("output already closed"))?;
        let written = writer.write(buf)?;
        self.position += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl IndexOutput for FsOutput {
    fn position(&self) -> u64 {
        self.position
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        Ok(())
    }
}
