//! File-based storage implementation.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use parking_lot::Mutex;

use crate::error::{IrIndexError, Result};
use crate::storage::{Storage, StorageError, StorageInput, StorageLock, StorageOutput};

/// Configuration for file-based storage.
#[derive(Debug, Clone)]
pub struct FileStorageConfig {
    /// Directory holding the index files.
    pub path: PathBuf,

    /// Buffer size for readers and writers in bytes.
    pub buffer_size: usize,

    /// Flush after every write call.
    pub sync_writes: bool,

    /// Create real lock files on disk for named locks.
    pub use_locking: bool,
}

impl FileStorageConfig {
    /// Create a configuration rooted at `path` with default settings.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        FileStorageConfig {
            path: path.as_ref().to_path_buf(),
            buffer_size: 65536,
            sync_writes: false,
            use_locking: true,
        }
    }
}

/// A file-based storage implementation.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: FileStorageConfig,
    /// Names of the locks currently held through this storage.
    held_locks: Arc<Mutex<HashSet<String>>>,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: FileStorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| IrIndexError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(IrIndexError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage {
            directory,
            config,
            held_locks: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// The root directory of this storage.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.lock"))
    }
}

fn map_open_error(name: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::FileNotFound(name.to_string())
    } else {
        StorageError::IoError(e.to_string())
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let path = self.file_path(name);
        Ok(Box::new(FileInput::open(
            name,
            path,
            self.config.buffer_size,
        )?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        let path = self.file_path(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StorageError::IoError(e.to_string()))?;

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).exists()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| StorageError::IoError(format!("Failed to delete file: {e}")))?;
        }

        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();

        for entry in
            std::fs::read_dir(&self.directory).map_err(|e| StorageError::IoError(e.to_string()))?
        {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let path = entry.path();

            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| map_open_error(name, e))?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| StorageError::IoError(format!("Failed to rename file: {e}")))?;
        sync_directory(&self.directory)
    }

    fn create_temp_output(&self, prefix: &str) -> Result<(String, Box<dyn StorageOutput>)> {
        for counter in 0..=10000u32 {
            let temp_name = format!("{prefix}_{counter}.tmp");
            let path = self.file_path(&temp_name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => {
                    let output =
                        FileOutput::new(file, self.config.buffer_size, self.config.sync_writes);
                    return Ok((temp_name, Box::new(output)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StorageError::IoError(e.to_string()).into()),
            }
        }

        Err(StorageError::IoError("Could not create temporary file".to_string()).into())
    }

    fn acquire_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let mut held = self.held_locks.lock();
        if held.contains(name) {
            return Err(StorageError::LockFailed(name.to_string()).into());
        }

        let file = if self.config.use_locking {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(self.lock_path(name))
                .map_err(|e| StorageError::IoError(e.to_string()))?;
            // The OS drops the lock with the process; a leftover file is free.
            file.try_lock_exclusive().map_err(|e| {
                if e.kind() == fs2::lock_contended_error().kind() {
                    StorageError::LockFailed(name.to_string())
                } else {
                    StorageError::IoError(e.to_string())
                }
            })?;
            Some(file)
        } else {
            None
        };

        held.insert(name.to_string());
        Ok(Box::new(FileLock {
            name: name.to_string(),
            file,
            held_locks: Arc::clone(&self.held_locks),
            released: false,
        }))
    }

    fn lock_exists(&self, name: &str) -> bool {
        if self.held_locks.lock().contains(name) {
            return true;
        }
        match File::open(self.lock_path(name)) {
            Ok(file) => file.try_lock_exclusive().is_err(),
            Err(_) => false,
        }
    }

    fn sync(&self) -> Result<()> {
        sync_directory(&self.directory)
    }
}

/// Persist the directory entries of `directory`, renames included.
#[cfg(unix)]
fn sync_directory(directory: &Path) -> Result<()> {
    File::open(directory)
        .and_then(|dir| dir.sync_all())
        .map_err(|e| StorageError::IoError(format!("Failed to sync directory: {e}")).into())
}

#[cfg(not(unix))]
fn sync_directory(_directory: &Path) -> Result<()> {
    Ok(())
}

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    name: String,
    path: PathBuf,
    buffer_size: usize,
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn open(name: &str, path: PathBuf, buffer_size: usize) -> Result<Self> {
        let file = File::open(&path).map_err(|e| map_open_error(name, e))?;
        let size = file
            .metadata()
            .map_err(|e| IrIndexError::storage(format!("Failed to get file metadata: {e}")))?
            .len();

        Ok(FileInput {
            name: name.to_string(),
            path,
            buffer_size,
            reader: BufReader::with_capacity(buffer_size, file),
            size,
        })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(FileInput::open(
            &self.name,
            self.path.clone(),
            self.buffer_size,
        )?))
    }

    fn close(&mut self) -> Result<()> {
        // The file is closed when the reader is dropped.
        Ok(())
    }
}

/// A file output implementation.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    sync_writes: bool,
    position: u64,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize, sync_writes: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            sync_writes,
            position: 0,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;

        if self.sync_writes {
            self.writer.flush()?;
        }

        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = self.writer.seek(pos)?;
        self.position = new_pos;
        Ok(new_pos)
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| IrIndexError::storage(format!("Failed to flush: {e}")))?;

        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| IrIndexError::storage(format!("Failed to sync: {e}")))?;

        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        self.flush_and_sync()
    }
}

/// A named lock backed by a `<name>.lock` file.
#[derive(Debug)]
struct FileLock {
    name: String,
    /// Handle holding the OS lock on the lock file.
    file: Option<File>,
    held_locks: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.held_locks.lock().remove(&self.name);
        // Closing the handle unlocks; the file stays for the next holder.
        drop(self.file.take());
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("failed to release lock {}: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_storage() -> (TempDir, FileStorage) {
        let temp_dir = TempDir::new().unwrap();
        let config = FileStorageConfig::new(temp_dir.path());
        let storage = FileStorage::new(temp_dir.path(), config).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_create_and_read_file() {
        let (_temp_dir, storage) = create_test_storage();

        let mut output = storage.create_output("test.txt").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        assert_eq!(output.position().unwrap(), 13);
        output.close().unwrap();

        let mut input = storage.open_input("test.txt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, World!");
        assert_eq!(input.size().unwrap(), 13);

        let mut cloned = input.clone_input().unwrap();
        let mut again = Vec::new();
        cloned.read_to_end(&mut again).unwrap();
        assert_eq!(again, buffer);
    }

    #[test]
    fn test_file_operations() {
        let (_temp_dir, storage) = create_test_storage();

        assert!(!storage.file_exists("nonexistent.txt"));

        let mut output = storage.create_output("test.txt").unwrap();
        output.write_all(b"Test content").unwrap();
        output.close().unwrap();

        assert!(storage.file_exists("test.txt"));
        assert_eq!(storage.file_size("test.txt").unwrap(), 12);
        assert_eq!(storage.list_files().unwrap(), vec!["test.txt"]);

        storage.rename_file("test.txt", "renamed.txt").unwrap();
        assert!(!storage.file_exists("test.txt"));
        assert!(storage.file_exists("renamed.txt"));

        storage.delete_file("renamed.txt").unwrap();
        assert!(!storage.file_exists("renamed.txt"));
    }

    #[test]
    fn test_temp_file_creation() {
        let (_temp_dir, storage) = create_test_storage();

        let (first, mut output) = storage.create_temp_output("run").unwrap();
        output.write_all(b"Temporary content").unwrap();
        output.close().unwrap();
        let (second, _) = storage.create_temp_output("run").unwrap();

        assert!(first.starts_with("run_"));
        assert!(first.ends_with(".tmp"));
        assert_ne!(first, second);
        assert_eq!(storage.file_size(&first).unwrap(), 17);
    }

    #[test]
    fn test_rename_publishes_temp_file() {
        let (temp_dir, storage) = create_test_storage();

        let (temp, mut output) = storage.create_temp_output("barrels.json").unwrap();
        output.write_all(b"{}").unwrap();
        output.close().unwrap();
        storage.rename_file(&temp, "barrels.json").unwrap();
        storage.sync().unwrap();

        assert!(!storage.file_exists(&temp));
        assert_eq!(std::fs::read(temp_dir.path().join("barrels.json")).unwrap(), b"{}");
    }

    #[test]
    fn test_file_not_found() {
        let (_temp_dir, storage) = create_test_storage();

        assert!(storage.open_input("nonexistent.txt").is_err());
        assert!(storage.file_size("nonexistent.txt").is_err());
    }

    #[test]
    fn test_leftover_lock_file_is_free() {
        let (temp_dir, storage) = create_test_storage();
        std::fs::write(temp_dir.path().join("write.lock"), b"").unwrap();
        assert!(!storage.lock_exists("write"));

        let _lock = storage.acquire_lock("write").unwrap();

        // A second handle on the same directory sees the OS lock.
        let other =
            FileStorage::new(temp_dir.path(), FileStorageConfig::new(temp_dir.path())).unwrap();
        assert!(other.lock_exists("write"));
        let err = other.acquire_lock("write").unwrap_err();
        assert!(err.to_string().contains("Failed to acquire lock: write"));
    }

    #[test]
    fn test_lock_is_exclusive_until_dropped() {
        let (temp_dir, storage) = create_test_storage();

        let lock = storage.acquire_lock("write").unwrap();
        assert!(lock.is_valid());
        assert!(temp_dir.path().join("write.lock").exists());
        assert!(storage.acquire_lock("write").is_err());

        drop(lock);
        assert!(!storage.lock_exists("write"));
        let mut relocked = storage.acquire_lock("write").unwrap();
        relocked.release().unwrap();
        assert!(!relocked.is_valid());
    }
}
