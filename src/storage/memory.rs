//! In-memory storage implementation for testing and small indexes.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{IrIndexError, Result};
use crate::storage::{Storage, StorageError, StorageInput, StorageLock, StorageOutput};

type FileMap = Arc<RwLock<HashMap<String, Arc<Vec<u8>>>>>;

/// Configuration for memory-based storage.
#[derive(Debug, Clone)]
pub struct MemoryStorageConfig {
    /// Initial capacity of the file table.
    pub initial_capacity: usize,
}

impl Default for MemoryStorageConfig {
    fn default() -> Self {
        MemoryStorageConfig {
            initial_capacity: 16,
        }
    }
}

/// An in-memory storage implementation.
///
/// File contents are shared with open readers through `Arc`, so an input
/// keeps seeing the bytes it was opened on even if the file is replaced.
#[derive(Debug)]
pub struct MemoryStorage {
    files: FileMap,
    held_locks: Arc<Mutex<HashSet<String>>>,
    temp_counter: Mutex<u64>,
}

impl MemoryStorage {
    /// Create a new memory storage.
    pub fn new(config: MemoryStorageConfig) -> Self {
        MemoryStorage {
            files: Arc::new(RwLock::new(HashMap::with_capacity(config.initial_capacity))),
            held_locks: Arc::new(Mutex::new(HashSet::new())),
            temp_counter: Mutex::new(0),
        }
    }

    /// Create a new memory storage with default configuration.
    pub fn new_default() -> Self {
        Self::new(MemoryStorageConfig::default())
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.read().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.read().values().map(|data| data.len() as u64).sum()
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        let files = self.files.read();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput::new(
            name.to_string(),
            Arc::clone(&self.files),
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.read().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.write().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut file_names: Vec<String> = self.files.read().keys().cloned().collect();
        file_names.sort();
        Ok(file_names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.read();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.write();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;

        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn create_temp_output(&self, prefix: &str) -> Result<(String, Box<dyn StorageOutput>)> {
        let temp_name = {
            let mut counter = self.temp_counter.lock();
            let mut files = self.files.write();
            loop {
                let candidate = format!("{prefix}_{}.tmp", *counter);
                *counter += 1;
                if !files.contains_key(&candidate) {
                    // Reserve the name so concurrent callers never collide.
                    files.insert(candidate.clone(), Arc::new(Vec::new()));
                    break candidate;
                }
            }
        };

        let output = self.create_output(&temp_name)?;
        Ok((temp_name, output))
    }

    fn acquire_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let mut held = self.held_locks.lock();
        if !held.insert(name.to_string()) {
            return Err(StorageError::LockFailed(name.to_string()).into());
        }

        Ok(Box::new(MemoryLock {
            name: name.to_string(),
            held_locks: Arc::clone(&self.held_locks),
            released: false,
        }))
    }

    fn lock_exists(&self, name: &str) -> bool {
        self.held_locks.lock().contains(name)
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    data: Arc<Vec<u8>>,
    position: u64,
}

impl MemoryInput {
    /// Create an input reading over shared bytes.
    pub fn new(data: Arc<Vec<u8>>) -> Self {
        MemoryInput { data, position: 0 }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let start = (self.position as usize).min(self.data.len());
        let available = &self.data[start..];
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.position += n as u64;
        Ok(n)
    }
}

fn resolve_seek(pos: SeekFrom, current: u64, len: u64) -> std::io::Result<u64> {
    let target = match pos {
        SeekFrom::Start(offset) => Some(offset),
        SeekFrom::End(offset) => len.checked_add_signed(offset),
        SeekFrom::Current(offset) => current.checked_add_signed(offset),
    };
    target.ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "Invalid seek position")
    })
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.position = resolve_seek(pos, self.position, self.data.len() as u64)?;
        Ok(self.position)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(MemoryInput::new(Arc::clone(&self.data))))
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A memory-based output implementation.
///
/// Writes land at the current position, overwriting or extending the
/// buffer. The file becomes visible to readers on `close` (or drop).
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    position: u64,
    closed: bool,
}

impl MemoryOutput {
    fn new(name: String, files: FileMap) -> Self {
        MemoryOutput {
            name,
            buffer: Vec::new(),
            files,
            position: 0,
            closed: false,
        }
    }
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        let start = self.position as usize;
        if start > self.buffer.len() {
            self.buffer.resize(start, 0);
        }
        let overlap = (self.buffer.len() - start).min(buf.len());
        self.buffer[start..start + overlap].copy_from_slice(&buf[..overlap]);
        self.buffer.extend_from_slice(&buf[overlap..]);

        self.position += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl Seek for MemoryOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        if self.closed {
            return Err(std::io::Error::other("Output is closed"));
        }

        self.position = resolve_seek(pos, self.position, self.buffer.len() as u64)?;
        Ok(self.position)
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data = Arc::new(std::mem::take(&mut self.buffer));
            self.files.write().insert(self.name.clone(), data);
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// A named in-process lock.
#[derive(Debug)]
struct MemoryLock {
    name: String,
    held_locks: Arc<Mutex<HashSet<String>>>,
    released: bool,
}

impl StorageLock for MemoryLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.released = true;
            if !self.held_locks.lock().remove(&self.name) {
                return Err(IrIndexError::storage(format!(
                    "Lock {} was not held",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released
    }
}

impl Drop for MemoryLock {
    fn drop(&mut self) {
        let _ = self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_read_file() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("test.txt").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("test.txt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, World!");
        assert_eq!(input.size().unwrap(), 13);
        assert_eq!(storage.file_count(), 1);
        assert_eq!(storage.total_size(), 13);
    }

    #[test]
    fn test_write_after_seek_overwrites() {
        let storage = MemoryStorage::new_default();

        let mut output = storage.create_output("patched.bin").unwrap();
        output.write_all(b"0000abcd").unwrap();
        output.seek(SeekFrom::Start(0)).unwrap();
        output.write_all(b"12").unwrap();
        assert_eq!(output.position().unwrap(), 2);
        output.seek(SeekFrom::End(0)).unwrap();
        output.write_all(b"!").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("patched.bin").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"1200abcd!");
    }

    #[test]
    fn test_input_seek_and_clone() {
        let storage = MemoryStorage::new_default();
        let mut output = storage.create_output("data").unwrap();
        output.write_all(&[1, 2, 3, 4, 5]).unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("data").unwrap();
        input.seek(SeekFrom::Start(3)).unwrap();
        let mut byte = [0u8; 1];
        input.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 4);

        let mut cloned = input.clone_input().unwrap();
        cloned.read_exact(&mut byte).unwrap();
        assert_eq!(byte[0], 1);
        assert!(input.seek(SeekFrom::Current(-10)).is_err());
    }

    #[test]
    fn test_rename_replaces_target() {
        let storage = MemoryStorage::new_default();
        for (name, body) in [("a", b"old".as_slice()), ("b", b"new".as_slice())] {
            let mut output = storage.create_output(name).unwrap();
            output.write_all(body).unwrap();
            output.close().unwrap();
        }

        storage.rename_file("b", "a").unwrap();
        assert_eq!(storage.list_files().unwrap(), vec!["a"]);
        assert_eq!(storage.file_size("a").unwrap(), 3);
        assert!(storage.rename_file("missing", "a").is_err());
    }

    #[test]
    fn test_temp_names_are_unique() {
        let storage = MemoryStorage::new_default();
        let (first, _) = storage.create_temp_output("run").unwrap();
        let (second, _) = storage.create_temp_output("run").unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with("run_"));
    }

    #[test]
    fn test_locks() {
        let storage = MemoryStorage::new_default();
        let lock = storage.acquire_lock("write").unwrap();
        assert_eq!(lock.name(), "write");
        assert!(storage.lock_exists("write"));
        assert!(storage.acquire_lock("write").is_err());
        drop(lock);
        assert!(!storage.lock_exists("write"));
        assert!(storage.acquire_lock("write").is_ok());
    }
}
