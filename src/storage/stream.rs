//! Byte-level stream abstraction under the disk service: positioned page
//! reads/writes over a file or an in-memory buffer, with an optional AES
//! layer stacked by the factory.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use super::aes::AesStream;
use super::page::PAGE_SIZE;
use crate::config::EngineSettings;
use crate::error::{DbError, Result};

/// Positioned I/O in whole pages. Implementations are wrapped in a mutex by
/// the disk service; methods take `&mut self`.
pub trait PageStream: Send {
    /// Read exactly one page at `position`. Reading past the end zero-fills.
    fn read_page(&mut self, position: u64, buf: &mut [u8]) -> Result<()>;

    fn write_page(&mut self, position: u64, buf: &[u8]) -> Result<()>;

    fn flush(&mut self) -> Result<()>;

    fn len(&self) -> Result<u64>;

    fn set_len(&mut self, len: u64) -> Result<()>;
}

// ============================================================================
// File stream
// ============================================================================

pub struct FileStream {
    file: File,
    /// Direct mode holds the OS lock for the engine lifetime.
    locked: bool,
}

impl FileStream {
    pub fn open(path: &Path, read_only: bool, exclusive: bool) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .create(!read_only)
            .open(path)?;
        let mut stream = FileStream {
            file,
            locked: false,
        };
        if exclusive {
            stream
                .file
                .try_lock()
                .map_err(|_| DbError::usage(format!(
                    "database file '{}' is locked by another process",
                    path.display()
                )))?;
            stream.locked = true;
        }
        Ok(stream)
    }
}

impl PageStream for FileStream {
    fn read_page(&mut self, position: u64, buf: &mut [u8]) -> Result<()> {
        let len = self.file.metadata()?.len();
        if position >= len {
            buf.fill(0);
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(position))?;
        let available = ((len - position) as usize).min(buf.len());
        self.file.read_exact(&mut buf[..available])?;
        buf[available..].fill(0);
        Ok(())
    }

    fn write_page(&mut self, position: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(position))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        if self.locked {
            let _ = self.file.unlock();
        }
    }
}

// ============================================================================
// Memory stream
// ============================================================================

/// Shared backing buffer so `:memory:` data and its log can be handed to a
/// rebuild reader without copying.
pub type MemoryBuffer = Arc<Mutex<Vec<u8>>>;

pub struct MemoryStream {
    buffer: MemoryBuffer,
}

impl MemoryStream {
    pub fn new(buffer: MemoryBuffer) -> Self {
        MemoryStream { buffer }
    }
}

impl PageStream for MemoryStream {
    fn read_page(&mut self, position: u64, buf: &mut [u8]) -> Result<()> {
        let data = self.buffer.lock();
        let position = position as usize;
        if position >= data.len() {
            buf.fill(0);
            return Ok(());
        }
        let available = (data.len() - position).min(buf.len());
        buf[..available].copy_from_slice(&data[position..position + available]);
        buf[available..].fill(0);
        Ok(())
    }

    fn write_page(&mut self, position: u64, buf: &[u8]) -> Result<()> {
        let mut data = self.buffer.lock();
        let position = position as usize;
        if data.len() < position + buf.len() {
            data.resize(position + buf.len(), 0);
        }
        data[position..position + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.buffer.lock().len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.buffer.lock().resize(len as usize, 0);
        Ok(())
    }
}

// ============================================================================
// Stream factory
// ============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Data,
    Log,
    Temp,
}

/// Builds the engine's streams from the frozen settings, sharing memory
/// buffers across re-opens of the same in-memory engine and stacking the AES
/// layer when a password is set.
pub struct StreamFactory {
    settings: EngineSettings,
    memory_data: MemoryBuffer,
    memory_log: MemoryBuffer,
    memory_temp: MemoryBuffer,
    /// Key material shared by every encrypted stream of this engine.
    crypto: Mutex<Option<AesStream>>,
    /// Next free byte range in the temp stream; sorters reserve page-aligned
    /// containers from here.
    temp_alloc: std::sync::atomic::AtomicU64,
}

impl StreamFactory {
    pub fn new(settings: EngineSettings) -> Self {
        StreamFactory {
            settings,
            memory_data: Arc::new(Mutex::new(Vec::new())),
            memory_log: Arc::new(Mutex::new(Vec::new())),
            memory_temp: Arc::new(Mutex::new(Vec::new())),
            crypto: Mutex::new(None),
            temp_alloc: std::sync::atomic::AtomicU64::new(0),
        }
    }

    /// Reserve a page-aligned byte range in the temp stream.
    pub fn reserve_temp(&self, bytes: u64) -> u64 {
        let aligned = bytes.next_multiple_of(PAGE_SIZE as u64);
        self.temp_alloc
            .fetch_add(aligned, std::sync::atomic::Ordering::Relaxed)
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn is_in_memory(&self) -> bool {
        self.settings.is_in_memory() || self.settings.is_temp()
    }

    fn path_for(&self, kind: StreamKind) -> PathBuf {
        match kind {
            StreamKind::Data => PathBuf::from(&self.settings.filename),
            StreamKind::Log => self.settings.log_path(),
            StreamKind::Temp => self.settings.temp_path(),
        }
    }

    /// Install the cipher once the salt is known (creation or open).
    pub fn set_crypto(&self, crypto: AesStream) {
        *self.crypto.lock() = Some(crypto);
    }

    pub fn has_crypto(&self) -> bool {
        self.crypto.lock().is_some()
    }

    pub fn open(&self, kind: StreamKind) -> Result<Box<dyn PageStream>> {
        let raw: Box<dyn PageStream> = if self.is_in_memory() {
            let buffer = match kind {
                StreamKind::Data => self.memory_data.clone(),
                StreamKind::Log => self.memory_log.clone(),
                StreamKind::Temp => self.memory_temp.clone(),
            };
            Box::new(MemoryStream::new(buffer))
        } else {
            // shared mode leaves cross-process exclusion to the caller-side
            // system mutex; direct mode pins the file to this process
            let exclusive = kind == StreamKind::Data
                && !self.settings.read_only
                && self.settings.connection == crate::config::ConnectionMode::Direct;
            let read_only = self.settings.read_only && kind == StreamKind::Data;
            Box::new(FileStream::open(&self.path_for(kind), read_only, exclusive)?)
        };

        // temp sort spill is never encrypted; it holds only transient keys
        if kind == StreamKind::Temp {
            return Ok(raw);
        }
        match self.crypto.lock().as_ref() {
            Some(crypto) => Ok(Box::new(crypto.wrap(raw, kind))),
            None => Ok(raw),
        }
    }

    /// Raw (cipher-free) view, used while probing a file before the password
    /// has been verified.
    pub fn open_raw(&self, kind: StreamKind) -> Result<Box<dyn PageStream>> {
        if self.is_in_memory() {
            let buffer = match kind {
                StreamKind::Data => self.memory_data.clone(),
                StreamKind::Log => self.memory_log.clone(),
                StreamKind::Temp => self.memory_temp.clone(),
            };
            return Ok(Box::new(MemoryStream::new(buffer)));
        }
        let read_only = self.settings.read_only && kind == StreamKind::Data;
        Ok(Box::new(FileStream::open(
            &self.path_for(kind),
            read_only,
            false,
        )?))
    }

    pub fn data_exists(&self) -> Result<bool> {
        if self.is_in_memory() {
            return Ok(self.memory_data.lock().len() >= PAGE_SIZE);
        }
        let path = self.path_for(StreamKind::Data);
        Ok(path.exists() && std::fs::metadata(path)?.len() as usize >= PAGE_SIZE)
    }

    pub fn delete(&self, kind: StreamKind) -> Result<()> {
        if self.is_in_memory() {
            let buffer = match kind {
                StreamKind::Data => &self.memory_data,
                StreamKind::Log => &self.memory_log,
                StreamKind::Temp => &self.memory_temp,
            };
            buffer.lock().clear();
            return Ok(());
        }
        let path = self.path_for(kind);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    pub fn log_exists(&self) -> bool {
        if self.is_in_memory() {
            !self.memory_log.lock().is_empty()
        } else {
            self.path_for(StreamKind::Log).exists()
        }
    }
}
