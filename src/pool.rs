//! Byte sources and sinks addressed by file index.
//!
//! Engines never touch paths directly: they read target files through a
//! [`Pool`] and write output files through a [`WritablePool`], so the same
//! code works against a directory, a staging area, or a validator.

use memmap2::Mmap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Seek, Write};
use std::ops::Deref;
use std::path::{Path, PathBuf};

use crate::container::Container;
use crate::error::{Error, Result};
use crate::util;

pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

pub trait Pool: Send + Sync {
    /// Size the container records for this file.
    fn size(&self, file_index: usize) -> u64;

    /// Seekable reader positioned at the start of the file.
    fn reader(&self, file_index: usize) -> Result<Box<dyn ReadSeek>>;

    /// Whole contents of a file, for engines that need random access.
    fn load(&self, file_index: usize) -> Result<FileBytes> {
        let mut buf = Vec::with_capacity(self.size(file_index) as usize);
        self.reader(file_index)?.read_to_end(&mut buf)?;
        Ok(FileBytes::Owned(buf))
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub enum FileBytes {
    Mapped(Mmap),
    Owned(Vec<u8>),
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(map) => &map[..],
            FileBytes::Owned(buf) => buf.as_slice(),
        }
    }
}

/// Output handle for one file. Nothing is guaranteed to be on disk until
/// `finish` succeeds.
pub trait PoolWriter: Write + Send {
    fn finish(self: Box<Self>) -> Result<()>;
}

pub trait WritablePool: Pool {
    /// Create or truncate the file and return a writer for it.
    fn writer(&self, file_index: usize) -> Result<Box<dyn PoolWriter>>;
}

/// Files of a container, rooted at a directory.
pub struct FsPool {
    container: Container,
    base: PathBuf,
}

impl FsPool {
    pub fn new(container: &Container, base: impl Into<PathBuf>) -> Self {
        Self {
            container: container.clone(),
            base: base.into(),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn container(&self) -> &Container {
        &self.container
    }

    pub fn path(&self, file_index: usize) -> Result<PathBuf> {
        let file = self.container.files.get(file_index).ok_or_else(|| {
            Error::InvalidOptions(format!("file index {} out of range", file_index))
        })?;
        Ok(util::native_path(&self.base, &file.path))
    }
}

impl Pool for FsPool {
    fn size(&self, file_index: usize) -> u64 {
        self.container.files.get(file_index).map_or(0, |f| f.size)
    }

    fn reader(&self, file_index: usize) -> Result<Box<dyn ReadSeek>> {
        let file = File::open(self.path(file_index)?)?;
        Ok(Box::new(BufReader::with_capacity(256 * 1024, file)))
    }

    fn load(&self, file_index: usize) -> Result<FileBytes> {
        Ok(match util::mmap_file(&self.path(file_index)?)? {
            Some(map) => FileBytes::Mapped(map),
            None => FileBytes::Owned(Vec::new()),
        })
    }
}

impl WritablePool for FsPool {
    fn writer(&self, file_index: usize) -> Result<Box<dyn PoolWriter>> {
        let path = self.path(file_index)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Box::new(FsWriter {
            inner: BufWriter::with_capacity(256 * 1024, file),
            path,
            mode: self.container.files[file_index].mode,
        }))
    }
}

struct FsWriter {
    inner: BufWriter<File>,
    path: PathBuf,
    mode: u32,
}

impl Write for FsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl PoolWriter for FsWriter {
    fn finish(mut self: Box<Self>) -> Result<()> {
        self.inner.flush()?;
        util::apply_mode(&self.path, self.mode)?;
        Ok(())
    }
}

/// Writable pool that throws every byte away.
pub struct NullPool {
    sizes: Vec<u64>,
}

impl NullPool {
    pub fn new(container: &Container) -> Self {
        Self {
            sizes: container.files.iter().map(|f| f.size).collect(),
        }
    }
}

impl Pool for NullPool {
    fn size(&self, file_index: usize) -> u64 {
        self.sizes.get(file_index).copied().unwrap_or(0)
    }

    fn reader(&self, _file_index: usize) -> Result<Box<dyn ReadSeek>> {
        Err(Error::InvalidOptions("null pool cannot be read".into()))
    }
}

impl WritablePool for NullPool {
    fn writer(&self, _file_index: usize) -> Result<Box<dyn PoolWriter>> {
        Ok(Box::new(NullWriter))
    }
}

struct NullWriter;

impl Write for NullWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl PoolWriter for NullWriter {
    fn finish(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
