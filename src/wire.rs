//! Length-prefixed message framing.
//!
//! A message is a u32 little-endian byte length followed by its bincode
//! encoding. The magic number is a bare little-endian i32.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, BufReader, Read, Write};

use crate::compression::{CompressionRegistry, CompressionSettings, FinishWrite, PlainSink};
use crate::error::{Error, Result};

/// Refuse to allocate for frames larger than this.
pub const MAX_MESSAGE_SIZE: u32 = 512 * 1024 * 1024;

pub struct WireWriter<'a> {
    sink: Box<dyn FinishWrite + 'a>,
    scratch: Vec<u8>,
}

impl<'a> WireWriter<'a> {
    pub fn new(writer: impl Write + 'a) -> Self {
        Self {
            sink: Box::new(PlainSink(writer)),
            scratch: Vec::new(),
        }
    }

    pub fn write_magic(&mut self, magic: i32) -> Result<()> {
        self.sink.write_all(&magic.to_le_bytes())?;
        Ok(())
    }

    pub fn write_message<T: Serialize>(&mut self, message: &T) -> Result<()> {
        self.scratch.clear();
        bincode::serialize_into(&mut self.scratch, message)?;
        let len = u32::try_from(self.scratch.len())
            .ok()
            .filter(|len| *len <= MAX_MESSAGE_SIZE)
            .ok_or_else(|| {
                let size = self.scratch.len();
                Error::InvalidOptions(format!("message of {} bytes is too large", size))
            })?;
        self.sink.write_all(&len.to_le_bytes())?;
        self.sink.write_all(&self.scratch)?;
        Ok(())
    }

    /// Route everything written from now on through a compressor.
    pub fn compress(
        self,
        settings: &CompressionSettings,
        registry: &CompressionRegistry,
    ) -> Result<Self> {
        Ok(Self {
            sink: registry.compress(self.sink, settings)?,
            scratch: self.scratch,
        })
    }

    /// Finalize compression and flush.
    pub fn close(self) -> Result<()> {
        self.sink.finish()?;
        Ok(())
    }
}

pub struct WireReader<'a> {
    source: Box<dyn Read + 'a>,
    scratch: Vec<u8>,
}

impl<'a> WireReader<'a> {
    pub fn new(reader: impl Read + 'a) -> Self {
        Self {
            source: Box::new(BufReader::new(reader)),
            scratch: Vec::new(),
        }
    }

    pub fn expect_magic(&mut self, expected: i32) -> Result<()> {
        let mut buf = [0u8; 4];
        read_exact_or_malformed(&mut self.source, &mut buf, "magic")?;
        let magic = i32::from_le_bytes(buf);
        if magic != expected {
            return Err(Error::malformed(format!(
                "wrong magic: expected {:#x}, got {:#x}",
                expected, magic
            )));
        }
        Ok(())
    }

    pub fn read_message<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut len = [0u8; 4];
        read_exact_or_malformed(&mut self.source, &mut len, "message length")?;
        self.read_body(u32::from_le_bytes(len))
    }

    fn read_body<T: DeserializeOwned>(&mut self, len: u32) -> Result<T> {
        if len > MAX_MESSAGE_SIZE {
            return Err(Error::malformed(format!("message of {} bytes is too large", len)));
        }
        self.scratch.resize(len as usize, 0);
        read_exact_or_malformed(&mut self.source, &mut self.scratch, "message body")?;
        bincode::deserialize(&self.scratch)
            .map_err(|e| Error::malformed(format!("undecodable message: {}", e)))
    }

    /// Like `read_message`, but a clean end of stream (no bytes at all
    /// where the next frame would start) yields `None`.
    pub fn try_read_message<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        let mut first = [0u8; 1];
        loop {
            match self.source.read(&mut first) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let mut rest = [0u8; 3];
        read_exact_or_malformed(&mut self.source, &mut rest, "message length")?;
        let len = u32::from_le_bytes([first[0], rest[0], rest[1], rest[2]]);
        self.read_body(len).map(Some)
    }

    /// Read everything from now on through a decompressor.
    pub fn decompress(
        self,
        settings: &CompressionSettings,
        registry: &CompressionRegistry,
    ) -> Result<Self> {
        Ok(Self {
            source: registry.decompress(self.source, settings)?,
            scratch: self.scratch,
        })
    }
}

fn read_exact_or_malformed(source: &mut dyn Read, buf: &mut [u8], what: &str) -> Result<()> {
    match source.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::malformed(format!(
            "truncated stream while reading {}",
            what
        ))),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::CompressionAlgorithm;
    use crate::patch_format::{SyncOp, PATCH_MAGIC, SIGNATURE_MAGIC};

    fn write_sample(settings: CompressionSettings) -> Vec<u8> {
        let registry = CompressionRegistry::with_defaults();
        let mut buf = Vec::new();
        {
            let mut w = WireWriter::new(&mut buf);
            w.write_magic(PATCH_MAGIC).unwrap();
            w.write_message(&7u32).unwrap();
            let mut w = w.compress(&settings, &registry).unwrap();
            w.write_message(&SyncOp::Data(vec![1, 2, 3])).unwrap();
            w.write_message(&SyncOp::HeyYouDidIt).unwrap();
            w.close().unwrap();
        }
        buf
    }

    #[test]
    fn test_framing_with_compression() {
        let registry = CompressionRegistry::with_defaults();
        let settings = CompressionSettings {
            algorithm: CompressionAlgorithm::Zstd,
            quality: 1,
        };
        let buf = write_sample(settings);

        let mut r = WireReader::new(&buf[..]);
        r.expect_magic(PATCH_MAGIC).unwrap();
        assert_eq!(r.read_message::<u32>().unwrap(), 7);
        let mut r = r.decompress(&settings, &registry).unwrap();
        assert_eq!(r.read_message::<SyncOp>().unwrap(), SyncOp::Data(vec![1, 2, 3]));
        assert_eq!(r.read_message::<SyncOp>().unwrap(), SyncOp::HeyYouDidIt);
    }

    #[test]
    fn test_wrong_magic_is_malformed() {
        let buf = write_sample(CompressionSettings::none());
        let mut r = WireReader::new(&buf[..]);
        assert!(matches!(r.expect_magic(SIGNATURE_MAGIC), Err(Error::MalformedPatch(_))));
    }

    #[test]
    fn test_truncation_is_malformed() {
        let buf = write_sample(CompressionSettings::none());
        let mut r = WireReader::new(&buf[..buf.len() - 2]);
        r.expect_magic(PATCH_MAGIC).unwrap();
        r.read_message::<u32>().unwrap();
        r.read_message::<SyncOp>().unwrap();
        assert!(matches!(r.read_message::<SyncOp>(), Err(Error::MalformedPatch(_))));
    }

    #[test]
    fn test_try_read_message_stops_at_clean_end() {
        let buf = write_sample(CompressionSettings::none());
        let mut r = WireReader::new(&buf[..]);
        r.expect_magic(PATCH_MAGIC).unwrap();
        assert_eq!(r.try_read_message::<u32>().unwrap(), Some(7));
        r.read_message::<SyncOp>().unwrap();
        r.read_message::<SyncOp>().unwrap();
        assert_eq!(r.try_read_message::<SyncOp>().unwrap(), None);
    }
}
