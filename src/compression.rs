//! Pluggable compression for the wire format.
//!
//! Codecs live in an explicit [`CompressionRegistry`] that callers build once
//! and pass by reference. NONE is always available; GZIP and ZSTD are
//! registered by [`CompressionRegistry::with_defaults`]. BROTLI is a known
//! algorithm on the wire but has no default codec.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Read, Write};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompressionAlgorithm {
    None,
    Gzip,
    Brotli,
    Zstd,
}

impl CompressionAlgorithm {
    pub fn to_wire(self) -> u32 {
        match self {
            CompressionAlgorithm::None => 0,
            CompressionAlgorithm::Brotli => 1,
            CompressionAlgorithm::Gzip => 2,
            CompressionAlgorithm::Zstd => 3,
        }
    }

    pub fn from_wire(value: u32) -> Result<Self> {
        match value {
            0 => Ok(CompressionAlgorithm::None),
            1 => Ok(CompressionAlgorithm::Brotli),
            2 => Ok(CompressionAlgorithm::Gzip),
            3 => Ok(CompressionAlgorithm::Zstd),
            other => Err(Error::incompatible(format!(
                "unknown compression algorithm {}",
                other
            ))),
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Gzip => "gzip",
            CompressionAlgorithm::Brotli => "brotli",
            CompressionAlgorithm::Zstd => "zstd",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionSettings {
    pub algorithm: CompressionAlgorithm,
    pub quality: i32,
}

impl Default for CompressionSettings {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Zstd,
            quality: 9,
        }
    }
}

impl CompressionSettings {
    pub fn none() -> Self {
        Self {
            algorithm: CompressionAlgorithm::None,
            quality: 0,
        }
    }
}

impl fmt::Display for CompressionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-q{}", self.algorithm, self.quality)
    }
}

/// On-the-wire form of [`CompressionSettings`]. The algorithm stays a raw
/// number so unknown values surface as incompatibility, not as a decode error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireCompression {
    pub algorithm: u32,
    pub quality: i32,
}

impl From<CompressionSettings> for WireCompression {
    fn from(settings: CompressionSettings) -> Self {
        Self {
            algorithm: settings.algorithm.to_wire(),
            quality: settings.quality,
        }
    }
}

impl TryFrom<WireCompression> for CompressionSettings {
    type Error = Error;

    fn try_from(wire: WireCompression) -> Result<Self> {
        Ok(Self {
            algorithm: CompressionAlgorithm::from_wire(wire.algorithm)?,
            quality: wire.quality,
        })
    }
}

/// A writer whose stream has to be finalized explicitly (compressors write
/// trailers, files need flushing).
pub trait FinishWrite: Write {
    fn finish(self: Box<Self>) -> io::Result<()>;
}

/// Uncompressed sink around any writer.
pub struct PlainSink<W: Write>(pub W);

impl<W: Write> Write for PlainSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl<W: Write> FinishWrite for PlainSink<W> {
    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.0.flush()
    }
}

pub trait Compressor: Send + Sync {
    /// Reject qualities this codec doesn't understand.
    fn check_quality(&self, _quality: i32) -> Result<()> {
        Ok(())
    }

    fn wrap<'a>(
        &self,
        inner: Box<dyn FinishWrite + 'a>,
        quality: i32,
    ) -> io::Result<Box<dyn FinishWrite + 'a>>;
}

pub trait Decompressor: Send + Sync {
    fn wrap<'a>(&self, inner: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>>;
}

struct ZstdSink<'a>(zstd::stream::write::Encoder<'static, Box<dyn FinishWrite + 'a>>);

impl Write for ZstdSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for ZstdSink<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let ZstdSink(encoder) = *self;
        let inner = encoder.finish()?;
        inner.finish()
    }
}

pub struct ZstdCodec;

impl Compressor for ZstdCodec {
    fn check_quality(&self, quality: i32) -> Result<()> {
        if (1..=22).contains(&quality) {
            Ok(())
        } else {
            Err(Error::InvalidOptions(format!(
                "zstd quality must be within 1..=22, got {}",
                quality
            )))
        }
    }

    fn wrap<'a>(
        &self,
        inner: Box<dyn FinishWrite + 'a>,
        quality: i32,
    ) -> io::Result<Box<dyn FinishWrite + 'a>> {
        let encoder = zstd::stream::write::Encoder::new(inner, quality)?;
        Ok(Box::new(ZstdSink(encoder)))
    }
}

impl Decompressor for ZstdCodec {
    fn wrap<'a>(&self, inner: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(zstd::stream::read::Decoder::new(inner)?))
    }
}

struct GzipSink<'a>(flate2::write::GzEncoder<Box<dyn FinishWrite + 'a>>);

impl Write for GzipSink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

impl FinishWrite for GzipSink<'_> {
    fn finish(self: Box<Self>) -> io::Result<()> {
        let GzipSink(encoder) = *self;
        let inner = encoder.finish()?;
        inner.finish()
    }
}

pub struct GzipCodec;

impl Compressor for GzipCodec {
    fn check_quality(&self, quality: i32) -> Result<()> {
        if (0..=9).contains(&quality) {
            Ok(())
        } else {
            Err(Error::InvalidOptions(format!(
                "gzip quality must be within 0..=9, got {}",
                quality
            )))
        }
    }

    fn wrap<'a>(
        &self,
        inner: Box<dyn FinishWrite + 'a>,
        quality: i32,
    ) -> io::Result<Box<dyn FinishWrite + 'a>> {
        let level = flate2::Compression::new(quality.clamp(0, 9) as u32);
        Ok(Box::new(GzipSink(flate2::write::GzEncoder::new(inner, level))))
    }
}

impl Decompressor for GzipCodec {
    fn wrap<'a>(&self, inner: Box<dyn Read + 'a>) -> io::Result<Box<dyn Read + 'a>> {
        Ok(Box::new(flate2::read::GzDecoder::new(inner)))
    }
}

/// Codecs keyed by algorithm.
#[derive(Default)]
pub struct CompressionRegistry {
    compressors: HashMap<CompressionAlgorithm, Box<dyn Compressor>>,
    decompressors: HashMap<CompressionAlgorithm, Box<dyn Decompressor>>,
}

impl CompressionRegistry {
    /// A registry that only knows NONE.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_compressor(CompressionAlgorithm::Gzip, Box::new(GzipCodec));
        registry.register_decompressor(CompressionAlgorithm::Gzip, Box::new(GzipCodec));
        registry.register_compressor(CompressionAlgorithm::Zstd, Box::new(ZstdCodec));
        registry.register_decompressor(CompressionAlgorithm::Zstd, Box::new(ZstdCodec));
        registry
    }

    pub fn register_compressor(
        &mut self,
        algorithm: CompressionAlgorithm,
        codec: Box<dyn Compressor>,
    ) {
        self.compressors.insert(algorithm, codec);
    }

    pub fn register_decompressor(
        &mut self,
        algorithm: CompressionAlgorithm,
        codec: Box<dyn Decompressor>,
    ) {
        self.decompressors.insert(algorithm, codec);
    }

    /// Fail early if `settings` can't be used for writing.
    pub fn check(&self, settings: &CompressionSettings) -> Result<()> {
        if settings.algorithm == CompressionAlgorithm::None {
            return Ok(());
        }
        self.compressor(settings.algorithm)?
            .check_quality(settings.quality)
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> Result<&dyn Compressor> {
        self.compressors
            .get(&algorithm)
            .map(|c| c.as_ref())
            .ok_or_else(|| {
                Error::incompatible(format!("no compressor registered for {}", algorithm))
            })
    }

    fn decompressor(&self, algorithm: CompressionAlgorithm) -> Result<&dyn Decompressor> {
        self.decompressors
            .get(&algorithm)
            .map(|c| c.as_ref())
            .ok_or_else(|| {
                Error::incompatible(format!("no decompressor registered for {}", algorithm))
            })
    }

    pub fn compress<'a>(
        &self,
        inner: Box<dyn FinishWrite + 'a>,
        settings: &CompressionSettings,
    ) -> Result<Box<dyn FinishWrite + 'a>> {
        if settings.algorithm == CompressionAlgorithm::None {
            return Ok(inner);
        }
        self.check(settings)?;
        Ok(self.compressor(settings.algorithm)?.wrap(inner, settings.quality)?)
    }

    pub fn decompress<'a>(
        &self,
        inner: Box<dyn Read + 'a>,
        settings: &CompressionSettings,
    ) -> Result<Box<dyn Read + 'a>> {
        if settings.algorithm == CompressionAlgorithm::None {
            return Ok(inner);
        }
        Ok(self.decompressor(settings.algorithm)?.wrap(inner)?)
    }
}
