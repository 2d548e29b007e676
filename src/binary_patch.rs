use std::io::{self, Read, SeekFrom, Write};

use crate::error::{Error, Result};
use crate::patch_format::SyncOp;
use crate::pool::{Pool, ReadSeek};
use crate::signature::BLOCK_SIZE;

const COPY_BUFFER_SIZE: usize = 256 * 1024;

/// Replays rsync ops against a pool of target files.
///
/// Keeps the last target reader open, since consecutive block ranges
/// usually come from the same file.
pub struct OpApplier<'p> {
    pool: &'p dyn Pool,
    buffer: Vec<u8>,
    reader: Option<(usize, Box<dyn ReadSeek>)>,
}

impl<'p> OpApplier<'p> {
    pub fn new(pool: &'p dyn Pool) -> Self {
        Self {
            pool,
            buffer: vec![0u8; COPY_BUFFER_SIZE],
            reader: None,
        }
    }

    /// Apply one op to `out`, returning the number of bytes written.
    /// The sentinel writes nothing.
    pub fn apply(&mut self, op: &SyncOp, out: &mut dyn Write) -> Result<u64> {
        match op {
            SyncOp::BlockRange {
                file_index,
                block_index,
                block_span,
            } => self.copy_blocks(*file_index, *block_index, *block_span, out),
            SyncOp::Data(data) => {
                out.write_all(data)?;
                Ok(data.len() as u64)
            }
            SyncOp::HeyYouDidIt => Ok(0),
        }
    }

    fn copy_blocks(
        &mut self,
        file_index: usize,
        block_index: u64,
        block_span: u64,
        out: &mut dyn Write,
    ) -> Result<u64> {
        let file_size = self.pool.size(file_index);
        let start = block_index
            .checked_mul(BLOCK_SIZE)
            .filter(|start| *start <= file_size)
            .ok_or_else(|| {
                Error::malformed(format!(
                    "block {} is past the end of target file {} ({} bytes)",
                    block_index, file_index, file_size
                ))
            })?;
        let len = block_span.saturating_mul(BLOCK_SIZE).min(file_size - start);

        let mut reader = match self.reader.take() {
            Some((idx, reader)) if idx == file_index => reader,
            _ => self.pool.reader(file_index)?,
        };
        reader.seek(SeekFrom::Start(start))?;

        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(self.buffer.len() as u64) as usize;
            let n = reader.read(&mut self.buffer[..want])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("target file {} ended {} bytes early", file_index, remaining),
                )
                .into());
            }
            out.write_all(&self.buffer[..n])?;
            remaining -= n as u64;
        }

        self.reader = Some((file_index, reader));
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    struct BytesPool(Vec<Vec<u8>>);

    impl Pool for BytesPool {
        fn size(&self, file_index: usize) -> u64 {
            self.0[file_index].len() as u64
        }

        fn reader(&self, file_index: usize) -> Result<Box<dyn ReadSeek>> {
            Ok(Box::new(Cursor::new(self.0[file_index].clone())))
        }
    }

    const BS: usize = BLOCK_SIZE as usize;

    #[test]
    fn test_block_range_is_clamped_to_file_end() {
        let data: Vec<u8> = (0..BS * 2 + 14).map(|i| i as u8).collect();
        let pool = BytesPool(vec![data.clone()]);
        let mut applier = OpApplier::new(&pool);
        let mut out = Vec::new();
        let op = SyncOp::BlockRange {
            file_index: 0,
            block_index: 1,
            block_span: 2,
        };
        assert_eq!(applier.apply(&op, &mut out).unwrap(), (BS + 14) as u64);
        assert_eq!(out, &data[BS..]);
    }

    #[test]
    fn test_mixed_ops_across_files() {
        let a = vec![1u8; BS];
        let b = vec![2u8; BS];
        let pool = BytesPool(vec![a, b]);
        let mut applier = OpApplier::new(&pool);
        let mut out = Vec::new();
        let ops = [
            SyncOp::BlockRange {
                file_index: 1,
                block_index: 0,
                block_span: 1,
            },
            SyncOp::Data(b"xyz".to_vec()),
            SyncOp::BlockRange {
                file_index: 0,
                block_index: 0,
                block_span: 1,
            },
            SyncOp::HeyYouDidIt,
        ];
        let written: u64 = ops.iter().map(|op| applier.apply(op, &mut out).unwrap()).sum();
        assert_eq!(written, (BS * 2 + 3) as u64);
        assert_eq!(&out[..BS], &vec![2u8; BS][..]);
        assert_eq!(&out[BS..BS + 3], b"xyz");
        assert_eq!(&out[BS + 3..], &vec![1u8; BS][..]);
    }

    #[test]
    fn test_block_past_end_is_malformed() {
        let pool = BytesPool(vec![vec![0u8; 10]]);
        let mut applier = OpApplier::new(&pool);
        let op = SyncOp::BlockRange {
            file_index: 0,
            block_index: 3,
            block_span: 1,
        };
        assert!(matches!(
            applier.apply(&op, &mut Vec::new()),
            Err(Error::MalformedPatch(_))
        ));
    }
}
