use std::collections::HashMap;
use std::io::Read;

use crate::error::Result;
use crate::patch_format::{SyncOp, MAX_DATA_OP};
use crate::rolling_hash::{self, RollingHash};
use crate::signature::{self, BlockHash, SignatureInfo, StrongHash, BLOCK_SIZE};

/// Every block of a target signature, indexed by weak hash.
pub struct BlockLibrary {
    hash_lookup: HashMap<u32, Vec<BlockHash>>,
}

impl BlockLibrary {
    /// Empty files contribute nothing: a zero-length block can't be matched.
    pub fn new(signature: &SignatureInfo) -> Self {
        let mut hash_lookup: HashMap<u32, Vec<BlockHash>> =
            HashMap::with_capacity(signature.hashes.len());
        for hash in &signature.hashes {
            let empty = signature
                .container
                .files
                .get(hash.file_index)
                .is_none_or(|f| f.size == 0);
            if empty {
                continue;
            }
            hash_lookup.entry(hash.weak_hash).or_default().push(hash.clone());
        }
        Self { hash_lookup }
    }

    /// Find a block whose weak hash, strong hash and length match `data`.
    /// Blocks of `preferred_file_index` win over equal blocks elsewhere.
    fn find(
        &self,
        weak_hash: u32,
        data: &[u8],
        short_size: u32,
        preferred_file_index: Option<usize>,
    ) -> Option<&BlockHash> {
        let candidates = self.hash_lookup.get(&weak_hash)?;
        let mut strong: Option<StrongHash> = None;
        let mut found: Option<&BlockHash> = None;

        for candidate in candidates {
            if candidate.short_size != short_size {
                continue;
            }
            let strong = *strong.get_or_insert_with(|| *blake3::hash(data).as_bytes());
            if candidate.strong_hash != strong {
                continue;
            }
            if preferred_file_index.is_none_or(|p| p == candidate.file_index) {
                return Some(candidate);
            }
            if found.is_none() {
                found = Some(candidate);
            }
        }

        found
    }
}

/// Holds back block ranges so contiguous ones merge into a single op.
struct OpQueue<'e> {
    pending: Option<(usize, u64, u64)>,
    emit: &'e mut dyn FnMut(SyncOp) -> Result<()>,
}

impl OpQueue<'_> {
    fn block(&mut self, file_index: usize, block_index: u64) -> Result<()> {
        if let Some((f, start, span)) = self.pending.as_mut() {
            if *f == file_index && *start + *span == block_index {
                *span += 1;
                return Ok(());
            }
        }
        self.flush_block()?;
        self.pending = Some((file_index, block_index, 1));
        Ok(())
    }

    fn data(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        self.flush_block()?;
        for chunk in data.chunks(MAX_DATA_OP) {
            (self.emit)(SyncOp::Data(chunk.to_vec()))?;
        }
        Ok(())
    }

    fn flush_block(&mut self) -> Result<()> {
        if let Some((file_index, block_index, block_span)) = self.pending.take() {
            (self.emit)(SyncOp::BlockRange {
                file_index,
                block_index,
                block_span,
            })?;
        }
        Ok(())
    }
}

/// Compute the ops that rebuild `source` from blocks in `library`.
///
/// Scans with a rolling weak hash, confirms candidates with the strong hash,
/// and accumulates unmatched bytes into DATA ops. Adjacent block ranges are
/// merged. The sentinel is not emitted.
pub fn compute_ops(
    source: &mut dyn Read,
    library: &BlockLibrary,
    preferred_file_index: Option<usize>,
    emit: &mut dyn FnMut(SyncOp) -> Result<()>,
) -> Result<()> {
    let block_size = BLOCK_SIZE as usize;
    let mut buffer = vec![0u8; block_size * 2 + MAX_DATA_OP];
    let mut queue = OpQueue { pending: None, emit };

    // buffer[data_tail..tail] is unmatched data, buffer[tail..valid_to] unscanned input
    let mut data_tail = 0usize;
    let mut tail = 0usize;
    let mut valid_to = 0usize;
    let mut eof = false;

    let mut rolling = RollingHash::new();
    let mut rolling_valid = false;
    let mut popped: Option<u8> = None;

    loop {
        if !eof && tail + block_size > valid_to {
            if valid_to + block_size > buffer.len() {
                queue.data(&buffer[data_tail..tail])?;
                buffer.copy_within(tail..valid_to, 0);
                valid_to -= tail;
                tail = 0;
                data_tail = 0;
            }
            let want = tail + block_size;
            let n = signature::fill(source, &mut buffer[valid_to..want])?;
            valid_to += n;
            eof = valid_to < want;
        }

        let window_end = (tail + block_size).min(valid_to);
        let window = &buffer[tail..window_end];
        if window.is_empty() {
            break;
        }

        let short = window.len() < block_size;
        let weak = if short {
            rolling_hash::weak_hash(window)
        } else {
            match (rolling_valid, popped.take()) {
                (true, Some(old)) => rolling.rotate(old, window[block_size - 1]),
                _ => rolling.init(window),
            }
            rolling_valid = true;
            rolling.digest()
        };
        let short_size = if short { window.len() as u32 } else { 0 };

        if let Some(hit) = library.find(weak, window, short_size, preferred_file_index) {
            let (file_index, block_index) = (hit.file_index, hit.block_index);
            queue.data(&buffer[data_tail..tail])?;
            queue.block(file_index, block_index)?;
            tail = window_end;
            data_tail = tail;
            rolling_valid = false;
        } else if short {
            // last window, nothing left to roll over
            queue.data(&buffer[data_tail..valid_to])?;
            break;
        } else {
            popped = Some(buffer[tail]);
            tail += 1;
            if tail - data_tail >= MAX_DATA_OP {
                queue.data(&buffer[data_tail..tail])?;
                data_tail = tail;
            }
        }
    }

    queue.flush_block()
}
