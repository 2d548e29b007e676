//! Suffix-array binary diff between two whole files.
//!
//! Produces the classic bsdiff triples (diff bytes, extra bytes, seek) as a
//! stream of [`BsdiffControl`] messages terminated by an `eof` control.
//! Suffix sorting is done by `divsufsort`.

use std::io::Write;

use crate::error::{Error, Result};
use crate::patch_format::{BsdiffControl, MAX_DATA_OP};

fn matchlen(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

/// Longest match of `needle` among the suffixes of `old`, as `(pos, len)`.
fn search(sa: &[i32], old: &[u8], needle: &[u8]) -> (usize, usize) {
    if sa.is_empty() || needle.is_empty() {
        return (0, 0);
    }

    let mut st = 0usize;
    let mut en = sa.len() - 1;
    while en - st > 1 {
        let pivot = st + (en - st) / 2;
        let pos = sa[pivot] as usize;
        let len = matchlen(&old[pos..], needle);
        if len == needle.len() || (pos + len < old.len() && old[pos + len] < needle[len]) {
            st = pivot;
        } else {
            en = pivot;
        }
    }

    let (st_pos, en_pos) = (sa[st] as usize, sa[en] as usize);
    let st_len = matchlen(&old[st_pos..], needle);
    let en_len = matchlen(&old[en_pos..], needle);
    if st_len > en_len {
        (st_pos, st_len)
    } else {
        (en_pos, en_len)
    }
}

/// Splits oversized diff/extra runs so no control carries more than
/// `MAX_DATA_OP` bytes in either buffer.
fn emit_triple(
    add: Vec<u8>,
    copy: &[u8],
    seek: i64,
    emit: &mut dyn FnMut(BsdiffControl) -> Result<()>,
) -> Result<()> {
    if add.len() <= MAX_DATA_OP && copy.len() <= MAX_DATA_OP {
        return emit(BsdiffControl {
            add,
            copy: copy.to_vec(),
            seek,
            eof: false,
        });
    }

    for chunk in add.chunks(MAX_DATA_OP) {
        emit(BsdiffControl {
            add: chunk.to_vec(),
            ..Default::default()
        })?;
    }
    let mut copies = copy.chunks(MAX_DATA_OP).peekable();
    if copies.peek().is_none() {
        return emit(BsdiffControl {
            seek,
            ..Default::default()
        });
    }
    while let Some(chunk) = copies.next() {
        emit(BsdiffControl {
            copy: chunk.to_vec(),
            seek: if copies.peek().is_none() { seek } else { 0 },
            ..Default::default()
        })?;
    }
    Ok(())
}

/// Diff `new` against `old`, emitting controls and a final `eof` control.
#[allow(clippy::suspicious_operation_groupings)]
pub fn diff(
    old: &[u8],
    new: &[u8],
    emit: &mut dyn FnMut(BsdiffControl) -> Result<()>,
) -> Result<()> {
    let old_size = old.len();
    let new_size = new.len();

    let mut sa = vec![0i32; old_size];
    if old_size > 0 {
        divsufsort::sort_in_place(old, &mut sa);
    }

    let mut scan = 0usize;
    let mut len = 0usize;
    let mut pos = 0usize;
    let mut lastscan = 0usize;
    let mut lastpos = 0usize;
    let mut lastoffset = 0i64;

    let drift_matches = |at: usize, offset: i64| -> bool {
        let old_idx = at as i64 + offset;
        old_idx >= 0 && (old_idx as usize) < old_size && old[old_idx as usize] == new[at]
    };

    while scan < new_size {
        let mut oldscore = 0i64;
        scan += len;
        let mut scsc = scan;

        while scan < new_size {
            (pos, len) = search(&sa, old, &new[scan..]);

            while scsc < scan + len {
                if drift_matches(scsc, lastoffset) {
                    oldscore += 1;
                }
                scsc += 1;
            }

            if (len as i64 == oldscore && len != 0) || len as i64 > oldscore + 8 {
                break;
            }

            if drift_matches(scan, lastoffset) {
                oldscore -= 1;
            }
            scan += 1;
        }

        if len as i64 == oldscore && scan != new_size {
            continue;
        }

        // extend the previous match forward
        let mut lenf = 0usize;
        {
            let (mut s, mut sf) = (0i64, 0i64);
            let mut i = 0usize;
            while lastscan + i < scan && lastpos + i < old_size {
                if old[lastpos + i] == new[lastscan + i] {
                    s += 1;
                }
                i += 1;
                if s * 2 - i as i64 > sf * 2 - lenf as i64 {
                    sf = s;
                    lenf = i;
                }
            }
        }

        // extend the new match backward
        let mut lenb = 0usize;
        if scan < new_size {
            let (mut s, mut sb) = (0i64, 0i64);
            let mut i = 1usize;
            while scan >= lastscan + i && pos >= i {
                if old[pos - i] == new[scan - i] {
                    s += 1;
                }
                if s * 2 - i as i64 > sb * 2 - lenb as i64 {
                    sb = s;
                    lenb = i;
                }
                i += 1;
            }
        }

        if lastscan + lenf > scan - lenb {
            let overlap = (lastscan + lenf) - (scan - lenb);
            let (mut s, mut ss) = (0i64, 0i64);
            let mut lens = 0usize;
            for i in 0..overlap {
                if new[lastscan + lenf - overlap + i] == old[lastpos + lenf - overlap + i] {
                    s += 1;
                }
                if new[scan - lenb + i] == old[pos - lenb + i] {
                    s -= 1;
                }
                if s > ss {
                    ss = s;
                    lens = i + 1;
                }
            }
            lenf = lenf + lens - overlap;
            lenb -= lens;
        }

        let add: Vec<u8> = (0..lenf)
            .map(|i| new[lastscan + i].wrapping_sub(old[lastpos + i]))
            .collect();
        let copy = &new[lastscan + lenf..scan - lenb];
        let seek = (pos as i64 - lenb as i64) - (lastpos as i64 + lenf as i64);
        emit_triple(add, copy, seek, emit)?;

        lastscan = scan - lenb;
        lastpos = pos - lenb;
        lastoffset = pos as i64 - scan as i64;
    }

    emit(BsdiffControl {
        eof: true,
        ..Default::default()
    })
}

/// Rebuild a file from `old` and the controls yielded by `next_control`,
/// up to and including the `eof` control. Returns the bytes written.
///
/// Diff bytes that land outside `old` are taken as-is.
pub fn apply(
    old: &[u8],
    next_control: &mut dyn FnMut() -> Result<BsdiffControl>,
    out: &mut dyn Write,
) -> Result<u64> {
    let mut old_pos = 0i64;
    let mut written = 0u64;
    let mut scratch = Vec::new();

    loop {
        let control = next_control()?;
        if control.eof {
            break;
        }

        scratch.clear();
        scratch.extend(control.add.iter().enumerate().map(|(i, diff)| {
            let at = old_pos + i as i64;
            if at >= 0 && (at as usize) < old.len() {
                diff.wrapping_add(old[at as usize])
            } else {
                *diff
            }
        }));
        out.write_all(&scratch)?;
        out.write_all(&control.copy)?;

        written += (control.add.len() + control.copy.len()) as u64;
        old_pos = old_pos
            .checked_add(control.add.len() as i64)
            .and_then(|p| p.checked_add(control.seek))
            .ok_or_else(|| Error::malformed("bsdiff seek overflows"))?;
    }

    Ok(written)
}
