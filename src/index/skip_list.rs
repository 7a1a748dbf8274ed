//! Multi-level skip lists over posting streams.
//!
//! Every level-0 entry is a [`SkipPoint`] recorded at a chunk (or block)
//! boundary: the last doc id before the boundary plus the doc and position
//! stream offsets where decoding can resume. Every `skip_interval`-th entry
//! of level L is promoted to level L+1 and remembers its index one level
//! down, so a reader walks from the top level downwards and reaches the
//! greatest point `<= target` in logarithmic steps.
//!
//! Serialized form: `vint levels`, then for each level from the top down
//! `vint count` followed by delta-encoded `doc_id`, `doc_offset`,
//! `pos_offset`, `postings` and, above level 0, `child`.

use crate::error::{IrIndexError, Result};
use crate::index::DocId;
use crate::storage::{IndexInput, IndexOutput};
use crate::util::varint::{decode_u32_at, decode_u64_at, encode_u32_into, encode_u64_into};

/// A resumable position inside a term's posting streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipPoint {
    /// Last doc id before the boundary.
    pub doc_id: DocId,
    /// Offset of the boundary in the doc stream, relative to the term start.
    pub doc_offset: u64,
    /// Offset of the boundary in the position stream, relative to the term start.
    pub pos_offset: u64,
    /// Postings stored before the boundary.
    pub postings: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SkipEntry {
    point: SkipPoint,
    /// Index of the same point one level down; unused on level 0.
    child: u32,
}

/// Accumulates skip points in increasing doc id order.
#[derive(Debug, Clone)]
pub struct SkipListWriter {
    skip_interval: u32,
    max_levels: usize,
    levels: Vec<Vec<SkipEntry>>,
}

impl SkipListWriter {
    pub fn new(skip_interval: u32, max_levels: u32) -> Self {
        SkipListWriter {
            skip_interval: skip_interval.max(2),
            max_levels: max_levels.max(1) as usize,
            levels: Vec::new(),
        }
    }

    /// Record a new level-0 point, promoting it upwards where due.
    pub fn add_skip_point(&mut self, point: SkipPoint) -> Result<()> {
        if let Some(last) = self.last_point() {
            if point.doc_id <= last.doc_id
                || point.doc_offset < last.doc_offset
                || point.pos_offset < last.pos_offset
            {
                return Err(IrIndexError::invalid_argument(format!(
                    "skip point for doc {} does not follow doc {}",
                    point.doc_id, last.doc_id
                )));
            }
        }

        if self.levels.is_empty() {
            self.levels.push(Vec::new());
        }
        self.levels[0].push(SkipEntry { point, child: 0 });

        let count = self.levels[0].len() as u64;
        let mut stride = self.skip_interval as u64;
        for level in 1..self.max_levels {
            if count % stride != 0 {
                break;
            }
            if self.levels.len() == level {
                self.levels.push(Vec::new());
            }
            let child = (self.levels[level - 1].len() - 1) as u32;
            self.levels[level].push(SkipEntry { point, child });
            stride = match stride.checked_mul(self.skip_interval as u64) {
                Some(next) => next,
                None => break,
            };
        }
        Ok(())
    }

    /// Number of populated levels; 0 when no point was recorded.
    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Number of level-0 points.
    pub fn len(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_point(&self) -> Option<SkipPoint> {
        self.levels
            .first()
            .and_then(|level| level.last())
            .map(|entry| entry.point)
    }

    /// Level-0 points in order.
    pub fn points(&self) -> impl Iterator<Item = SkipPoint> + '_ {
        self.levels
            .first()
            .into_iter()
            .flat_map(|level| level.iter().map(|entry| entry.point))
    }

    pub fn reset(&mut self) {
        self.levels.clear();
    }

    /// Serialize every level into `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        encode_u32_into(self.levels.len() as u32, out);
        for (level, entries) in self.levels.iter().enumerate().rev() {
            encode_u32_into(entries.len() as u32, out);
            let mut prev = SkipEntry {
                point: SkipPoint::default(),
                child: 0,
            };
            for entry in entries {
                encode_u32_into(entry.point.doc_id - prev.point.doc_id, out);
                encode_u64_into(entry.point.doc_offset - prev.point.doc_offset, out);
                encode_u64_into(entry.point.pos_offset - prev.point.pos_offset, out);
                encode_u32_into(entry.point.postings - prev.point.postings, out);
                if level > 0 {
                    encode_u32_into(entry.child - prev.child, out);
                }
                prev = *entry;
            }
        }
    }

    /// Serialize into `output`, returning the number of bytes written.
    pub fn write_to(&self, output: &mut IndexOutput) -> Result<u64> {
        let mut bytes = Vec::new();
        self.encode(&mut bytes);
        output.write_bytes(&bytes)?;
        Ok(bytes.len() as u64)
    }
}

/// Navigates a decoded skip list with a monotonic cursor.
#[derive(Debug, Clone, Default)]
pub struct SkipListReader {
    levels: Vec<Vec<SkipEntry>>,
    cursor: Vec<Option<usize>>,
}

impl SkipListReader {
    /// Decode a skip list from a byte slice.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut pos = 0;
        let reader = Self::decode_at(bytes, &mut pos)?;
        if pos != bytes.len() {
            return Err(IrIndexError::corrupt(format!(
                "{} trailing bytes after skip list",
                bytes.len() - pos
            )));
        }
        Ok(reader)
    }

    /// Read `len` bytes of skip list from the current position of `input`.
    pub fn read(input: &mut IndexInput, len: u64) -> Result<Self> {
        let bytes = input.read_bytes(len as usize)?;
        Self::decode(&bytes)
    }

    fn decode_at(bytes: &[u8], pos: &mut usize) -> Result<Self> {
        let num_levels = decode_u32_at(bytes, pos)? as usize;
        if num_levels > 64 {
            return Err(IrIndexError::corrupt(format!("{num_levels} skip levels")));
        }
        let mut levels: Vec<Vec<SkipEntry>> = vec![Vec::new(); num_levels];
        for level in (0..num_levels).rev() {
            let count = decode_u32_at(bytes, pos)? as usize;
            if count > bytes.len() {
                return Err(IrIndexError::corrupt("skip level longer than its input"));
            }
            let mut entries = Vec::with_capacity(count);
            let mut prev = SkipEntry {
                point: SkipPoint::default(),
                child: 0,
            };
            for i in 0..count {
                let doc_delta = decode_u32_at(bytes, pos)?;
                if i > 0 && doc_delta == 0 {
                    return Err(IrIndexError::corrupt("skip doc ids not increasing"));
                }
                let entry = SkipEntry {
                    point: SkipPoint {
                        doc_id: checked(prev.point.doc_id.checked_add(doc_delta))?,
                        doc_offset: checked(
                            prev.point.doc_offset.checked_add(decode_u64_at(bytes, pos)?),
                        )?,
                        pos_offset: checked(
                            prev.point.pos_offset.checked_add(decode_u64_at(bytes, pos)?),
                        )?,
                        postings: checked(
                            prev.point.postings.checked_add(decode_u32_at(bytes, pos)?),
                        )?,
                    },
                    child: if level > 0 {
                        checked(prev.child.checked_add(decode_u32_at(bytes, pos)?))?
                    } else {
                        0
                    },
                };
                entries.push(entry);
                prev = entry;
            }
            levels[level] = entries;
        }

        for level in 1..num_levels {
            let (lower, upper) = levels.split_at(level);
            let below = &lower[level - 1];
            for entry in &upper[0] {
                match below.get(entry.child as usize) {
                    Some(child) if child.point == entry.point => {}
                    _ => return Err(IrIndexError::corrupt("skip child pointer mismatch")),
                }
            }
        }

        Ok(SkipListReader {
            cursor: vec![None; levels.len()],
            levels,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Number of level-0 points.
    pub fn len(&self) -> usize {
        self.levels.first().map(Vec::len).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Level-0 points in order.
    pub fn points(&self) -> impl Iterator<Item = SkipPoint> + '_ {
        self.levels
            .first()
            .into_iter()
            .flat_map(|level| level.iter().map(|entry| entry.point))
    }

    /// The point the cursor rests on.
    pub fn current(&self) -> Option<SkipPoint> {
        let index = (*self.cursor.first()?)?;
        Some(self.levels[0][index].point)
    }

    /// Advance to the greatest point whose doc id is `<= target`.
    ///
    /// The cursor never moves backwards: a target below an earlier one
    /// returns the point reached before.
    pub fn skip_to(&mut self, target: DocId) -> Option<SkipPoint> {
        let mut floor: Option<usize> = None;
        for level in (0..self.levels.len()).rev() {
            let entries = &self.levels[level];
            let mut index = self.cursor[level];
            if let Some(child) = floor {
                if index.is_none_or(|i| i < child) {
                    index = Some(child);
                }
            }
            loop {
                let next = index.map_or(0, |i| i + 1);
                match entries.get(next) {
                    Some(entry) if entry.point.doc_id <= target => index = Some(next),
                    _ => break,
                }
            }
            self.cursor[level] = index;
            floor = index.map(|i| entries[i].child as usize);
        }
        self.current()
    }

    /// Move the cursor back to the start.
    pub fn reset(&mut self) {
        self.cursor.iter_mut().for_each(|c| *c = None);
    }
}

fn checked<T>(value: Option<T>) -> Result<T> {
    value.ok_or_else(|| IrIndexError::corrupt("skip list value overflow"))
}

/// How the points of one merge input move in the merged stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SkipRebase {
    /// Added to every doc id.
    pub doc_id: DocId,
    /// Added to every doc offset; negative when the input's first chunk shrank.
    pub doc_offset: i64,
    /// Added to every position offset.
    pub pos_offset: u64,
    /// Added to every postings count.
    pub postings: u32,
}

impl SkipRebase {
    pub fn apply(&self, point: SkipPoint) -> Result<SkipPoint> {
        Ok(SkipPoint {
            doc_id: checked(point.doc_id.checked_add(self.doc_id))?,
            doc_offset: checked(point.doc_offset.checked_add_signed(self.doc_offset))?,
            pos_offset: checked(point.pos_offset.checked_add(self.pos_offset))?,
            postings: checked(point.postings.checked_add(self.postings))?,
        })
    }
}

/// Concatenates the skip lists of several posting lists into one writer.
#[derive(Debug)]
pub struct SkipListMerger<'a> {
    writer: &'a mut SkipListWriter,
}

impl<'a> SkipListMerger<'a> {
    pub fn new(writer: &'a mut SkipListWriter) -> Self {
        SkipListMerger { writer }
    }

    /// Add a point at a boundary created by the merge itself.
    ///
    /// Returns false when the last recorded point already sits at or past
    /// `point.doc_id`.
    pub fn add_boundary(&mut self, point: SkipPoint) -> Result<bool> {
        if let Some(last) = self.writer.last_point() {
            if last.doc_id >= point.doc_id {
                return Ok(false);
            }
        }
        self.writer.add_skip_point(point)?;
        Ok(true)
    }

    /// Append one input's level-0 points, moved by `rebase`.
    pub fn merge_points<I>(&mut self, points: I, rebase: SkipRebase) -> Result<()>
    where
        I: IntoIterator<Item = SkipPoint>,
    {
        for point in points {
            self.writer.add_skip_point(rebase.apply(point)?)?;
        }
        Ok(())
    }
}
