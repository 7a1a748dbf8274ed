//! External sort ingestion.
//!
//! Instead of growing one accumulator per term, a field in external-sort
//! mode buffers `(term, doc, position)` tuples. Full buffers are sorted and
//! spilled to temporary run files; at flush time the runs and the buffer
//! are k-way merged so postings can be rebuilt one term at a time.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use log::debug;

use crate::error::{IrIndexError, Result};
use crate::index::{DocId, TermId};
use crate::storage::{IndexInput, IndexOutput, Storage};
use crate::util::budget::MemoryBudget;

/// One buffered occurrence.
pub type SortTuple = (TermId, DocId, u32);

const TUPLE_BYTES: u64 = std::mem::size_of::<SortTuple>() as u64;

/// Buffers tuples and spills sorted runs of `run_size` tuples.
#[derive(Debug)]
pub struct ExternalSorter {
    storage: Arc<dyn Storage>,
    prefix: String,
    run_size: usize,
    budget: MemoryBudget,
    buffer: Vec<SortTuple>,
    runs: Vec<String>,
}

impl ExternalSorter {
    /// Create a sorter whose run files are named after `prefix`.
    pub fn new(
        storage: Arc<dyn Storage>,
        prefix: impl Into<String>,
        run_size: usize,
        budget: MemoryBudget,
    ) -> Self {
        ExternalSorter {
            storage,
            prefix: prefix.into(),
            run_size: run_size.max(1),
            budget,
            buffer: Vec::new(),
            runs: Vec::new(),
        }
    }

    /// Buffer every occurrence of one document.
    ///
    /// A full buffer is spilled before the document is added, so a failure
    /// leaves the sorter without any trace of the document.
    pub fn add_document(&mut self, doc_id: DocId, terms: &[(TermId, u32)]) -> Result<()> {
        if self.buffer.len() >= self.run_size {
            self.spill()?;
        }
        self.budget.try_allocate(terms.len() as u64 * TUPLE_BYTES)?;
        self.buffer
            .extend(terms.iter().map(|&(term, position)| (term, doc_id, position)));
        Ok(())
    }

    /// Drop the buffered tuples of `doc_id`.
    pub fn rollback_document(&mut self, doc_id: DocId) {
        let before = self.buffer.len();
        self.buffer.retain(|&(_, doc, _)| doc != doc_id);
        self.budget
            .release((before - self.buffer.len()) as u64 * TUPLE_BYTES);
    }

    /// Tuples held in memory.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Number of runs spilled so far.
    pub fn run_count(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.runs.is_empty()
    }

    /// Bytes charged for the in-memory buffer.
    pub fn memory_usage(&self) -> u64 {
        self.buffer.len() as u64 * TUPLE_BYTES
    }

    fn spill(&mut self) -> Result<()> {
        self.buffer.sort_unstable();
        let (name, raw) = self.storage.create_temp_output(&self.prefix)?;
        let written = (|| -> Result<()> {
            let mut output = IndexOutput::new(raw)?;
            write_run(&self.buffer, &mut output)?;
            output.close()
        })();
        if let Err(e) = written {
            let _ = self.storage.delete_file(&name);
            return Err(e);
        }

        debug!(
            "spilled run {} with {} tuples to {name}",
            self.runs.len(),
            self.buffer.len()
        );
        self.budget.release(self.memory_usage());
        self.buffer.clear();
        self.runs.push(name);
        Ok(())
    }

    /// Merge every run with the buffer into one sorted stream.
    ///
    /// The sorter is left empty; run files are deleted when the returned
    /// stream is dropped.
    pub fn sorted(&mut self) -> Result<SortedTuples> {
        self.buffer.sort_unstable();
        let buffer = std::mem::take(&mut self.buffer);
        self.budget.release(buffer.len() as u64 * TUPLE_BYTES);
        let runs = std::mem::take(&mut self.runs);

        let mut sources = Vec::with_capacity(runs.len() + 1);
        for name in &runs {
            let mut input = IndexInput::new(self.storage.open_input(name)?)?;
            let remaining = input.read_vlong()?;
            sources.push(RunSource::File {
                input,
                remaining,
                prev_term: 0,
            });
        }
        sources.push(RunSource::Memory(buffer.into_iter()));

        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (index, source) in sources.iter_mut().enumerate() {
            if let Some(tuple) = source.next_tuple()? {
                heap.push(Reverse((tuple, index)));
            }
        }
        Ok(SortedTuples {
            storage: Arc::clone(&self.storage),
            runs,
            sources,
            heap,
        })
    }

    /// Discard everything, deleting spilled runs.
    pub fn clear(&mut self) -> Result<()> {
        self.budget.release(self.memory_usage());
        self.buffer.clear();
        for name in self.runs.drain(..) {
            self.storage.delete_file(&name)?;
        }
        Ok(())
    }
}

fn write_run(tuples: &[SortTuple], output: &mut IndexOutput) -> Result<()> {
    output.write_vlong(tuples.len() as u64)?;
    let mut prev_term = 0;
    for &(term, doc, position) in tuples {
        output.write_vint(term - prev_term)?;
        output.write_vint(doc)?;
        output.write_vint(position)?;
        prev_term = term;
    }
    Ok(())
}

#[derive(Debug)]
enum RunSource {
    File {
        input: IndexInput,
        remaining: u64,
        prev_term: TermId,
    },
    Memory(std::vec::IntoIter<SortTuple>),
}

impl RunSource {
    fn next_tuple(&mut self) -> Result<Option<SortTuple>> {
        match self {
            RunSource::Memory(iter) => Ok(iter.next()),
            RunSource::File {
                input,
                remaining,
                prev_term,
            } => {
                if *remaining == 0 {
                    return Ok(None);
                }
                let term = prev_term
                    .checked_add(input.read_vint()?)
                    .ok_or_else(|| IrIndexError::corrupt("sort run term overflows u32"))?;
                let doc = input.read_vint()?;
                let position = input.read_vint()?;
                *remaining -= 1;
                *prev_term = term;
                Ok(Some((term, doc, position)))
            }
        }
    }
}

/// The merged, sorted stream of an [`ExternalSorter`].
#[derive(Debug)]
pub struct SortedTuples {
    storage: Arc<dyn Storage>,
    runs: Vec<String>,
    sources: Vec<RunSource>,
    heap: BinaryHeap<Reverse<(SortTuple, usize)>>,
}

impl SortedTuples {
    /// The next tuple in `(term, doc, position)` order.
    pub fn next_tuple(&mut self) -> Result<Option<SortTuple>> {
        let Some(Reverse((tuple, index))) = self.heap.pop() else {
            return Ok(None);
        };
        if let Some(next) = self.sources[index].next_tuple()? {
            self.heap.push(Reverse((next, index)));
        }
        Ok(Some(tuple))
    }
}

impl Drop for SortedTuples {
    fn drop(&mut self) {
        for name in &self.runs {
            if let Err(e) = self.storage.delete_file(name) {
                log::warn!("failed to delete sort run {name}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn drain(sorted: &mut SortedTuples) -> Vec<SortTuple> {
        let mut out = Vec::new();
        while let Some(tuple) = sorted.next_tuple().unwrap() {
            out.push(tuple);
        }
        out
    }

    #[test]
    fn test_runs_merge_in_order() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let budget = MemoryBudget::unlimited();
        let mut sorter = ExternalSorter::new(Arc::clone(&storage), "_0.c0f0.run", 4, budget.clone());

        let mut expected = Vec::new();
        for doc in 0..10u32 {
            let terms: Vec<(TermId, u32)> = (0..3).map(|i| ((doc * 7 + i) % 5, i)).collect();
            expected.extend(terms.iter().map(|&(t, p)| (t, doc, p)));
            sorter.add_document(doc, &terms).unwrap();
        }
        assert!(sorter.run_count() >= 2);
        expected.sort_unstable();

        let mut sorted = sorter.sorted().unwrap();
        assert_eq!(drain(&mut sorted), expected);
        assert!(sorter.is_empty());
        assert_eq!(budget.used(), 0);

        drop(sorted);
        let leftovers: Vec<_> = storage
            .list_files()
            .unwrap()
            .into_iter()
            .filter(|name| name.starts_with("_0.c0f0.run"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn test_rollback_removes_only_newest_document() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let mut sorter = ExternalSorter::new(storage, "run", 100, MemoryBudget::unlimited());
        sorter.add_document(1, &[(3, 0), (1, 1)]).unwrap();
        sorter.add_document(2, &[(3, 0)]).unwrap();
        sorter.rollback_document(2);
        assert_eq!(sorter.buffered(), 2);

        let mut sorted = sorter.sorted().unwrap();
        assert_eq!(drain(&mut sorted), vec![(1, 1, 1), (3, 1, 0)]);
    }

    #[test]
    fn test_budget_refusal_leaves_buffer_untouched() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let budget = MemoryBudget::new(Some(TUPLE_BYTES * 3));
        let mut sorter = ExternalSorter::new(storage, "run", 100, budget);
        sorter.add_document(1, &[(1, 0), (2, 1)]).unwrap();
        let err = sorter.add_document(2, &[(1, 0), (2, 1)]).unwrap_err();
        assert!(err.is_out_of_memory());
        assert_eq!(sorter.buffered(), 2);
    }
}
