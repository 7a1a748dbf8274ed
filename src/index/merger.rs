//! Merging barrels.
//!
//! [`PostingMerger`] concatenates one term's postings from several inputs
//! into a single accumulator, either decoding them (and dropping deleted
//! documents) or splicing their encoded bytes. [`IndexMerger`] drives it
//! term by term over every field of a run of barrels.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::error::{IrIndexError, Result};
use crate::index::barrel::Barrel;
use crate::index::config::{PostingConfig, PostingFormat};
use crate::index::doc_filter::{DocFilter, DocFilters};
use crate::index::doc_length::DocLengths;
use crate::index::field_indexer::FieldOutputs;
use crate::index::posting::{InMemoryPosting, OnDiskPosting, Posting, PostingOutputs};
use crate::index::reader::{BarrelReader, FieldReader};
use crate::index::term_info::TermInfo;
use crate::index::{CollectionId, DocId, FieldKey, TermId};
use crate::storage::Storage;
use crate::util::budget::MemoryBudget;

/// Deleted documents of one input, addressed by the input's local ids.
#[derive(Debug, Clone, Copy)]
pub struct DeletedDocs<'a> {
    pub filter: &'a DocFilter,
    /// Global id of the input's local doc 0.
    pub base: DocId,
}

impl DeletedDocs<'_> {
    pub fn contains(&self, local_doc: DocId) -> bool {
        self.filter.test(local_doc + self.base)
    }
}

/// Postings and occurrences a merge step dropped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Dropped {
    pub docs: u32,
    pub occurrences: u64,
}

/// Builds one term's merged posting list.
#[derive(Debug)]
pub struct PostingMerger {
    output: InMemoryPosting,
}

impl PostingMerger {
    pub fn new(config: PostingConfig, budget: &MemoryBudget) -> Self {
        PostingMerger {
            output: InMemoryPosting::new(config, budget),
        }
    }

    /// Decode `input` chunk by chunk and append it, shifting doc ids by
    /// `doc_shift` and skipping documents in `deleted`.
    pub fn merge_with<P: Posting + ?Sized>(
        &mut self,
        input: &mut P,
        doc_shift: DocId,
        deleted: Option<DeletedDocs<'_>>,
    ) -> Result<Dropped> {
        input.reset()?;
        let mut dropped = Dropped::default();
        while let Some(chunk) = input.decode_next_chunk()? {
            for (doc_id, freq, positions) in chunk.postings() {
                if deleted.is_some_and(|d| d.contains(doc_id)) {
                    dropped.docs += 1;
                    dropped.occurrences += freq as u64;
                    continue;
                }
                let shifted = doc_id
                    .checked_add(doc_shift)
                    .ok_or_else(|| IrIndexError::merge("rebased doc id overflows u32"))?;
                self.output.add_posting(shifted, positions)?;
            }
        }
        Ok(dropped)
    }

    /// Append `input` without decoding its chunks.
    pub fn merge_fast(&mut self, input: &mut OnDiskPosting<'_>, doc_shift: DocId) -> Result<()> {
        self.output.append_on_disk(input, doc_shift)
    }

    pub fn doc_freq(&self) -> u32 {
        self.output.doc_freq()
    }

    pub fn ctf(&self) -> u64 {
        self.output.ctf()
    }

    /// Write the merged list; `None` when every posting was dropped.
    pub fn end_merge(self, outputs: &mut PostingOutputs<'_>) -> Result<Option<TermInfo>> {
        if self.output.is_empty() {
            return Ok(None);
        }
        self.output.write(outputs).map(Some)
    }
}

/// Counters of one barrel merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Names of the merged barrels.
    pub inputs: Vec<String>,

    /// Name of the barrel produced.
    pub output: String,

    /// Documents in the output barrel.
    pub doc_count: u64,

    /// Terms written over all fields.
    pub terms: u64,

    /// Term lists spliced without decoding.
    pub fast_copies: u64,

    /// Term lists decoded and re-encoded.
    pub slow_copies: u64,

    /// Deleted documents dropped.
    pub dropped_docs: u64,

    /// Bytes written.
    pub bytes: u64,

    pub elapsed_ms: u64,
}

/// Merges a run of consecutive barrels into one.
#[derive(Debug)]
pub struct IndexMerger {
    storage: Arc<dyn Storage>,
    config: PostingConfig,
    budget: MemoryBudget,
    gc: bool,
}

impl IndexMerger {
    /// `config` decides the output format; `gc` drops deleted documents.
    pub fn new(storage: Arc<dyn Storage>, config: PostingConfig, budget: MemoryBudget, gc: bool) -> Self {
        IndexMerger {
            storage,
            config,
            budget,
            gc,
        }
    }

    /// Merge `inputs`, in manifest order, into a barrel named `output_name`.
    ///
    /// The output files are written but not registered; on error they are
    /// deleted again.
    pub fn merge(
        &self,
        inputs: &[Barrel],
        output_name: &str,
        filters: &DocFilters,
    ) -> Result<(Barrel, MergeStats)> {
        if inputs.is_empty() {
            return Err(IrIndexError::merge("nothing to merge"));
        }
        let started = Instant::now();
        let mut output = output_barrel(inputs, output_name, self.config.format);
        let result = self.merge_into(inputs, &mut output, filters);
        match result {
            Ok(mut stats) => {
                stats.elapsed_ms = started.elapsed().as_millis() as u64;
                info!(
                    "merged {:?} into {} ({} docs, {} dropped, {} fast / {} slow term copies)",
                    stats.inputs,
                    stats.output,
                    stats.doc_count,
                    stats.dropped_docs,
                    stats.fast_copies,
                    stats.slow_copies
                );
                Ok((output, stats))
            }
            Err(e) => {
                let _ = output.remove_files(self.storage.as_ref());
                Err(e)
            }
        }
    }

    fn merge_into(
        &self,
        inputs: &[Barrel],
        output: &mut Barrel,
        filters: &DocFilters,
    ) -> Result<MergeStats> {
        let mut readers = inputs
            .iter()
            .map(|barrel| BarrelReader::open(self.storage.as_ref(), barrel))
            .collect::<Result<Vec<_>>>()?;

        let mut stats = MergeStats {
            inputs: inputs.iter().map(|b| b.name.clone()).collect(),
            output: output.name.clone(),
            ..MergeStats::default()
        };
        let mut dropped_docs: BTreeSet<(CollectionId, DocId)> = BTreeSet::new();

        let fields = output.fields.clone();
        for key in fields {
            let mut outputs = FieldOutputs::create(self.storage.as_ref(), &output.name, key)?;
            self.merge_field(
                key,
                &mut readers,
                output,
                filters,
                &mut outputs,
                &mut stats,
            )?;

            let lengths = self.merge_lengths(key, &readers, output, filters, &mut dropped_docs)?;
            lengths.write(&mut outputs.lengths)?;
            stats.bytes += outputs.bytes_written();
            outputs.close()?;
        }

        // Every document has a length record in some field, so the records
        // name exactly the documents this merge dropped.
        let indexed: u64 = inputs.iter().map(|b| b.doc_count).sum();
        let dropped = dropped_docs.len() as u64;
        output.doc_count = indexed.saturating_sub(dropped);
        stats.dropped_docs = dropped;
        stats.doc_count = output.doc_count;
        Ok(stats)
    }

    fn deleted_docs<'a>(
        &self,
        filters: &'a DocFilters,
        barrel: &Barrel,
        collection: CollectionId,
    ) -> Option<DeletedDocs<'a>> {
        if !self.gc {
            return None;
        }
        let filter = filters.get(collection)?;
        let base = barrel.base_doc_id(collection)?;
        let max = barrel.max_doc_id(collection)?;
        filter.any_in(base, max).then_some(DeletedDocs {
            filter: filter.as_ref(),
            base,
        })
    }

    fn merge_field(
        &self,
        key: FieldKey,
        readers: &mut [BarrelReader],
        output: &Barrel,
        filters: &DocFilters,
        outputs: &mut FieldOutputs,
        stats: &mut MergeStats,
    ) -> Result<()> {
        // Inputs holding the field, with their doc shift and deletions.
        let mut sources = Vec::new();
        for (index, reader) in readers.iter().enumerate() {
            if reader.field(key).is_none() {
                continue;
            }
            let barrel = reader.barrel();
            let (Some(base), Some(out_base)) = (
                barrel.base_doc_id(key.collection),
                output.base_doc_id(key.collection),
            ) else {
                continue;
            };
            let deleted = self.deleted_docs(filters, barrel, key.collection);
            let fast = deleted.is_none() && barrel.posting_format == self.config.format;
            sources.push((index, base - out_base, deleted, fast));
        }

        // K-way merge of the vocabularies, keyed by term id.
        let mut cursors = vec![0usize; sources.len()];
        let mut heap = BinaryHeap::new();
        for (slot, &(index, ..)) in sources.iter().enumerate() {
            if let Some((term, _)) = vocabulary_entry(&readers[index], key, 0) {
                heap.push(Reverse((term, slot)));
            }
        }

        let (mut vocabulary, mut postings) = outputs.split();
        while let Some(Reverse((term, _))) = heap.peek().copied() {
            let mut group = Vec::new();
            while let Some(&Reverse((t, slot))) = heap.peek() {
                if t != term {
                    break;
                }
                heap.pop();
                group.push(slot);
            }
            group.sort_unstable();

            let mut merger = PostingMerger::new(self.config, &self.budget);
            for &slot in &group {
                let (index, shift, deleted, fast) = sources[slot];
                let field = field_mut(&mut readers[index], key)?;
                let Some((_, info)) = field.vocabulary().entry(cursors[slot]) else {
                    continue;
                };
                let mut input = field.on_disk(info);
                if fast {
                    merger.merge_fast(&mut input, shift)?;
                    stats.fast_copies += 1;
                } else {
                    merger.merge_with(&mut input, shift, deleted)?;
                    stats.slow_copies += 1;
                }

                cursors[slot] += 1;
                if let Some((next, _)) = vocabulary_entry(&readers[index], key, cursors[slot]) {
                    heap.push(Reverse((next, slot)));
                }
            }
            if let Some(info) = merger.end_merge(&mut postings)? {
                vocabulary.add(term, &info)?;
            }
        }
        let terms = vocabulary.finish()?;
        stats.terms += terms;
        debug!("merged field {key:?} of {}: {terms} terms", output.name);
        Ok(())
    }

    fn merge_lengths(
        &self,
        key: FieldKey,
        readers: &[BarrelReader],
        output: &Barrel,
        filters: &DocFilters,
        dropped: &mut BTreeSet<(CollectionId, DocId)>,
    ) -> Result<DocLengths> {
        let mut merged = DocLengths::new();
        let Some(out_base) = output.base_doc_id(key.collection) else {
            return Ok(merged);
        };
        for reader in readers {
            let barrel = reader.barrel();
            let (Some(field), Some(base)) = (reader.field(key), barrel.base_doc_id(key.collection))
            else {
                continue;
            };
            let deleted = self.deleted_docs(filters, barrel, key.collection);
            merged.append_shifted(field.lengths(), base - out_base, |local| {
                let gone = deleted.is_some_and(|d| d.contains(local));
                if gone {
                    dropped.insert((key.collection, local + base));
                }
                !gone
            })?;
        }
        Ok(merged)
    }
}

fn vocabulary_entry(reader: &BarrelReader, key: FieldKey, index: usize) -> Option<(TermId, TermInfo)> {
    reader
        .field(key)?
        .vocabulary()
        .entry(index)
}

fn field_mut(reader: &mut BarrelReader, key: FieldKey) -> Result<&mut FieldReader> {
    let name = reader.barrel().name.clone();
    reader
        .field_mut(key)
        .ok_or_else(|| IrIndexError::merge(format!("barrel {name} lost field {key:?}")))
}

/// The metadata of the barrel that replaces `inputs`.
fn output_barrel(inputs: &[Barrel], name: &str, format: PostingFormat) -> Barrel {
    let mut output = Barrel::new(name, format);
    let mut fields = BTreeSet::new();
    let mut bases: BTreeMap<CollectionId, DocId> = BTreeMap::new();
    for barrel in inputs {
        fields.extend(barrel.fields.iter().copied());
        for (&collection, &base) in &barrel.base_doc_ids {
            let entry = bases.entry(collection).or_insert(base);
            *entry = (*entry).min(base);
        }
        for (&collection, &max) in &barrel.max_doc_ids {
            let entry = output.max_doc_ids.entry(collection).or_insert(max);
            *entry = (*entry).max(max);
        }
    }
    output.base_doc_ids = bases;
    output.fields = fields.into_iter().collect();
    output.searchable = true;
    output
}
