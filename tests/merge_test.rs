#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use irindex::document::Document;
    use irindex::index::config::{IndexConfig, MergePolicyConfig, PostingFormat};
    use irindex::index::reader::IndexReader;
    use irindex::index::writer::IndexWriter;
    use irindex::index::{DocId, TermId, TermKey};
    use irindex::storage::Storage;
    use irindex::storage::memory::MemoryStorage;

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn config() -> IndexConfig {
        IndexConfig {
            chunk_capacity: 8,
            skip_interval: 4,
            merge_policy: MergePolicyConfig::NoMerge,
            ..IndexConfig::default()
        }
    }

    /// Doc `d` holds term `d % 5` and term 100 at positions `0` and `d % 3 + 1`.
    fn doc(doc_id: DocId) -> Document {
        Document::builder(0, doc_id)
            .add_field(0, vec![(doc_id % 5, 0), (100, 0), (100, doc_id % 3 + 1)])
            .build()
    }

    fn collect(reader: &IndexReader, term: TermId) -> Vec<(DocId, Vec<u32>)> {
        let mut out = Vec::new();
        if let Some(mut positions) = reader.term_positions(TermKey::new(0, 0, term)).unwrap() {
            while positions.next().unwrap() {
                let doc = positions.doc().unwrap();
                out.push((doc, positions.positions().unwrap()));
            }
        }
        out
    }

    #[test]
    fn test_disjoint_barrels_merge_to_concatenation() {
        init_logger();
        for format in [PostingFormat::Chunk, PostingFormat::Block] {
            let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
            let config = IndexConfig {
                posting_format: format,
                ..config()
            };
            let mut writer = IndexWriter::open(Arc::clone(&storage), config).unwrap();
            for id in 0..97 {
                writer.index_document(&doc(id)).unwrap();
            }
            writer.flush().unwrap();
            for id in 150..333 {
                writer.index_document(&doc(id)).unwrap();
            }
            writer.flush().unwrap();

            let before = writer.reader().unwrap();
            let expected = collect(&before, 100);
            let df_before = before.doc_freq(TermKey::new(0, 0, 100));
            assert_eq!(before.barrel_count(), 2);

            writer.optimize().unwrap();
            let after = writer.reader().unwrap();
            assert_eq!(after.barrel_count(), 1);
            assert_eq!(collect(&after, 100), expected, "{format:?}");
            assert_eq!(after.doc_freq(TermKey::new(0, 0, 100)), df_before);
            for term in 0..5 {
                assert_eq!(collect(&after, term), collect(&before, term));
            }

            let barrel = &after.barrels()[0];
            let info = barrel.term_info(TermKey::new(0, 0, 100)).unwrap();
            assert_eq!(info.doc_freq, 97 + 183);
            assert_eq!(info.ctf, 2 * (97 + 183));
            assert_eq!(info.last_doc_id, 332);

            let mut positions = barrel.term_positions(TermKey::new(0, 0, 100)).unwrap().unwrap();
            for target in [5, 96, 97, 150, 200, 332] {
                assert!(positions.skip_to(target).unwrap());
                let expected_doc = if (97..150).contains(&target) { 150 } else { target };
                assert_eq!(positions.doc(), Some(expected_doc));
            }
            assert!(!positions.skip_to(333).unwrap());
        }
    }

    #[test]
    fn test_gc_merge_drops_deleted_postings() {
        init_logger();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let mut writer = IndexWriter::open(Arc::clone(&storage), config()).unwrap();
        for id in 0..60 {
            writer.index_document(&doc(id)).unwrap();
            if id % 20 == 19 {
                writer.flush().unwrap();
            }
        }
        let deleted = [0, 7, 19, 20, 33, 59];
        for id in deleted {
            assert!(writer.remove_document(0, id).unwrap());
        }
        writer.commit().unwrap();

        // Before merging, readers hide deleted documents but df still counts them.
        let reader = writer.reader().unwrap();
        assert_eq!(reader.doc_freq(TermKey::new(0, 0, 100)), 60);
        assert_eq!(collect(&reader, 100).len(), 54);

        writer.optimize().unwrap();
        let reader = writer.reader().unwrap();
        let live: Vec<DocId> = (0..60).filter(|id| !deleted.contains(id)).collect();
        let docs: Vec<DocId> = collect(&reader, 100).into_iter().map(|(d, _)| d).collect();
        assert_eq!(docs, live);
        assert_eq!(reader.doc_freq(TermKey::new(0, 0, 100)), 54);
        assert_eq!(reader.max_doc_count(), 54);

        let barrel = &reader.barrels()[0];
        let info = barrel.term_info(TermKey::new(0, 0, 100)).unwrap();
        assert_eq!(info.ctf, 108);
        assert_eq!(barrel.term_info(TermKey::new(0, 0, 0)).unwrap().doc_freq, 10);
        assert_eq!(reader.doc_length(0, 0, 7), None);
        assert_eq!(reader.doc_length(0, 0, 8), Some(3));

        // Deleted docs stay deleted after a reopen.
        writer.close().unwrap();
        let reader = IndexReader::open(storage.as_ref()).unwrap();
        assert!(reader.is_deleted(0, 33));
        assert!(!reader.is_deleted(0, 34));
    }

    #[test]
    fn test_merge_without_gc_keeps_deleted_postings() {
        init_logger();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let config = IndexConfig {
            gc_on_merge: false,
            ..config()
        };
        let mut writer = IndexWriter::open(storage, config).unwrap();
        for id in 0..10 {
            writer.index_document(&doc(id)).unwrap();
            writer.flush().unwrap();
        }
        writer.remove_document(0, 4).unwrap();
        writer.optimize().unwrap();

        let reader = writer.reader().unwrap();
        assert_eq!(reader.barrel_count(), 1);
        assert_eq!(reader.doc_freq(TermKey::new(0, 0, 100)), 10);
        assert_eq!(collect(&reader, 100).len(), 9);
    }

    #[test]
    fn test_level_policy_keeps_barrel_count_logarithmic() {
        init_logger();
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let config = IndexConfig {
            merge_policy: MergePolicyConfig::Level { collision_factor: 3 },
            max_docs_per_barrel: 1,
            ..config()
        };
        let mut writer = IndexWriter::open(storage, config).unwrap();
        for id in 0..27 {
            writer.index_document(&doc(id)).unwrap();
        }
        // 27 single-document barrels collapse level by level into one.
        let barrels = writer.barrels();
        assert_eq!(barrels.len(), 1);
        assert_eq!(barrels[0].doc_count, 27);
        assert_eq!(writer.stats().merges, 9 + 3 + 1);

        let reader = writer.reader().unwrap();
        let docs: Vec<DocId> = collect(&reader, 100).into_iter().map(|(d, _)| d).collect();
        assert_eq!(docs, (0..27).collect::<Vec<_>>());
    }

    #[test]
    fn test_background_merges_match_foreground() {
        init_logger();
        let mut results = Vec::new();
        for background in [false, true] {
            let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
            let config = IndexConfig {
                merge_policy: MergePolicyConfig::Level { collision_factor: 2 },
                background_merge: background,
                max_docs_per_barrel: 16,
                ..config()
            };
            let mut writer = IndexWriter::open(storage, config).unwrap();
            for id in 0..200 {
                writer.index_document(&doc(id)).unwrap();
            }
            writer.remove_document(0, 42).unwrap();
            writer.commit().unwrap();
            writer.wait_for_merges().unwrap();
            writer.optimize().unwrap();
            writer.wait_for_merges().unwrap();
            assert!(writer.last_merge_error().is_none());

            let reader = writer.reader().unwrap();
            assert_eq!(reader.barrel_count(), 1);
            results.push((collect(&reader, 100), collect(&reader, 3)));
            writer.close().unwrap();
        }
        assert_eq!(results[0], results[1]);
        assert_eq!(results[0].0.len(), 199);
    }
}
