#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use irindex::document::Document;
    use irindex::index::config::{IndexConfig, MergePolicyConfig, PostingFormat};
    use irindex::index::writer::IndexWriter;
    use irindex::index::{DocId, TermKey};
    use irindex::storage::file::FileStorageConfig;
    use irindex::storage::memory::MemoryStorageConfig;
    use irindex::storage::{Storage, StorageConfig, StorageFactory};
    use tempfile::TempDir;

    const X: TermKey = TermKey {
        collection: 0,
        field: 0,
        term: 42,
    };

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    fn memory_storage() -> Arc<dyn Storage> {
        StorageFactory::create(StorageConfig::Memory(MemoryStorageConfig::default())).unwrap()
    }

    fn index_x(writer: &mut IndexWriter, docs: impl Iterator<Item = DocId>) {
        for doc_id in docs {
            let doc = Document::builder(0, doc_id).add_field(0, vec![(42, 0)]).build();
            writer.index_document(&doc).unwrap();
        }
    }

    fn check_scenario(storage: Arc<dyn Storage>, format: PostingFormat) {
        let config = IndexConfig {
            posting_format: format,
            merge_policy: MergePolicyConfig::NoMerge,
            ..IndexConfig::default()
        };
        let mut writer = IndexWriter::open(storage, config).unwrap();
        index_x(&mut writer, 1..=1000);
        let flushed = writer.commit().unwrap().unwrap();
        assert_eq!(flushed.doc_count, 1000);
        assert_eq!(flushed.postings, 1000);

        let reader = writer.reader().unwrap();
        assert_eq!(reader.doc_freq(X), 1000);
        let mut positions = reader.term_positions(X).unwrap().unwrap();
        for expected in 1..=1000 {
            assert!(positions.next().unwrap());
            assert_eq!(positions.doc(), Some(expected));
            assert_eq!(positions.freq(), 1);
            assert_eq!(positions.next_position().unwrap(), Some(0));
            assert_eq!(positions.next_position().unwrap(), None);
        }
        assert!(!positions.next().unwrap());

        // skip_to lands on 500 through the skip list.
        let barrel = &reader.barrels()[0];
        let mut positions = barrel.term_positions(X).unwrap().unwrap();
        assert!(positions.skip_to(500).unwrap());
        assert_eq!(positions.doc(), Some(500));
        // Block lists only carry skip points between blocks.
        let expected_chunks = match format {
            PostingFormat::Chunk => 1,
            PostingFormat::Block => 4,
        };
        assert_eq!(positions.chunks_decoded(), expected_chunks);
        assert!(positions.next().unwrap());
        assert_eq!(positions.doc(), Some(501));
        assert!(positions.skip_to(1000).unwrap());
        assert!(!positions.skip_to(1001).unwrap());

        let info = barrel.term_info(X).unwrap();
        assert_eq!(info.doc_freq, 1000);
        assert_eq!(info.ctf, 1000);
        assert_eq!(info.last_doc_id, 999);
        writer.close().unwrap();
    }

    #[test]
    fn test_thousand_documents_chunk_format() {
        init_logger();
        check_scenario(memory_storage(), PostingFormat::Chunk);
    }

    #[test]
    fn test_thousand_documents_block_format() {
        init_logger();
        check_scenario(memory_storage(), PostingFormat::Block);
    }

    #[test]
    fn test_thousand_documents_on_disk() {
        init_logger();
        let dir = TempDir::new().unwrap();
        let storage =
            StorageFactory::create(StorageConfig::File(FileStorageConfig::new(dir.path()))).unwrap();
        check_scenario(storage, PostingFormat::Chunk);
        assert!(dir.path().join("barrels.json").exists());
        assert!(dir.path().join("_0.c0f0.dfp").exists());
    }

    #[test]
    fn test_positions_and_lengths_across_fields() {
        init_logger();
        let mut writer = IndexWriter::open(memory_storage(), IndexConfig::default()).unwrap();
        for doc_id in 0..300 {
            let doc = Document::builder(0, doc_id)
                .add_tokens(0, [1, 2, 1, 3, 1])
                .add_tokens(1, (0..doc_id % 4).map(|_| 9))
                .build();
            writer.index_document(&doc).unwrap();
        }
        writer.commit().unwrap();

        let reader = writer.reader().unwrap();
        let mut positions = reader.term_positions(TermKey::new(0, 0, 1)).unwrap().unwrap();
        assert!(positions.skip_to(257).unwrap());
        assert_eq!(positions.freq(), 3);
        assert_eq!(positions.positions().unwrap(), vec![0, 2, 4]);
        assert_eq!(reader.doc_length(0, 0, 257), Some(5));
        assert_eq!(reader.doc_length(0, 1, 257), Some(1));
        assert_eq!(reader.doc_freq(TermKey::new(0, 1, 9)), 225);

        let mut positions = reader.term_positions(TermKey::new(0, 1, 9)).unwrap().unwrap();
        assert!(positions.skip_to(8).unwrap());
        assert_eq!(positions.doc(), Some(9));
        assert!(reader.term_positions(TermKey::new(0, 1, 1)).unwrap().is_none());
    }
}
