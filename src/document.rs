//! Documents as the indexing core sees them.
//!
//! Text analysis happens upstream: a document arrives already reduced to
//! `(term id, position)` pairs per field, tagged with its collection and a
//! caller-assigned doc id.

use serde::{Deserialize, Serialize};

use crate::index::{CollectionId, DocId, FieldId, TermId};

/// One document ready for [`crate::index::writer::IndexWriter::index_document`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub collection: CollectionId,

    /// Must be larger than every doc id already indexed in `collection`.
    pub doc_id: DocId,

    /// Indexed fields, each with its `(term, position)` pairs.
    pub fields: Vec<DocumentField>,
}

/// The analyzed content of one field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentField {
    pub field: FieldId,
    pub terms: Vec<(TermId, u32)>,
}

impl Document {
    pub fn new(collection: CollectionId, doc_id: DocId) -> Self {
        Document {
            collection,
            doc_id,
            fields: Vec::new(),
        }
    }

    /// Start a builder for a document of `collection`.
    pub fn builder(collection: CollectionId, doc_id: DocId) -> DocumentBuilder {
        DocumentBuilder {
            document: Document::new(collection, doc_id),
        }
    }

    /// Add a field; positions of one term must be increasing.
    pub fn add_field(&mut self, field: FieldId, terms: Vec<(TermId, u32)>) {
        self.fields.push(DocumentField { field, terms });
    }

    pub fn get_field(&self, field: FieldId) -> Option<&DocumentField> {
        self.fields.iter().find(|f| f.field == field)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Builder for [`Document`].
#[derive(Debug)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Add a field from explicit `(term, position)` pairs.
    pub fn add_field(mut self, field: FieldId, terms: Vec<(TermId, u32)>) -> Self {
        self.document.add_field(field, terms);
        self
    }

    /// Add a field from a term sequence; each term's position is its index.
    pub fn add_tokens<I>(mut self, field: FieldId, tokens: I) -> Self
    where
        I: IntoIterator<Item = TermId>,
    {
        let terms = tokens
            .into_iter()
            .zip(0u32..)
            .collect();
        self.document.add_field(field, terms);
        self
    }

    pub fn build(self) -> Document {
        self.document
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let doc = Document::builder(2, 17)
            .add_tokens(0, [5, 9, 5])
            .add_field(1, vec![(3, 4)])
            .build();
        assert_eq!(doc.collection, 2);
        assert_eq!(doc.doc_id, 17);
        assert_eq!(doc.len(), 2);
        assert_eq!(
            doc.get_field(0).map(|f| f.terms.clone()),
            Some(vec![(5, 0), (9, 1), (5, 2)])
        );
        assert!(doc.get_field(7).is_none());
    }

    #[test]
    fn test_serde() {
        let doc = Document::builder(0, 1).add_tokens(0, [1, 2]).build();
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(doc, back);
    }
}
