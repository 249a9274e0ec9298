//! Documents and delete terms.
//!
//! Documents are schema-less collections of field values. The write path
//! only needs three things from them: a RAM estimate for flush accounting,
//! a serialised form for the stored-fields codec, and term matching so
//! that delete-by-term can find the documents it targets.
//!
//! # Examples
//!
//! ```
//! use sluice::document::{Document, Term};
//!
//! let doc = Document::builder()
//!     .add_text("title", "Rust Programming Guide")
//!     .add_integer("year", 2024)
//!     .build();
//!
//! assert!(doc.matches(&Term::new("title", "rust")));
//! assert!(doc.matches(&Term::new("year", "2024")));
//! assert!(!doc.matches(&Term::new("title", "java")));
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use unicode_segmentation::UnicodeSegmentation;

/// Per-field overhead added to the RAM estimate of a buffered document.
const FIELD_OVERHEAD_BYTES: usize = 48;

/// Per-document overhead added to the RAM estimate of a buffered document.
const DOC_OVERHEAD_BYTES: usize = 64;

/// A single field value.
///
/// Text is found under each of its lowercased words; scalars under their
/// lowercased display form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    /// Opaque bytes, never matched.
    Binary(Vec<u8>),
}

impl FieldValue {
    fn ram_bytes_used(&self) -> usize {
        match self {
            FieldValue::Text(text) => text.len(),
            FieldValue::Binary(bytes) => bytes.len(),
            FieldValue::Integer(_) | FieldValue::Float(_) | FieldValue::Boolean(_) => 8,
        }
    }

    /// Normalised terms this value is found under.
    fn index_terms(&self) -> Vec<String> {
        match self {
            FieldValue::Text(value) => value
                .unicode_words()
                .map(|word| word.to_lowercase())
                .collect(),
            FieldValue::Integer(value) => vec![value.to_string()],
            FieldValue::Float(value) => vec![value.to_string().to_lowercase()],
            FieldValue::Boolean(value) => vec![value.to_string()],
            FieldValue::Binary(_) => Vec::new(),
        }
    }
}

/// A document represents a single item to be indexed.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: BTreeMap<String, FieldValue>,
}

impl Document {
    /// Create a new empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for constructing documents.
    pub fn builder() -> DocumentBuilder {
        DocumentBuilder::default()
    }

    /// Add (or replace) a field value.
    pub fn add_field<S: Into<String>>(&mut self, name: S, value: FieldValue) {
        self.fields.insert(name.into(), value);
    }

    /// Get a field value.
    pub fn get_field(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Get the number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in name order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Estimated heap bytes used while the document is buffered.
    pub fn ram_bytes_used(&self) -> usize {
        DOC_OVERHEAD_BYTES
            + self
                .fields
                .iter()
                .map(|(name, value)| FIELD_OVERHEAD_BYTES + name.len() + value.ram_bytes_used())
                .sum::<usize>()
    }

    /// Every `(field, normalised text)` pair the document can be found under.
    pub fn index_terms(&self) -> impl Iterator<Item = (&str, String)> {
        self.fields.iter().flat_map(|(name, value)| {
            value
                .index_terms()
                .into_iter()
                .map(move |text| (name.as_str(), text))
        })
    }

    /// Returns true if the term's field holds the term's text.
    pub fn matches(&self, term: &Term) -> bool {
        let text = term.normalized_text();
        self.fields
            .get(&term.field)
            .is_some_and(|value| value.index_terms().contains(&text))
    }
}

/// A builder for constructing documents in a fluent manner.
#[derive(Debug, Default)]
pub struct DocumentBuilder {
    document: Document,
}

impl DocumentBuilder {
    /// Add a text field.
    pub fn add_text<S: Into<String>, T: Into<String>>(mut self, name: S, value: T) -> Self {
        self.document.add_field(name, FieldValue::Text(value.into()));
        self
    }

    /// Add an integer field.
    pub fn add_integer<S: Into<String>>(mut self, name: S, value: i64) -> Self {
        self.document.add_field(name, FieldValue::Integer(value));
        self
    }

    /// Add a float field.
    pub fn add_float<S: Into<String>>(mut self, name: S, value: f64) -> Self {
        self.document.add_field(name, FieldValue::Float(value));
        self
    }

    /// Add a boolean field.
    pub fn add_boolean<S: Into<String>>(mut self, name: S, value: bool) -> Self {
        self.document.add_field(name, FieldValue::Boolean(value));
        self
    }

    /// Add a binary field.
    pub fn add_binary<S: Into<String>>(mut self, name: S, value: Vec<u8>) -> Self {
        self.document.add_field(name, FieldValue::Binary(value));
        self
    }

    /// Build the document.
    pub fn build(self) -> Document {
        self.document
    }
}

/// A `field:text` pair identifying documents to delete or update.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub text: String,
}

impl Term {
    pub fn new<F: Into<String>, T: Into<String>>(field: F, text: T) -> Self {
        Term {
            field: field.into(),
            text: text.into(),
        }
    }

    /// Text as stored in postings: lowercased.
    pub fn normalized_text(&self) -> String {
        self.text.to_lowercase()
    }

    /// Estimated heap bytes used while the term sits in the delete queue.
    pub fn ram_bytes_used(&self) -> usize {
        FIELD_OVERHEAD_BYTES + self.field.len() + self.text.len()
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_matching_is_word_based() {
        let doc = Document::builder().add_text("content", "aaa 0").build();
        assert!(doc.matches(&Term::new("content", "0")));
        assert!(doc.matches(&Term::new("content", "AAA")));
        assert!(!doc.matches(&Term::new("content", "aaa 0")));
        assert!(!doc.matches(&Term::new("content", "1")));
        assert!(!doc.matches(&Term::new("other", "0")));
    }

    #[test]
    fn test_scalar_matching() {
        let doc = Document::builder()
            .add_integer("id", 42)
            .add_boolean("live", true)
            .add_binary("blob", vec![1, 2])
            .build();
        assert!(doc.matches(&Term::new("id", "42")));
        assert!(doc.matches(&Term::new("live", "true")));
        assert!(!doc.matches(&Term::new("blob", "1")));
    }

    #[test]
    fn test_ram_estimate_grows_with_content() {
        let small = Document::builder().add_text("t", "a").build();
        let large = Document::builder().add_text("t", "a".repeat(1000)).build();
        assert!(large.ram_bytes_used() > small.ram_bytes_used() + 900);
        assert_eq!(Document::new().ram_bytes_used(), DOC_OVERHEAD_BYTES);
    }

    #[test]
    fn test_term_display() {
        assert_eq!(Term::new("content", "0").to_string(), "content:0");
    }
}
