//! A straightforward codec: JSON records in checksummed files.
//!
//! | file             | content                                  |
//! |------------------|------------------------------------------|
//! | `<seg>.sfd`      | one JSON document per record             |
//! | `<seg>.pst`      | one `[key, [doc ids]]` JSON per record   |
//! | `<seg>_<gen>.liv`| live-docs bitset bytes, then max doc     |

use bit_vec::BitVec;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::codec::{Codec, LiveDocsFormat, Postings, PostingsFormat, StoredFieldsFormat, checksum};
use crate::document::Document;
use crate::error::{Result, SluiceError};
use crate::index::segment::SegmentCommitInfo;
use crate::storage::Directory;

#[derive(Debug, Default)]
pub struct SimpleStoredFields;

impl SimpleStoredFields {
    fn file_name(segment: &str) -> String {
        format!("{segment}.sfd")
    }
}

impl StoredFieldsFormat for SimpleStoredFields {
    fn write(
        &self,
        directory: &dyn Directory,
        segment: &str,
        docs: &[Document],
    ) -> Result<Vec<String>> {
        let name = Self::file_name(segment);
        let encoded = docs
            .iter()
            .map(serde_json::to_vec)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut output = directory.create_output(&name)?;
        checksum::write_records(output.as_mut(), encoded.iter().map(Vec::as_slice))?;
        output.close()?;
        Ok(vec![name])
    }

    fn read(&self, directory: &dyn Directory, segment: &str) -> Result<Vec<Document>> {
        let name = Self::file_name(segment);
        let bytes = directory.read_file(&name)?;
        checksum::read_records(&bytes, &name)?
            .iter()
            .map(|record| serde_json::from_slice(record).map_err(SluiceError::from))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct SimplePostings;

impl SimplePostings {
    fn file_name(segment: &str) -> String {
        format!("{segment}.pst")
    }
}

impl PostingsFormat for SimplePostings {
    fn write(
        &self,
        directory: &dyn Directory,
        segment: &str,
        postings: &Postings,
    ) -> Result<Vec<String>> {
        let name = Self::file_name(segment);
        let encoded = postings
            .entries()
            .map(|entry| serde_json::to_vec(&entry))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let mut output = directory.create_output(&name)?;
        checksum::write_records(output.as_mut(), encoded.iter().map(Vec::as_slice))?;
        output.close()?;
        Ok(vec![name])
    }

    fn read(&self, directory: &dyn Directory, segment: &str) -> Result<Postings> {
        let name = Self::file_name(segment);
        let bytes = directory.read_file(&name)?;
        let entries = checksum::read_records(&bytes, &name)?
            .iter()
            .map(|record| serde_json::from_slice::<(String, Vec<u32>)>(record))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Postings::from_entries(entries))
    }
}

#[derive(Debug, Default)]
pub struct SimpleLiveDocs;

impl LiveDocsFormat for SimpleLiveDocs {
    fn write(
        &self,
        directory: &dyn Directory,
        segment: &SegmentCommitInfo,
        live_docs: &BitVec,
        generation: u64,
    ) -> Result<String> {
        if live_docs.len() != segment.max_doc() as usize {
            return Err(SluiceError::illegal_state(format!(
                "segment {}: live docs cover {} docs, expected {}",
                segment.name(),
                live_docs.len(),
                segment.max_doc()
            )));
        }
        let name = segment.live_docs_file_name(generation);
        let mut max_doc = Vec::with_capacity(4);
        max_doc.write_u32::<LittleEndian>(segment.max_doc())?;
        let bits = live_docs.to_bytes();

        let mut output = directory.create_output(&name)?;
        checksum::write_records(output.as_mut(), [bits.as_slice(), max_doc.as_slice()])?;
        output.close()?;
        Ok(name)
    }

    fn read(
        &self,
        directory: &dyn Directory,
        segment: &SegmentCommitInfo,
    ) -> Result<Option<BitVec>> {
        let Some(name) = segment.live_docs_file() else {
            return Ok(None);
        };
        let bytes = directory.read_file(&name)?;
        let records = checksum::read_records(&bytes, &name)?;
        let [bits, max_doc] = records.as_slice() else {
            return Err(SluiceError::corruption(format!("{name}: expected two records")));
        };
        let max_doc = max_doc.as_slice().read_u32::<LittleEndian>()?;
        if max_doc != segment.max_doc() {
            return Err(SluiceError::corruption(format!(
                "{name}: written for {max_doc} docs, segment has {}",
                segment.max_doc()
            )));
        }
        let mut live_docs = BitVec::from_bytes(bits);
        live_docs.truncate(max_doc as usize);
        Ok(Some(live_docs))
    }
}

/// Codec writing JSON records with a CRC32 footer.
#[derive(Debug, Default)]
pub struct SimpleCodec {
    stored_fields: SimpleStoredFields,
    postings: SimplePostings,
    live_docs: SimpleLiveDocs,
}

impl SimpleCodec {
    pub const NAME: &'static str = "simple";

    pub fn new() -> Self {
        Self::default()
    }
}

impl Codec for SimpleCodec {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn stored_fields(&self) -> &dyn StoredFieldsFormat {
        &self.stored_fields
    }

    fn postings(&self) -> &dyn PostingsFormat {
        &self.postings
    }

    fn live_docs(&self) -> &dyn LiveDocsFormat {
        &self.live_docs
    }
}
