use smallvec::SmallVec;

use crate::types::{DynRecordId, LabelId, Result, StorageError};

use super::record::RecordStore;

/// Label ids of one node, sorted ascending.
pub type LabelSet = SmallVec<[LabelId; 4]>;

/// Label storage of a node record: either encoded inline or spilled into a dynamic record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LabelField {
    Inline(Vec<u8>),
    Dynamic(DynRecordId),
}

impl Default for LabelField {
    fn default() -> Self {
        LabelField::Inline(vec![0, 0])
    }
}

/// Encodes a label set as `count:u16be` followed by `label:u32be` entries.
///
/// Labels are sorted and deduplicated before encoding.
pub fn encode_labels(labels: &[LabelId]) -> Result<Vec<u8>> {
    let mut sorted: LabelSet = labels.iter().copied().collect();
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() > u16::MAX as usize {
        return Err(StorageError::Corruption("too many labels for label field encoding").into());
    }
    let mut buf = Vec::with_capacity(2 + sorted.len() * 4);
    buf.extend_from_slice(&(sorted.len() as u16).to_be_bytes());
    for label in &sorted {
        buf.extend_from_slice(&label.0.to_be_bytes());
    }
    Ok(buf)
}

pub fn decode_labels(data: &[u8]) -> Result<LabelSet> {
    if data.len() < 2 {
        return Err(StorageError::Corruption("label field truncated").into());
    }
    let count = u16::from_be_bytes([data[0], data[1]]) as usize;
    if data.len() != 2 + count * 4 {
        return Err(StorageError::Corruption("label field length mismatch").into());
    }
    let mut labels = LabelSet::with_capacity(count);
    let mut offset = 2usize;
    for _ in 0..count {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(&data[offset..offset + 4]);
        offset += 4;
        labels.push(LabelId(u32::from_be_bytes(arr)));
    }
    if labels.windows(2).any(|pair| pair[0] >= pair[1]) {
        return Err(StorageError::Corruption("label field not sorted").into());
    }
    Ok(labels)
}

/// Resolves a label field, following the overflow pointer when the labels were spilled.
pub fn parse_labels_field(field: &LabelField, store: &dyn RecordStore) -> Result<LabelSet> {
    match field {
        LabelField::Inline(bytes) => decode_labels(bytes),
        LabelField::Dynamic(id) => {
            let bytes = store.dynamic_label_record(*id)?;
            decode_labels(&bytes)
        }
    }
}
