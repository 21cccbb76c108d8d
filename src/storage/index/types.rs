use crate::types::{NodeId, Result, StorageError};

/// Pull-based sequence of ascending, duplicate-free node ids.
pub trait PostingStream: Send {
    /// Appends at most `max` ids to `out`. Returns `false` once nothing is left to read.
    fn next_batch(&mut self, out: &mut Vec<NodeId>, max: usize) -> Result<bool>;

    /// Single-id pull built on [`next_batch`](Self::next_batch).
    fn next(&mut self) -> Result<Option<NodeId>> {
        let mut one = Vec::with_capacity(1);
        while one.is_empty() {
            if !self.next_batch(&mut one, 1)? && one.is_empty() {
                return Ok(None);
            }
        }
        Ok(one.pop())
    }
}

/// Boxed stream handed out by statements.
pub type NodeIdStream = Box<dyn PostingStream>;

/// A `PostingStream` that yields no results.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyPostingStream;

impl PostingStream for EmptyPostingStream {
    fn next_batch(&mut self, _out: &mut Vec<NodeId>, _max: usize) -> Result<bool> {
        Ok(false)
    }
}

/// Stream over an owned snapshot of node identifiers.
///
/// Readers take the snapshot while holding their lock and release it before the caller
/// starts pulling, so a stream never pins index or label-scan state.
#[derive(Debug)]
pub struct SnapshotPostingStream {
    nodes: Vec<NodeId>,
    pos: usize,
}

impl SnapshotPostingStream {
    pub fn new(mut nodes: Vec<NodeId>) -> Self {
        nodes.sort_unstable();
        nodes.dedup();
        Self { nodes, pos: 0 }
    }

    pub fn boxed(nodes: Vec<NodeId>) -> NodeIdStream {
        Box::new(Self::new(nodes))
    }
}

impl PostingStream for SnapshotPostingStream {
    fn next_batch(&mut self, out: &mut Vec<NodeId>, max: usize) -> Result<bool> {
        if max == 0 {
            return Ok(self.pos < self.nodes.len());
        }
        let remaining = self.nodes.len().saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(false);
        }
        let take = remaining.min(max);
        out.extend_from_slice(&self.nodes[self.pos..self.pos + take]);
        self.pos += take;
        Ok(self.pos < self.nodes.len())
    }
}

/// Appends everything `stream` still holds to `out`.
///
/// A stream that reports more data but hands back an empty batch is treated as corrupt.
pub fn collect_all(stream: &mut dyn PostingStream, out: &mut Vec<NodeId>) -> Result<()> {
    const BATCH: usize = 256;
    let mut more = true;
    while more {
        let before = out.len();
        more = stream.next_batch(out, BATCH)?;
        if more && out.len() == before {
            return Err(StorageError::Corruption("posting stream stalled without yielding ids").into());
        }
    }
    Ok(())
}
