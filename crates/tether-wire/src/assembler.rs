//! Index-ordered chunk reassembly.
//!
//! Chunks may arrive in any order. They are keyed by their declared index and
//! only concatenated once the stream is complete, at which point every index
//! in `0..expected` must be present.
//!
//! Indices and counts come from the agent. Gap accounting is arithmetic over
//! the held keys, so its cost never depends on how large a declared index is.

use std::collections::BTreeMap;

/// How many missing indices a gap report names.
pub const MISSING_REPORT_LIMIT: usize = 8;

/// Why a stream could not be reassembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblyError {
    /// Indices inside the expected range never arrived.
    Gaps {
        /// Total number of absent indices.
        missing: u64,
        /// The lowest absent indices, at most [`MISSING_REPORT_LIMIT`].
        first: Vec<u64>,
    },
    /// A chunk index no stream can end on.
    IndexOutOfRange(u64),
}

/// Buffers the chunks of one transfer until completion.
#[derive(Debug, Default)]
pub struct ChunkAssembler {
    chunks: BTreeMap<u64, Vec<u8>>,
    bytes_received: usize,
}

impl ChunkAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a chunk at `index`. A repeated index replaces the earlier bytes
    /// and returns false.
    pub fn insert(&mut self, index: u64, bytes: Vec<u8>) -> bool {
        self.bytes_received += bytes.len();
        match self.chunks.insert(index, bytes) {
            Some(previous) => {
                self.bytes_received -= previous.len();
                false
            }
            None => true,
        }
    }

    /// Number of distinct chunks held.
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Total payload bytes held.
    pub fn bytes_received(&self) -> usize {
        self.bytes_received
    }

    /// Check that every index below `expected` has arrived.
    ///
    /// Without an expected count the stream is assumed to end at the highest
    /// index seen.
    pub fn check(&self, expected: Option<u64>) -> Result<u64, AssemblyError> {
        let count = self.expected_count(expected)?;
        let held = self.chunks.range(..count).count() as u64;
        let missing = count - held;
        if missing == 0 {
            return Ok(count);
        }

        let mut first = Vec::with_capacity(MISSING_REPORT_LIMIT);
        let mut next = 0u64;
        for &index in self.chunks.range(..count).map(|(i, _)| i) {
            while next < index && first.len() < MISSING_REPORT_LIMIT {
                first.push(next);
                next += 1;
            }
            if first.len() == MISSING_REPORT_LIMIT {
                break;
            }
            next = index + 1;
        }
        while next < count && first.len() < MISSING_REPORT_LIMIT {
            first.push(next);
            next += 1;
        }
        Err(AssemblyError::Gaps { missing, first })
    }

    /// Concatenate chunks `0..expected` in index order.
    ///
    /// Fails if the stream has gaps. Chunks at or beyond `expected` are not
    /// part of the file and are discarded.
    pub fn assemble(self, expected: Option<u64>) -> Result<Vec<u8>, AssemblyError> {
        let count = self.check(expected)?;
        let mut out = Vec::with_capacity(self.bytes_received);
        for (_, bytes) in self.chunks.into_iter().take_while(|(i, _)| *i < count) {
            out.extend_from_slice(&bytes);
        }
        Ok(out)
    }

    fn expected_count(&self, expected: Option<u64>) -> Result<u64, AssemblyError> {
        if let Some(count) = expected {
            return Ok(count);
        }
        match self.chunks.keys().next_back() {
            Some(&last) => last
                .checked_add(1)
                .ok_or(AssemblyError::IndexOutOfRange(last)),
            None => Ok(0),
        }
    }
}
