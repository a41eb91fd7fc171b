//! Write-ahead log segments and ordered sequences of them.
//!
//! A [`TLogs`] sequence is ordered oldest first. The `written_to_backend`
//! flags of its entries always form a prefix: no durable TLog may follow one
//! that is not yet durable.

use std::ops::Deref;
use tracing::error;
use voldrv_common::{Error, OrderedTLogIds, Result, TLogId};

/// One write-ahead log segment
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TLog {
    id: TLogId,
    written_to_backend: bool,
    backend_size: u64,
}

impl TLog {
    /// A fresh, open TLog
    #[must_use]
    pub fn new() -> Self {
        Self::from_parts(TLogId::new(), false, 0)
    }

    /// Rebuild a TLog from persisted or externally produced state
    #[must_use]
    pub const fn from_parts(id: TLogId, written_to_backend: bool, backend_size: u64) -> Self {
        Self {
            id,
            written_to_backend,
            backend_size,
        }
    }

    #[must_use]
    pub const fn id(&self) -> TLogId {
        self.id
    }

    /// Backend object name
    #[must_use]
    pub fn name(&self) -> String {
        self.id.name()
    }

    #[must_use]
    pub const fn written_to_backend(&self) -> bool {
        self.written_to_backend
    }

    #[must_use]
    pub const fn backend_size(&self) -> u64 {
        self.backend_size
    }

    pub fn add_to_backend_size(&mut self, size: u64) {
        self.backend_size += size;
    }
}

impl Default for TLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered sequence of TLogs, oldest first
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TLogs(Vec<TLog>);

impl Deref for TLogs {
    type Target = [TLog];

    fn deref(&self) -> &[TLog] {
        &self.0
    }
}

impl From<Vec<TLog>> for TLogs {
    fn from(tlogs: Vec<TLog>) -> Self {
        Self(tlogs)
    }
}

impl FromIterator<TLog> for TLogs {
    fn from_iter<I: IntoIterator<Item = TLog>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl IntoIterator for TLogs {
    type Item = TLog;
    type IntoIter = std::vec::IntoIter<TLog>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl<'a> IntoIterator for &'a TLogs {
    type Item = &'a TLog;
    type IntoIter = std::slice::Iter<'a, TLog>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl TLogs {
    #[must_use]
    pub const fn new() -> Self {
        Self(Vec::new())
    }

    /// Append a TLog
    pub fn push(&mut self, tlog: TLog) {
        self.0.push(tlog);
    }

    pub fn clear(&mut self) {
        self.0.clear();
    }

    /// Mutable access to the newest TLog
    pub fn last_mut(&mut self) -> Option<&mut TLog> {
        self.0.last_mut()
    }

    /// Ids oldest first
    #[must_use]
    pub fn ids(&self) -> OrderedTLogIds {
        self.0.iter().map(TLog::id).collect()
    }

    /// Ids newest first
    #[must_use]
    pub fn reverse_ids(&self) -> OrderedTLogIds {
        self.0.iter().rev().map(TLog::id).collect()
    }

    /// The durable prefix
    #[must_use]
    pub fn tlogs_on_backend(&self) -> Self {
        self.0
            .iter()
            .take_while(|t| t.written_to_backend)
            .cloned()
            .collect()
    }

    /// All TLogs durable (vacuously true when empty)
    #[must_use]
    pub fn written_to_backend(&self) -> bool {
        self.0.iter().all(|t| t.written_to_backend)
    }

    #[must_use]
    pub fn find(&self, id: TLogId) -> Option<&TLog> {
        self.0.iter().find(|t| t.id == id)
    }

    #[must_use]
    pub fn tlog_referenced(&self, id: TLogId) -> bool {
        self.find(id).is_some()
    }

    /// `None` if the TLog is not part of this sequence
    #[must_use]
    pub fn is_tlog_written_to_backend(&self, id: TLogId) -> Option<bool> {
        self.find(id).map(TLog::written_to_backend)
    }

    /// Sum of the backend sizes of all TLogs
    #[must_use]
    pub fn backend_size(&self) -> u64 {
        self.0.iter().map(TLog::backend_size).sum()
    }

    /// Mark `id` durable. Returns whether it was found.
    ///
    /// Fails without modifying anything if a TLog preceding `id` in this
    /// sequence is not durable yet.
    pub fn set_tlog_written_to_backend(&mut self, id: TLogId) -> Result<bool> {
        for tlog in &mut self.0 {
            if tlog.id == id {
                tlog.written_to_backend = true;
                return Ok(true);
            } else if !tlog.written_to_backend {
                error!(
                    "TLog {} marked written to backend but earlier TLog {} is not",
                    id, tlog.id
                );
                return Err(Error::OrderingViolation {
                    tlog: id,
                    predecessor: tlog.id,
                });
            }
        }
        Ok(false)
    }

    /// Drop every TLog after `id`, optionally resetting the size of `id`
    /// itself. Returns whether `id` was found; nothing changes otherwise.
    pub fn snip(&mut self, id: TLogId, backend_size: Option<u64>) -> bool {
        match self.0.iter().position(|t| t.id == id) {
            Some(pos) => {
                if let Some(size) = backend_size {
                    self.0[pos].backend_size = size;
                }
                self.0.truncate(pos + 1);
                true
            }
            None => false,
        }
    }

    /// Append all of `newer`
    pub(crate) fn push_all(&mut self, newer: Self) {
        self.0.extend(newer.0);
    }

    /// Put `older` in front of this sequence
    pub fn prepend(&mut self, older: Self) {
        let mut merged = older.0;
        merged.append(&mut self.0);
        self.0 = merged;
    }

    /// Exact id equality with `ids`, in order
    #[must_use]
    pub fn has_ids(&self, ids: &[TLogId]) -> bool {
        self.0.len() == ids.len() && self.0.iter().zip(ids).all(|(t, id)| t.id == *id)
    }

    /// Replace the whole contents
    pub(crate) fn reset(&mut self, tlogs: Vec<TLog>) {
        self.0 = tlogs;
    }

    /// Walk newest to oldest collecting durable ids into `reversed` until
    /// `cork` is met.
    ///
    /// Returns `Ok(true)` once the cork is found, `Ok(false)` if the whole
    /// sequence was consumed without seeing it.
    pub(crate) fn reversed_tlogs_on_backend_since(
        &self,
        cork: Option<TLogId>,
        reversed: &mut OrderedTLogIds,
    ) -> Result<bool> {
        let mut seen_written = false;
        for tlog in self.0.iter().rev() {
            if Some(tlog.id) == cork {
                if !tlog.written_to_backend {
                    error!("Cork {} found but not written to backend", tlog.id);
                    return Err(Error::CorkNotOnBackend(tlog.id));
                }
                return Ok(true);
            } else if tlog.written_to_backend {
                seen_written = true;
                reversed.push(tlog.id);
            } else {
                assert!(
                    !seen_written,
                    "TLog {} not written to backend precedes a written one",
                    tlog.id
                );
            }
        }
        Ok(false)
    }
}

/// Checks the written-to-backend prefix invariant across consecutive
/// sequences, oldest first.
#[derive(Debug, Default)]
pub(crate) struct WrittenPrefixVerifier {
    first_unwritten: Option<TLogId>,
}

impl WrittenPrefixVerifier {
    pub(crate) fn check(&mut self, tlogs: &[TLog]) -> Result<()> {
        for tlog in tlogs {
            match (tlog.written_to_backend, self.first_unwritten) {
                (true, Some(predecessor)) => {
                    error!(
                        "TLog {} marked as written to backend but a previous TLog {} was not",
                        tlog.id, predecessor
                    );
                    return Err(Error::OrderingViolation {
                        tlog: tlog.id,
                        predecessor,
                    });
                }
                (false, None) => self.first_unwritten = Some(tlog.id),
                _ => {}
            }
        }
        Ok(())
    }
}
