//! Suppression of records re-delivered at stream boundaries

use crate::types::LogRecord;

/// Remembers the last record shown so a reopened stream does not repeat it
#[derive(Debug, Default, Clone)]
pub struct LogCursor {
    last: Option<LogRecord>,
}

impl LogCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last(&self) -> Option<&LogRecord> {
        self.last.as_ref()
    }

    pub fn clear(&mut self) {
        self.last = None;
    }

    /// Keep only records newer than the last one shown, in arrival order,
    /// and advance the cursor to the newest of them.
    ///
    /// When the batch contains the last shown record, everything up to and
    /// including its final occurrence was already displayed. Otherwise a
    /// record is new if it is not older than the last shown one and not
    /// equal to it.
    pub fn filter_new(&mut self, batch: Vec<LogRecord>) -> Vec<LogRecord> {
        let mask = self.admit(&batch);
        batch
            .into_iter()
            .zip(mask)
            .filter_map(|(record, keep)| keep.then_some(record))
            .collect()
    }

    /// Same rule as [`filter_new`](Self::filter_new), returned as a per-record mask
    pub fn admit(&mut self, batch: &[LogRecord]) -> Vec<bool> {
        let mask: Vec<bool> = match &self.last {
            None => vec![true; batch.len()],
            Some(last) => match batch.iter().rposition(|r| r == last) {
                Some(pos) => (0..batch.len()).map(|i| i > pos).collect(),
                None => batch
                    .iter()
                    .map(|r| r.timestamp >= last.timestamp && r != last)
                    .collect(),
            },
        };

        if let Some(newest) = batch.iter().zip(&mask).filter(|(_, keep)| **keep).last() {
            self.last = Some(newest.0.clone());
        }
        mask
    }
}
