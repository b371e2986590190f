//! Append-only code version log
//!
//! Every fragment ever dispatched, in dispatch order, with its outcome. There
//! is no API to remove or reorder entries: the only mutation after append is
//! the single Pending -> terminal outcome change on a record.

use cadenza_core::{
    CadenzaError, DispatchId, DispatchRecord, ExportEntry, Outcome, Phase, Result,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeVersionLog {
    records: Vec<DispatchRecord>,
}

impl CodeVersionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record; ids must be strictly increasing
    pub fn append(&mut self, record: DispatchRecord) -> Result<DispatchId> {
        let id = record.id();
        if let Some(last) = self.records.last() {
            if last.id() >= id {
                return Err(CadenzaError::Dispatch(format!(
                    "Dispatch id {} does not follow {}",
                    id,
                    last.id()
                )));
            }
        }
        self.records.push(record);
        Ok(id)
    }

    /// Resolve the outcome of a record (exactly once)
    pub fn resolve(&mut self, id: DispatchId, outcome: Outcome) -> Result<&DispatchRecord> {
        let idx = self.position(id)?;
        let record = &mut self.records[idx];
        record.resolve(outcome)?;
        Ok(record)
    }

    pub fn get(&self, id: DispatchId) -> Option<&DispatchRecord> {
        self.position(id).ok().map(|idx| &self.records[idx])
    }

    /// All records in dispatch order
    pub fn records(&self) -> &[DispatchRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records still waiting for feedback
    pub fn pending(&self) -> impl Iterator<Item = &DispatchRecord> {
        self.records.iter().filter(|r| r.outcome.is_pending())
    }

    /// Oldest record without an outcome (the FIFO correlation target)
    pub fn oldest_pending(&self) -> Option<&DispatchRecord> {
        self.pending().next()
    }

    /// Every attempt made for one cycle
    pub fn for_cycle(&self, phase: Phase, cycle: u32) -> Vec<&DispatchRecord> {
        self.records
            .iter()
            .filter(|r| r.fragment.phase == phase && r.fragment.cycle == cycle)
            .collect()
    }

    /// Ordered `{phase, cycle, code_text, outcome}` view
    pub fn export(&self) -> Vec<ExportEntry> {
        self.records.iter().map(ExportEntry::from).collect()
    }

    pub fn export_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.export())?)
    }

    /// Write the export to a file, replacing any previous export
    pub fn write_export(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(path, self.export_json()?)?;
        Ok(())
    }

    fn position(&self, id: DispatchId) -> Result<usize> {
        self.records
            .binary_search_by_key(&id, DispatchRecord::id)
            .map_err(|_| CadenzaError::RecordNotFound(id.to_string()))
    }
}
