use crate::error::StoreError;
use crate::store::{IncidentFilter, IncidentRecord, IncidentStore};
use std::collections::HashMap;
use std::sync::RwLock;

/// Process-local store backed by a lock-guarded map
#[derive(Debug, Default)]
pub struct InMemoryIncidentStore {
    records: RwLock<HashMap<String, IncidentRecord>>,
}

impl InMemoryIncidentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|records| records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl IncidentStore for InMemoryIncidentStore {
    fn save(&self, id: &str, record: &IncidentRecord) -> Result<(), StoreError> {
        let mut records = self.records.write().map_err(|_| StoreError::Poisoned)?;
        records.insert(id.to_string(), record.clone());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<IncidentRecord, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        records
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn list(&self, filter: &IncidentFilter) -> Result<Vec<IncidentRecord>, StoreError> {
        let records = self.records.read().map_err(|_| StoreError::Poisoned)?;
        let mut matching: Vec<IncidentRecord> = records
            .values()
            .filter(|record| filter.matches(record))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.incident_id.cmp(&b.incident_id))
        });
        Ok(matching)
    }
}
