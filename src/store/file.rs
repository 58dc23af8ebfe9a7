use crate::error::StoreError;
use crate::store::{IncidentFilter, IncidentRecord, IncidentStore};
use log::{debug, warn};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Store keeping one pretty-printed JSON document per incident
///
/// Writes go to a temporary file that is renamed into place, so readers never
/// observe a half-written record.
#[derive(Debug, Clone)]
pub struct JsonFileIncidentStore {
    dir: PathBuf,
}

impl JsonFileIncidentStore {
    /// Open a store rooted at `dir`, creating the directory if needed
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", file_stem(id)))
    }
}

/// Map an incident id onto a safe file name
fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

impl IncidentStore for JsonFileIncidentStore {
    fn save(&self, id: &str, record: &IncidentRecord) -> Result<(), StoreError> {
        let path = self.record_path(id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_vec_pretty(record)?;

        fs::write(&tmp, json)?;
        fs::rename(&tmp, &path)?;
        debug!("Saved incident {} to {}", id, path.display());
        Ok(())
    }

    fn get(&self, id: &str) -> Result<IncidentRecord, StoreError> {
        let path = self.record_path(id);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn list(&self, filter: &IncidentFilter) -> Result<Vec<IncidentRecord>, StoreError> {
        let mut records = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }

            let record: IncidentRecord = match fs::read(&path)
                .map_err(StoreError::from)
                .and_then(|bytes| serde_json::from_slice(&bytes).map_err(StoreError::from))
            {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable incident file {}: {}", path.display(), e);
                    continue;
                }
            };

            if filter.matches(&record) {
                records.push(record);
            }
        }

        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.incident_id.cmp(&b.incident_id))
        });
        Ok(records)
    }
}
