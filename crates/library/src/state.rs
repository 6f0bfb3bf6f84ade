use std::fs;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ScanError;

/// Start time of the last full scan and the directories that held songs then.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ScanState {
    #[serde(with = "time::serde::rfc3339")]
    pub time: OffsetDateTime,
    #[serde(default)]
    pub dirs: Vec<String>,
}

impl ScanState {
    pub fn load(path: &Path) -> Result<Option<ScanState>, ScanError> {
        match fs::read(path) {
            Ok(data) => {
                let mut state: ScanState = serde_json::from_slice(&data)?;
                state.dirs.sort();
                state.dirs.dedup();
                Ok(Some(state))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes through a sibling temp file and renames it into place.
    pub fn save(&self, path: &Path) -> Result<(), ScanError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn has_dir(&self, dir: &str) -> bool {
        self.dirs.binary_search_by(|d| d.as_str().cmp(dir)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn state_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last_update.json");
        assert_eq!(ScanState::load(&path).unwrap(), None);

        let state = ScanState {
            time: datetime!(2024-02-03 04:05:06 UTC),
            dirs: vec!["a".into(), "b/c".into()],
        };
        state.save(&path).unwrap();
        let loaded = ScanState::load(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(loaded.has_dir("b/c"));
        assert!(!loaded.has_dir("b"));

        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\"time\": \"2024-02-03T04:05:06Z\""));
    }
}
