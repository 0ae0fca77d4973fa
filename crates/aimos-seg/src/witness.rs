//! JSONL witness sink.

use aimos_types::config::default_home_dir;
use aimos_types::witness::{WitnessEmitter, WitnessRecord};
use aimos_types::{AimosError, AimosResult};
use chrono::Utc;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;
use uuid::Uuid;

pub const WITNESS_FILE: &str = "witnesses.jsonl";

/// `~/.aimos/seg/witnesses.jsonl`.
pub fn default_witness_path() -> PathBuf {
    default_home_dir().join("seg").join(WITNESS_FILE)
}

/// Appends one JSON object per witness record.
pub struct JsonlWitnessEmitter {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlWitnessEmitter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a raw payload. `witness_id` and `recorded_at` are filled in
    /// unless the payload carries them; returns the witness id.
    pub fn write(&self, payload: Value) -> AimosResult<String> {
        let Value::Object(fields) = payload else {
            return Err(AimosError::validation("witness payload must be a JSON object"));
        };
        let mut line = serde_json::Map::new();
        line.insert(
            "witness_id".to_string(),
            json!(format!("seg:witness:{}", Uuid::new_v4())),
        );
        line.insert("recorded_at".to_string(), json!(Utc::now().to_rfc3339()));
        line.extend(fields);
        let witness_id = line
            .get("witness_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut text = serde_json::to_string(&Value::Object(line))?;
        text.push('\n');

        let _guard = self.lock.lock();
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(text.as_bytes())?;
        debug!(witness_id = %witness_id, path = %self.path.display(), "Witness written");
        Ok(witness_id)
    }
}

impl WitnessEmitter for JsonlWitnessEmitter {
    fn name(&self) -> &str {
        "seg-jsonl"
    }

    fn emit(&self, record: &WitnessRecord) -> AimosResult<String> {
        self.write(serde_json::to_value(record)?)
    }
}
