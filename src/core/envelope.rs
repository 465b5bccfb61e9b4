use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::io::Write;
use tempfile::NamedTempFile;

use crate::core::error::{EngineError, Result};

/// Reserved system key carrying the previous chain step's raw stdout into the
/// next step. Set only on steps after the first.
pub const PREV_OUTPUT_KEY: &str = "__prev_output";

/// Reserved system key stamped with the dispatch timestamp.
pub const EXECUTION_TIME_KEY: &str = "__execution_time";

/// Parameter payload handed to a script process.
///
/// Serialised as UTF-8 JSON into a temp file whose path is the sole
/// positional argument of the invoked process. Contract with every script:
/// read the file named by argv[1], parse the envelope, write the declared
/// output to stdout and exit 0; on failure write diagnostics to stderr and
/// exit non-zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParamEnvelope {
    #[serde(default)]
    pub user_params: Map<String, Value>,
    #[serde(default)]
    pub system_params: Map<String, Value>,
    #[serde(default)]
    pub file_params: Map<String, Value>,
}

impl ParamEnvelope {
    /// Normalise an arbitrary caller value into an envelope. A JSON object
    /// already carrying all three sections passes through unchanged; any
    /// other object is treated as bare user params; null means empty.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(map) => {
                let sectioned = ["user_params", "system_params", "file_params"]
                    .iter()
                    .all(|key| map.contains_key(*key));
                if sectioned {
                    serde_json::from_value(Value::Object(map))
                        .map_err(|e| EngineError::Parameter(e.to_string()))
                } else {
                    Ok(Self {
                        user_params: map,
                        ..Self::default()
                    })
                }
            }
            other => Err(EngineError::Parameter(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).map_err(|e| EngineError::Parameter(e.to_string()))?;
        Self::from_value(value)
    }

    pub fn set_prev_output(&mut self, output: &str) {
        self.system_params
            .insert(PREV_OUTPUT_KEY.to_string(), Value::String(output.to_string()));
    }

    pub fn stamp_execution_time(&mut self) {
        self.system_params.insert(
            EXECUTION_TIME_KEY.to_string(),
            Value::String(chrono::Utc::now().to_rfc3339()),
        );
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Write the envelope to a named temp file with a `.json` suffix. The
    /// returned guard deletes the file when dropped, on every exit path.
    pub fn write_temp(&self) -> Result<NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix("scriptdeck-params-")
            .suffix(".json")
            .tempfile()?;
        let body = serde_json::to_string(self)?;
        file.write_all(body.as_bytes())?;
        file.flush()?;
        Ok(file)
    }
}
