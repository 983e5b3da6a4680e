// src/schema.rs

use std::{fs, path::Path};

use anyhow::Error;
use envelope::Envelope;
use schemars::schema_for;

use crate::{batcher::Dispatch, config::BatcherConfig};

/// Write JSON schemas for what the coalescer reads (envelopes, config) and
/// what it emits (dispatch lines) into `out_dir`.
pub fn write_schema(out_dir: &Path) -> Result<Vec<String>, Error> {
    fs::create_dir_all(out_dir)?;

    let schemas = [
        ("envelope.schema.json", serde_json::to_string_pretty(&schema_for!(Envelope))?),
        ("dispatch.schema.json", serde_json::to_string_pretty(&schema_for!(Dispatch))?),
        ("config.schema.json", serde_json::to_string_pretty(&schema_for!(BatcherConfig))?),
    ];

    let mut written = Vec::with_capacity(schemas.len());
    for (file, json) in schemas {
        fs::write(out_dir.join(file), json)?;
        written.push(file.to_string());
    }
    Ok(written)
}
