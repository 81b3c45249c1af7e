//! Loads a saved interaction analysis to seed the chat request context.

use std::{fs, io, path::Path};

use channel_core::AnalysisSnapshot;

/// Load analysis JSON from disk when available.
///
/// A missing file is not an error: the chat runs with the configured drug list only.
pub fn load_analysis(path: &Path) -> Result<Option<AnalysisSnapshot>, String> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(format!("failed reading analysis {}: {err}", path.display()));
        }
    };

    let analysis = serde_json::from_str::<AnalysisSnapshot>(&raw)
        .map_err(|err| format!("failed parsing analysis {}: {err}", path.display()))?;
    Ok(Some(analysis))
}
