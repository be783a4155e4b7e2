//! Workflow definition parsing and filesystem operations.
//!
//! Converts between YAML/JSON files and `WorkflowDefinition`. Parsing does
//! not validate: drafts may be structurally incomplete until publish.

use std::path::{Path, PathBuf};

use cadence_types::workflow::WorkflowDefinition;

use super::error::EngineError;

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a `WorkflowDefinition`.
pub fn parse_definition_yaml(yaml: &str) -> Result<WorkflowDefinition, EngineError> {
    serde_yaml_ng::from_str(yaml).map_err(|e| EngineError::Parse(e.to_string()))
}

/// Parse a JSON string into a `WorkflowDefinition`.
pub fn parse_definition_json(json: &str) -> Result<WorkflowDefinition, EngineError> {
    serde_json::from_str(json).map_err(|e| EngineError::Parse(e.to_string()))
}

/// Serialize a `WorkflowDefinition` to a YAML string.
pub fn serialize_definition_yaml(def: &WorkflowDefinition) -> Result<String, EngineError> {
    serde_yaml_ng::to_string(def).map_err(|e| EngineError::Parse(e.to_string()))
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Load a definition from a `.json`, `.yaml` or `.yml` file.
pub fn load_definition_file(path: &Path) -> Result<WorkflowDefinition, EngineError> {
    let content = std::fs::read_to_string(path)?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => parse_definition_json(&content),
        _ => parse_definition_yaml(&content),
    }
}

/// Save a definition as YAML, creating parent directories as needed.
pub fn save_definition_file(path: &Path, def: &WorkflowDefinition) -> Result<(), EngineError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serialize_definition_yaml(def)?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover all definition files under `base_dir`, recursively.
///
/// Files that fail to parse are skipped with a warning.
pub fn discover_definitions(
    base_dir: &Path,
) -> Result<Vec<(PathBuf, WorkflowDefinition)>, EngineError> {
    let mut results = Vec::new();
    if !base_dir.exists() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, WorkflowDefinition)>,
) -> Result<(), EngineError> {
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
            continue;
        }
        let is_definition = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml" | "json")
        );
        if !is_definition {
            continue;
        }
        match load_definition_file(&path) {
            Ok(def) => results.push((path, def)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable definition file"),
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::testing::lead_scoring_definition;
    use tempfile::TempDir;

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("lead.yaml");
        let def = lead_scoring_definition();
        save_definition_file(&path, &def).unwrap();
        let loaded = load_definition_file(&path).unwrap();
        assert_eq!(loaded, def);
    }

    #[test]
    fn test_json_file_loads() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("lead.json");
        let def = lead_scoring_definition();
        std::fs::write(&path, serde_json::to_string(&def).unwrap()).unwrap();
        assert_eq!(load_definition_file(&path).unwrap().name, "lead-scoring");
    }

    #[test]
    fn test_parse_error() {
        let err = parse_definition_yaml("nodes: [").unwrap_err();
        assert!(matches!(err, EngineError::Parse(_)));
    }

    #[test]
    fn test_discover_skips_unparseable() {
        let dir = TempDir::new().unwrap();
        save_definition_file(&dir.path().join("a.yaml"), &lead_scoring_definition()).unwrap();
        save_definition_file(&dir.path().join("sub/b.yml"), &lead_scoring_definition()).unwrap();
        std::fs::write(dir.path().join("broken.yaml"), "::: nope").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let found = discover_definitions(dir.path()).unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn test_discover_missing_dir() {
        let found = discover_definitions(Path::new("/definitely/not/here")).unwrap();
        assert!(found.is_empty());
    }
}
