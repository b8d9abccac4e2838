//! Desired-state document loading.
//!
//! Documents are YAML by default; files ending in `.json` are read as JSON.

use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ConfigError, GraphError, Result};

use super::document::DesiredStateDocument;

/// Default document file names to search for.
pub const DEFAULT_DOCUMENT_FILES: &[&str] = &[
    "converge.yaml",
    "converge.yml",
    "resources.yaml",
    "resources.yml",
];

/// Parser for desired-state documents.
#[derive(Debug, Default)]
pub struct DocumentParser;

impl DocumentParser {
    /// Creates a new document parser.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Loads a document from a file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<DesiredStateDocument> {
        let path = path.as_ref();
        info!("Loading desired state from: {}", path.display());

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            }
            .into());
        }

        let content = std::fs::read_to_string(path).map_err(|e| GraphError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })?;

        if path.extension().is_some_and(|ext| ext == "json") {
            self.parse_json(&content, Some(path))
        } else {
            self.parse_yaml(&content, Some(path))
        }
    }

    /// Parses a document from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid.
    pub fn parse_yaml(&self, content: &str, source: Option<&Path>) -> Result<DesiredStateDocument> {
        debug!("Parsing YAML document");

        let document: DesiredStateDocument =
            serde_yaml::from_str(content).map_err(|e| GraphError::ParseError {
                message: format!("YAML parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })?;

        debug!("Parsed {} resource block(s)", document.resources.len());
        Ok(document)
    }

    /// Parses a document from a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is invalid.
    pub fn parse_json(&self, content: &str, source: Option<&Path>) -> Result<DesiredStateDocument> {
        debug!("Parsing JSON document");

        let document: DesiredStateDocument =
            serde_json::from_str(content).map_err(|e| GraphError::ParseError {
                message: format!("JSON parse error: {e}"),
                location: source.map(|p| p.display().to_string()),
            })?;

        debug!("Parsed {} resource block(s)", document.resources.len());
        Ok(document)
    }
}

/// Finds a document file in the given directory or its parents.
///
/// # Errors
///
/// Returns an error if no document file is found.
pub fn find_document_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_DOCUMENT_FILES {
            let candidate = current.join(filename);
            if candidate.exists() {
                info!("Found desired-state document: {}", candidate.display());
                return Ok(candidate);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ConfigError::FileNotFound {
        path: start.join(DEFAULT_DOCUMENT_FILES[0]),
    }
    .into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_yaml_document() {
        let yaml = r"
resources:
  - type: kx_environment
    name: env
    attributes:
      name: finspace-env
      kms_key_id: ${kms_key.key.arn}
";
        let document = DocumentParser::new().parse_yaml(yaml, None).expect("parses");
        assert_eq!(document.resources.len(), 1);
        assert_eq!(document.resources[0].name, "env");
    }

    #[test]
    fn test_unknown_field_rejected() {
        let yaml = r"
resources:
  - type: kx_environment
    name: env
    depends_on: []
";
        assert!(DocumentParser::new().parse_yaml(yaml, None).is_err());
    }

    #[test]
    fn test_load_json_file_and_find() {
        let temp = TempDir::new().expect("temp dir");
        let nested = temp.path().join("a").join("b");
        std::fs::create_dir_all(&nested).expect("mkdir");

        std::fs::write(temp.path().join("converge.yaml"), "resources: []\n").expect("write yaml");
        let json_path = temp.path().join("doc.json");
        std::fs::write(
            &json_path,
            r#"{"resources":[{"type":"kx_database","name":"db","attributes":{"name":"db"}}]}"#,
        )
        .expect("write json");

        let found = find_document_file(&nested).expect("found in parent");
        assert_eq!(found, temp.path().join("converge.yaml"));

        let document = DocumentParser::new().load_file(&json_path).expect("loads");
        assert_eq!(document.resources[0].address_text(), "kx_database.db");
    }

    #[test]
    fn test_missing_file() {
        let err = DocumentParser::new()
            .load_file("/nonexistent/converge.yaml")
            .expect_err("missing");
        assert!(matches!(
            err,
            crate::error::ConvergeError::Config(ConfigError::FileNotFound { .. })
        ));
    }
}
