//! File classification by naming convention
//!
//! Only the file name is inspected, never the content. Each registered token
//! is matched case-insensitively as a substring of the stem; when several
//! match, the longest token wins and equal lengths fall back to registry
//! declaration order.

use std::path::Path;
use tracing::{debug, warn};

use super::models::LogicalFileType;
use super::registry::SchemaRegistry;

#[derive(Debug, Clone, Copy)]
pub struct FileClassifier {
    registry: SchemaRegistry,
}

impl FileClassifier {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Logical type for a file name, `None` when unrecognized
    pub fn classify(&self, file_name: &str) -> Option<LogicalFileType> {
        let stem = Path::new(file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        let mut best: Option<(LogicalFileType, &str)> = None;
        let mut matched_types: Vec<LogicalFileType> = Vec::new();

        for mapping in self.registry.mappings() {
            for token in mapping.tokens.iter().copied() {
                if !stem.contains(token) {
                    continue;
                }
                if !matched_types.contains(&mapping.file_type) {
                    matched_types.push(mapping.file_type);
                }
                // Strictly longer only, so the earlier mapping keeps ties
                if best.map_or(true, |(_, t)| token.len() > t.len()) {
                    best = Some((mapping.file_type, token));
                }
            }
        }

        if let Some((file_type, token)) = best {
            if matched_types.len() > 1 {
                warn!(
                    file = file_name,
                    candidates = ?matched_types,
                    chosen = %file_type,
                    token,
                    "File name matches several types, using longest token"
                );
            } else {
                debug!(file = file_name, file_type = %file_type, token, "Classified file");
            }
        }

        best.map(|(file_type, _)| file_type)
    }
}
