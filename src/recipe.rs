//! Recipe loading - turns an already-decoded JSON recipe into ordered depots.
//!
//! The engine does not care how depot manifests were obtained or decrypted;
//! a recipe is their decoded form. Depot order in the file is the processing
//! order and decides overwrite resolution.

use crate::manifest::Depot;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("failed to read recipe {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("recipe {path:?} is not valid JSON")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Deserialize)]
pub struct Recipe {
    /// Chunk source base URLs, tried in order. May be overridden on the
    /// command line.
    #[serde(default)]
    pub sources: Vec<String>,
    pub depots: Vec<Depot>,
}

pub fn load(path: &Path) -> Result<Recipe, RecipeError> {
    let text = std::fs::read_to_string(path).map_err(|source| RecipeError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| RecipeError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_a_two_depot_recipe() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
                "sources": ["http://cdn-a.example", "http://cdn-b.example"],
                "depots": [
                    {{
                        "id": 440,
                        "manifest_gid": "8437241239917459372",
                        "key": "aa11",
                        "manifest": {{
                            "files": [
                                {{
                                    "path": "game.bin",
                                    "total_size": 4,
                                    "chunks": [
                                        {{"offset": 0, "length": 4, "sha1": "{}"}}
                                    ]
                                }}
                            ]
                        }}
                    }},
                    {{
                        "id": 441,
                        "manifest_gid": "17",
                        "manifest": {{"files": []}}
                    }}
                ]
            }}"#,
            crate::manifest::sha1_hex(b"data"),
        )
        .unwrap();

        let recipe = load(file.path()).unwrap();
        assert_eq!(recipe.sources.len(), 2);
        assert_eq!(recipe.depots.len(), 2);
        assert_eq!(recipe.depots[0].id, 440);
        assert_eq!(recipe.depots[0].manifest.files[0].total_size, 4);
        // key is optional in the decoded form
        assert_eq!(recipe.depots[1].key, "");
        recipe.depots[0].manifest.validate().unwrap();
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = load(Path::new("/nonexistent/recipe.json")).unwrap_err();
        assert!(matches!(err, RecipeError::Io { .. }));
    }

    #[test]
    fn garbage_is_a_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "not json at all").unwrap();
        let err = load(file.path()).unwrap_err();
        assert!(matches!(err, RecipeError::Parse { .. }));
    }
}
