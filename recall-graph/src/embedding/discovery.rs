//! Model cache directory discovery
//!
//! Finds where local embedding models are (or will be) cached.

use std::path::{Path, PathBuf};

/// Resolve the model cache directory with priority:
/// 1. Explicitly configured directory
/// 2. RECALL_GRAPH_MODELS_PATH environment variable
/// 3. User home directory (~/.recall-graph/models)
/// 4. ./models relative to the working directory
pub fn find_model_cache_dir(configured: Option<&Path>) -> PathBuf {
    if let Some(dir) = configured {
        log::info!("Using configured model cache: {}", dir.display());
        return dir.to_path_buf();
    }

    if let Ok(models_path) = std::env::var("RECALL_GRAPH_MODELS_PATH") {
        if !models_path.trim().is_empty() {
            let path = PathBuf::from(&models_path);
            log::info!("Using RECALL_GRAPH_MODELS_PATH: {}", path.display());
            return path;
        }
    }

    if let Some(home) = std::env::var_os("HOME").or_else(|| std::env::var_os("USERPROFILE")) {
        let user_path = PathBuf::from(home).join(".recall-graph").join("models");
        log::info!("Using user model cache: {}", user_path.display());
        return user_path;
    }

    log::warn!("No home directory found; caching models under ./models");
    PathBuf::from("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_dir_wins() {
        let dir = PathBuf::from("/tmp/recall-graph-models");
        assert_eq!(find_model_cache_dir(Some(&dir)), dir);
    }

    #[test]
    fn test_fallback_is_never_empty() {
        let path = find_model_cache_dir(None);
        assert!(!path.as_os_str().is_empty());
    }
}
