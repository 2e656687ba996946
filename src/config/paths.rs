//! Canonical paths for arkmongo state.
//!
//! Single source of truth - import this instead of hardcoding paths.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use arkmongo::config::paths;
//!
//! let db = paths::index_db()?;
//! ```

use std::path::{Path, PathBuf};

use anyhow::Result;

/// File name of the hash index database
pub const INDEX_DB_FILE: &str = "index.db";

/// Get the arkmongo home directory (~/.arkmongo)
pub fn arkmongo_home() -> Result<PathBuf> {
    Ok(crate::config::config()?.home.clone())
}

/// Get the hash index database path (~/.arkmongo/index.db)
pub fn index_db() -> Result<PathBuf> {
    Ok(index_db_in(&arkmongo_home()?))
}

/// Index database path under a given home directory
pub fn index_db_in(home: &Path) -> PathBuf {
    home.join(INDEX_DB_FILE)
}

/// Get the document store root (~/.arkmongo/documents by default)
pub fn documents_dir() -> Result<PathBuf> {
    Ok(crate::config::config()?.documents.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_db_lives_under_home() {
        let home = PathBuf::from("/srv/arkmongo");
        assert_eq!(index_db_in(&home), PathBuf::from("/srv/arkmongo/index.db"));
    }
}
