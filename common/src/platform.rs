//! Platform-specific utilities for database paths.
//!
//! Provides cross-platform functions to determine the appropriate
//! location for storing database files on Windows, macOS, and Linux.

use std::path::{Path, PathBuf};

const APP_DIR: &str = "AMI";

/// Get the default database directory for the current platform.
///
/// Returns platform-specific paths:
/// - **Windows**: `%APPDATA%\AMI\db\`
/// - **macOS**: `~/Library/Application Support/AMI/db/`
/// - **Linux**: `$XDG_DATA_HOME/AMI/db/` or `~/.local/share/AMI/db/`
///
/// Falls back to `./AMI/db` when the platform data directory is unknown.
///
/// # Examples
///
/// ```
/// use common::platform::get_default_db_path;
///
/// let db_path = get_default_db_path();
/// println!("Database will be stored at: {:?}", db_path);
/// ```
pub fn get_default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
        .join("db")
}

/// Get a database path with a custom name within the default directory.
pub fn get_named_db_path(name: &str) -> PathBuf {
    get_default_db_path().join(name)
}

/// Ensure the database directory exists, creating it if necessary.
///
/// # Errors
///
/// Returns an error if the directory cannot be created.
pub fn ensure_db_directory(path: &Path) -> std::io::Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_db_path_shape() {
        let path = get_default_db_path();
        let path_str = path.to_str().unwrap();
        assert!(path_str.contains("AMI"));
        assert!(path_str.ends_with("db"));
    }

    #[test]
    fn test_named_db_path() {
        let path = get_named_db_path("ami_db");
        assert!(path.ends_with("ami_db"));
    }

    #[test]
    fn test_ensure_db_directory() {
        use tempfile::TempDir;

        let temp = TempDir::new().unwrap();
        let db_path = temp.path().join("AMI").join("db");
        assert!(!db_path.exists());

        ensure_db_directory(&db_path).unwrap();
        assert!(db_path.is_dir());
    }
}
