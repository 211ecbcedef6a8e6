//! Environment constants and path utilities.
//!
//! Centralizes the hardcoded paths used by the CLI driver when it stores uploaded documents
//! and their task state on local disk.

use std::path::PathBuf;

/// Main application directory name (hidden directory like .git, .vscode)
pub const APP_DIR_NAME: &str = ".doc-architect";

/// Configuration file name
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Uploaded-document storage subdirectory name
pub const UPLOADS_DIR_NAME: &str = "uploads";

/// Build the main app directory path from a workspace root
pub fn app_dir_path(workspace_root: &std::path::Path) -> PathBuf {
    workspace_root.join(APP_DIR_NAME)
}

/// Build the uploads directory path from a workspace root
pub fn uploads_dir_path(workspace_root: &std::path::Path) -> PathBuf {
    app_dir_path(workspace_root).join(UPLOADS_DIR_NAME)
}

/// Build the storage path for one uploaded file within a workspace
pub fn upload_file_path(workspace_root: &std::path::Path, task_id: &str, file_name: &str) -> PathBuf {
    uploads_dir_path(workspace_root).join(task_id).join(file_name)
}

/// Build config directory path in the user's home directory
pub fn user_config_dir_path(home_dir: &std::path::Path) -> PathBuf {
    home_dir.join(APP_DIR_NAME)
}

/// Build config file path in the user's home directory
pub fn user_config_file_path(home_dir: &std::path::Path) -> PathBuf {
    user_config_dir_path(home_dir).join(CONFIG_FILE_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn test_path_construction() {
        let workspace = Path::new("/test/workspace");
        assert_eq!(app_dir_path(workspace), Path::new("/test/workspace/.doc-architect"));
        assert_eq!(
            uploads_dir_path(workspace),
            Path::new("/test/workspace/.doc-architect/uploads")
        );
        assert_eq!(
            upload_file_path(workspace, "t1", "spec.md"),
            Path::new("/test/workspace/.doc-architect/uploads/t1/spec.md")
        );
    }

    #[test]
    fn test_config_paths() {
        let home_dir = Path::new("/home/user");
        assert_eq!(
            user_config_file_path(home_dir),
            Path::new("/home/user/.doc-architect/config.toml")
        );
    }
}
