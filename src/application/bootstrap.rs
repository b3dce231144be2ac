use crate::infrastructure::config::{TripsyncConfig, ensure_default_configs, load_config};
use crate::infrastructure::error::InfraError;
use crate::infrastructure::storage::initialize_database;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

const DATABASE_FILE: &str = "tripsync.sqlite";

#[derive(Debug)]
pub struct BootstrapResult {
    pub workspace_root: PathBuf,
    pub config_dir: PathBuf,
    pub database_path: PathBuf,
    pub config: TripsyncConfig,
}

/// Prepares `<root>/config` and `<root>/state`, writing default configs and
/// the local schema when missing.
pub fn bootstrap_workspace(workspace_root: &Path) -> Result<BootstrapResult, InfraError> {
    let config_dir = workspace_root.join("config");
    let state_dir = workspace_root.join("state");
    let database_path = state_dir.join(DATABASE_FILE);

    fs::create_dir_all(&config_dir)?;
    fs::create_dir_all(&state_dir)?;

    ensure_default_configs(&config_dir)?;
    let config = load_config(&config_dir)?;
    initialize_database(&database_path)?;
    info!(
        workspace = %workspace_root.display(),
        backend = ?config.backend.kind,
        "workspace ready"
    );

    Ok(BootstrapResult {
        workspace_root: workspace_root.to_path_buf(),
        config_dir,
        database_path,
        config,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::config::BackendKind;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static NEXT_TEMP_WORKSPACE: AtomicUsize = AtomicUsize::new(0);

    struct TempWorkspace {
        path: PathBuf,
    }

    impl TempWorkspace {
        fn new() -> Self {
            let sequence = NEXT_TEMP_WORKSPACE.fetch_add(1, Ordering::Relaxed);
            let path = std::env::temp_dir().join(format!(
                "tripsync-bootstrap-tests-{}-{}",
                std::process::id(),
                sequence
            ));
            fs::create_dir_all(&path).expect("create temp workspace");
            Self { path }
        }
    }

    impl Drop for TempWorkspace {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.path);
        }
    }

    #[test]
    fn creates_layout_and_defaults() {
        let workspace = TempWorkspace::new();
        let result = bootstrap_workspace(&workspace.path).expect("bootstrap");

        assert!(result.config_dir.join("app.json").exists());
        assert!(result.config_dir.join("backend.json").exists());
        assert!(result.config_dir.join("sync.json").exists());
        assert!(result.database_path.exists());
        assert_eq!(result.config.backend.kind, BackendKind::Sqlite);
    }

    #[test]
    fn bootstrapping_twice_keeps_edited_config() {
        let workspace = TempWorkspace::new();
        bootstrap_workspace(&workspace.path).expect("first bootstrap");
        fs::write(
            workspace.path.join("config").join("backend.json"),
            r#"{ "schema": 1, "kind": "memory" }"#,
        )
        .expect("edit backend config");

        let result = bootstrap_workspace(&workspace.path).expect("second bootstrap");
        assert_eq!(result.config.backend.kind, BackendKind::Memory);
    }
}
