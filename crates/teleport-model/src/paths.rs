use std::path::PathBuf;

/// On-disk layout of the agent's scratch tree under the system temp dir:
/// `<tempdir>/armorcode/{log,output_files}`. Logs and metrics rotate in
/// `log`; per-task response spools live in `output_files` and are deleted
/// eagerly.
#[derive(Debug, Clone)]
pub struct AgentPaths {
    root: PathBuf,
}

impl AgentPaths {
    pub fn new() -> Self {
        Self {
            root: std::env::temp_dir().join("armorcode"),
        }
    }

    /// Rooted at an explicit directory instead of the system temp dir.
    pub fn rooted_at(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join("output_files")
    }
}

impl Default for AgentPaths {
    fn default() -> Self {
        Self::new()
    }
}
