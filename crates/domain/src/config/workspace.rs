use std::path::PathBuf;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Workspace paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    /// Root directory for per-run output files.
    #[serde(default = "d_output_dir")]
    pub output_dir: PathBuf,
    /// Directory of skill markdown files.
    #[serde(default = "d_skills_dir")]
    pub skills_dir: PathBuf,
    /// Directory of knowledge-base articles.
    #[serde(default = "d_knowledge_dir")]
    pub knowledge_dir: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            output_dir: d_output_dir(),
            skills_dir: d_skills_dir(),
            knowledge_dir: d_knowledge_dir(),
        }
    }
}

fn d_output_dir() -> PathBuf {
    PathBuf::from("./data/output")
}
fn d_skills_dir() -> PathBuf {
    PathBuf::from("./skills")
}
fn d_knowledge_dir() -> PathBuf {
    PathBuf::from("./knowledge")
}
