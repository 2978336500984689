//! Skill registry — markdown playbooks loadable into the prompt on demand.
//!
//! Each `*.md` file under the skills directory is one skill: the file stem
//! is the name, the first heading line the description. The index is
//! rendered into the system prompt; the full document loads through the
//! `load_skill` tool once per chat.

use std::collections::BTreeMap;
use std::path::Path;

use clerk_domain::error::{Error, Result};

#[derive(Debug, Clone)]
pub struct Skill {
    pub name: String,
    pub description: String,
    pub body: String,
}

#[derive(Default)]
pub struct SkillsRegistry {
    skills: BTreeMap<String, Skill>,
}

impl SkillsRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Load all skills from a directory. A missing directory yields an
    /// empty registry rather than an error.
    pub fn load(dir: &Path) -> Result<Self> {
        let mut skills = BTreeMap::new();
        if !dir.exists() {
            tracing::debug!(path = %dir.display(), "skills directory not found");
            return Ok(Self { skills });
        }

        for entry in std::fs::read_dir(dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body = std::fs::read_to_string(&path).map_err(Error::Io)?;
            let description = body
                .lines()
                .find(|l| !l.trim().is_empty())
                .map(|l| l.trim_start_matches('#').trim().to_string())
                .unwrap_or_default();
            skills.insert(
                name.to_string(),
                Skill {
                    name: name.to_string(),
                    description,
                    body,
                },
            );
        }

        tracing::info!(count = skills.len(), "skills loaded");
        Ok(Self { skills })
    }

    pub fn get(&self, name: &str) -> Option<&Skill> {
        self.skills.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.skills.is_empty()
    }

    /// One line per skill, for the system prompt.
    pub fn render_index(&self) -> String {
        self.skills
            .values()
            .map(|s| format!("- {}: {}", s.name, s.description))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_markdown_skills() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("schema-design.md"),
            "# Schema design basics\n\nKeep datapoints flat.",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "not a skill").unwrap();

        let registry = SkillsRegistry::load(dir.path()).unwrap();
        assert!(!registry.is_empty());
        let skill = registry.get("schema-design").unwrap();
        assert_eq!(skill.description, "Schema design basics");
        assert!(registry.render_index().contains("schema-design"));
        assert!(registry.get("notes").is_none());
    }

    #[test]
    fn missing_directory_is_empty() {
        let registry = SkillsRegistry::load(Path::new("/definitely/not/here")).unwrap();
        assert!(registry.is_empty());
        assert!(registry.render_index().is_empty());
    }
}
