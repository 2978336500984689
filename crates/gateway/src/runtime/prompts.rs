//! System prompt composition.
//!
//! The prompt is assembled from: the base role description, the mode
//! section (read-only vs read-write), the persona section, the skills
//! index, and any context extracted from a platform URL the user shared.

use clerk_domain::config::{Mode, Persona};

use crate::skills::SkillsRegistry;

const BASE_PROMPT: &str = "\
You are Clerk, a configuration assistant for a document-processing platform.\n\
You help users inspect and change queues, schemas, hooks, rules, workspaces,\n\
engines, email templates and related resources through the available tools.\n\
\n\
Ground rules:\n\
- Inspect before you change: read the current state of an entity before\n\
  proposing or applying a modification.\n\
- Prefer the smallest change that satisfies the request.\n\
- Load additional tool categories with load_tool_category when the base\n\
  toolset is not enough; list_tool_categories shows what exists.\n\
- Track multi-step work with the task tools so the user can follow along.\n\
- When you produce files, write them with write_output_file so the user can\n\
  download them.";

const READ_ONLY_SECTION: &str = "\
Access mode: READ-ONLY. Write tools are not available. If the user asks for\n\
a change, explain what you would do and tell them to switch the chat to\n\
read-write mode; do not attempt the change.";

const READ_WRITE_SECTION: &str = "\
Access mode: READ-WRITE. Changes you make are tracked as commits and can be\n\
reverted with revert_commit; mention the commit summary when you finish a\n\
change.";

const CAUTIOUS_SECTION: &str = "\
Persona: cautious. Before any write, restate what will change and ask the\n\
user to confirm unless they already gave explicit, unambiguous instructions.\n\
Ask clarifying questions whenever a request could be read two ways.";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// URL context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Entity ids recognized in a platform URL the user is currently viewing.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UrlContext {
    pub queue_id: Option<String>,
    pub schema_id: Option<String>,
    pub annotation_id: Option<String>,
}

impl UrlContext {
    pub fn is_empty(&self) -> bool {
        self.queue_id.is_none() && self.schema_id.is_none() && self.annotation_id.is_none()
    }
}

/// Pull known entity ids out of a platform URL path
/// (`.../queues/123/...`, `.../schemas/45`, `.../annotations/678`).
pub fn extract_url_context(url: Option<&str>) -> UrlContext {
    let mut ctx = UrlContext::default();
    let Some(url) = url else {
        return ctx;
    };

    let path = url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(url)
        .split(['?', '#'])
        .next()
        .unwrap_or("");

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    for window in segments.windows(2) {
        let [name, id] = window else { continue };
        if !id.chars().all(|c| c.is_ascii_digit()) || id.is_empty() {
            continue;
        }
        match *name {
            "queues" => ctx.queue_id = Some((*id).to_string()),
            "schemas" => ctx.schema_id = Some((*id).to_string()),
            "annotations" | "documents" => ctx.annotation_id = Some((*id).to_string()),
            _ => {}
        }
    }
    ctx
}

fn format_url_context(ctx: &UrlContext) -> String {
    let mut lines = vec!["The user is currently viewing:".to_string()];
    if let Some(id) = &ctx.queue_id {
        lines.push(format!("- queue {id}"));
    }
    if let Some(id) = &ctx.schema_id {
        lines.push(format!("- schema {id}"));
    }
    if let Some(id) = &ctx.annotation_id {
        lines.push(format!("- annotation {id}"));
    }
    lines.push("Prefer these entities when the request is ambiguous.".to_string());
    lines.join("\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Composition
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub fn compose(
    mode: Mode,
    persona: Persona,
    skills: &SkillsRegistry,
    platform_url: Option<&str>,
) -> String {
    let mut sections = vec![BASE_PROMPT.to_string()];

    sections.push(match mode {
        Mode::ReadOnly => READ_ONLY_SECTION.to_string(),
        Mode::ReadWrite => READ_WRITE_SECTION.to_string(),
    });

    if persona == Persona::Cautious {
        sections.push(CAUTIOUS_SECTION.to_string());
    }

    if !skills.is_empty() {
        sections.push(format!(
            "Available skills (load the full playbook with load_skill):\n{}",
            skills.render_index()
        ));
    }

    let url_ctx = extract_url_context(platform_url);
    if !url_ctx.is_empty() {
        sections.push(format_url_context(&url_ctx));
    }

    sections.join("\n\n---\n\n")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
