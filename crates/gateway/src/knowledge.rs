//! Knowledge-base lookup over a local markdown corpus.
//!
//! Articles are `*.md` files; search is token-overlap scoring, good enough
//! for the built-in `search_knowledge_base` tool to pull relevant excerpts
//! into context (the analysis mode on top runs as a sub-agent).

use std::path::Path;

use clerk_domain::error::{Error, Result};

const EXCERPT_MAX_CHARS: usize = 1500;

#[derive(Debug, Clone)]
pub struct Article {
    pub slug: String,
    pub title: String,
    body: String,
    tokens: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct SearchHit {
    pub slug: String,
    pub title: String,
    pub score: f32,
    pub excerpt: String,
}

#[derive(Default)]
pub struct KnowledgeBase {
    articles: Vec<Article>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(str::to_owned)
        .collect()
}

impl KnowledgeBase {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(dir: &Path) -> Result<Self> {
        let mut articles = Vec::new();
        if !dir.exists() {
            tracing::debug!(path = %dir.display(), "knowledge directory not found");
            return Ok(Self { articles });
        }

        for entry in std::fs::read_dir(dir).map_err(Error::Io)? {
            let entry = entry.map_err(Error::Io)?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(slug) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let body = std::fs::read_to_string(&path).map_err(Error::Io)?;
            let title = body
                .lines()
                .find(|l| l.starts_with('#'))
                .map(|l| l.trim_start_matches('#').trim().to_string())
                .unwrap_or_else(|| slug.to_string());
            articles.push(Article {
                slug: slug.to_string(),
                title,
                tokens: tokenize(&body),
                body,
            });
        }

        tracing::info!(count = articles.len(), "knowledge base loaded");
        Ok(Self { articles })
    }

    pub fn len(&self) -> usize {
        self.articles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.articles.is_empty()
    }

    /// Top articles by query-token overlap, with an excerpt around the
    /// densest region of the body.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let query_tokens = tokenize(query);
        if query_tokens.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<SearchHit> = self
            .articles
            .iter()
            .filter_map(|article| {
                let matched = query_tokens
                    .iter()
                    .filter(|qt| article.tokens.iter().any(|t| t == *qt))
                    .count();
                if matched == 0 {
                    return None;
                }
                let score = matched as f32 / query_tokens.len() as f32;
                Some(SearchHit {
                    slug: article.slug.clone(),
                    title: article.title.clone(),
                    score,
                    excerpt: excerpt(&article.body, &query_tokens),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(limit);
        hits
    }
}

/// Pull the paragraph with the most query-token matches, truncated.
fn excerpt(body: &str, query_tokens: &[String]) -> String {
    let best = body
        .split("\n\n")
        .max_by_key(|para| {
            let para_tokens = tokenize(para);
            query_tokens
                .iter()
                .filter(|qt| para_tokens.iter().any(|t| t == *qt))
                .count()
        })
        .unwrap_or(body);

    let mut excerpt: String = best.chars().take(EXCERPT_MAX_CHARS).collect();
    if best.chars().count() > EXCERPT_MAX_CHARS {
        excerpt.push_str("...");
    }
    excerpt
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kb(files: &[(&str, &str)]) -> KnowledgeBase {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            std::fs::write(dir.path().join(format!("{name}.md")), body).unwrap();
        }
        KnowledgeBase::load(dir.path()).unwrap()
    }

    #[test]
    fn search_ranks_by_overlap() {
        let kb = kb(&[
            (
                "queues",
                "# Working with queues\n\nQueues hold documents awaiting review.",
            ),
            (
                "schemas",
                "# Schema reference\n\nSchemas define the datapoint tree for a queue.",
            ),
            ("hooks", "# Hooks\n\nHooks run custom code on events."),
        ]);

        let hits = kb.search("how do queues hold documents", 5);
        assert!(!hits.is_empty());
        assert_eq!(hits[0].slug, "queues");
        assert!(hits[0].excerpt.contains("documents"));
    }

    #[test]
    fn no_match_returns_empty() {
        let kb = kb(&[("misc", "# Misc\n\nNothing relevant here.")]);
        assert!(kb.search("zzzzqqq", 5).is_empty());
        assert!(kb.search("", 5).is_empty());
    }

    #[test]
    fn limit_is_respected() {
        let kb = kb(&[
            ("a", "# A\n\nqueue queue queue"),
            ("b", "# B\n\nqueue things"),
            ("c", "# C\n\nqueue stuff"),
        ]);
        assert_eq!(kb.search("queue", 2).len(), 2);
    }
}
