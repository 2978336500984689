//! Key construction for the persisted namespace.
//!
//! Kept in one place so the layout documented in lib.rs cannot drift.

pub fn chat(chat_id: &str) -> String {
    format!("chat:{chat_id}")
}

pub fn chat_msgs(chat_id: &str) -> String {
    format!("chat:{chat_id}:msgs")
}

pub fn chat_commits(chat_id: &str) -> String {
    format!("chat:{chat_id}:commits")
}

pub fn commit(hash: &str) -> String {
    format!("commit:{hash}")
}

pub fn commit_index(environment: &str) -> String {
    format!("commits:{environment}")
}

pub fn commit_latest(environment: &str) -> String {
    format!("commit_latest:{environment}")
}

pub fn snapshot(entity_type: &str, entity_id: &str, commit_hash: &str) -> String {
    format!("snap:{entity_type}:{entity_id}:{commit_hash}")
}

pub fn read_cache(chat_id: &str, entity_type: &str, entity_id: &str) -> String {
    format!("cache:{chat_id}:{entity_type}:{entity_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_documented_namespace() {
        assert_eq!(chat("c1"), "chat:c1");
        assert_eq!(chat_msgs("c1"), "chat:c1:msgs");
        assert_eq!(chat_commits("c1"), "chat:c1:commits");
        assert_eq!(commit("abc123"), "commit:abc123");
        assert_eq!(snapshot("schema", "77", "abc123"), "snap:schema:77:abc123");
        assert_eq!(read_cache("c1", "queue", "9"), "cache:c1:queue:9");
    }
}
