//! Session-index helpers
//!
//! Session documents live under the `sessions2-*` wildcard; lookups by id
//! go through a search so the concrete index comes back with the hit, and
//! mutations (tags, hunt marks) are scripted appends so concurrent writers
//! are both preserved.

use anyhow::Result;
use serde_json::{json, Value};
use std::collections::HashMap;

use super::types::{Lookup, Session, LOOKUPS_INDEX, SESSIONS_INDEX};
use super::{Db, Doc};

impl Db {
    /// Shortcut tables visible to a user (own plus shared), keyed by name
    /// for expression `$name` substitution.
    pub async fn lookup_tables(&self, user_id: &str) -> Result<HashMap<String, Vec<String>>> {
        let result = self
            .search::<Lookup>(
                LOOKUPS_INDEX,
                &json!({
                    "query": { "bool": { "should": [
                        { "term": { "userId": user_id } },
                        { "term": { "shared": true } }
                    ], "minimum_should_match": 1 } },
                    "size": 1000,
                }),
                None,
            )
            .await?;
        Ok(result
            .hits
            .into_iter()
            .map(|d| (d.source.name, d.source.values))
            .collect())
    }

    /// Fetch one session by id across the wildcard index.
    pub async fn session_get(&self, session_id: &str) -> Result<Option<Doc<Session>>> {
        let query = json!({
            "query": { "ids": { "values": [session_id] } },
            "size": 1,
        });
        let mut result = self.search::<Session>(SESSIONS_INDEX, &query, None).await?;
        Ok(result.hits.pop())
    }

    /// Fetch one session with a narrowed `_source`.
    pub async fn session_get_fields(
        &self,
        session_id: &str,
        fields: &[&str],
    ) -> Result<Option<Doc<Session>>> {
        let query = json!({
            "query": { "ids": { "values": [session_id] } },
            "_source": fields,
            "size": 1,
        });
        let mut result = self.search::<Session>(SESSIONS_INDEX, &query, None).await?;
        Ok(result.hits.pop())
    }

    /// Append tags to a session, deduplicating against tags already present.
    /// Concurrent appends from cron and users are both preserved.
    pub async fn add_tags_to_session(
        &self,
        index: &str,
        session_id: &str,
        tags: &[String],
    ) -> Result<()> {
        let script = json!({
            "source": "if (ctx._source.tags == null) { ctx._source.tags = params.tags.stream().distinct().collect(Collectors.toList()); } else { for (tag in params.tags) { if (!ctx._source.tags.contains(tag)) { ctx._source.tags.add(tag); } } }",
            "lang": "painless",
            "params": { "tags": tags },
        });
        self.script_update(index, session_id, &script, false).await
    }

    /// Mark a session as matched by a hunt: appends to both huntId and
    /// huntName, skipping ids already present.
    pub async fn add_hunt_to_session(
        &self,
        index: &str,
        session_id: &str,
        hunt_id: &str,
        hunt_name: &str,
    ) -> Result<()> {
        let script = json!({
            "source": "if (ctx._source.huntId == null) { ctx._source.huntId = [params.id]; ctx._source.huntName = [params.name]; } else if (!ctx._source.huntId.contains(params.id)) { ctx._source.huntId.add(params.id); ctx._source.huntName.add(params.name); }",
            "lang": "painless",
            "params": { "id": hunt_id, "name": hunt_name },
        });
        self.script_update(index, session_id, &script, false).await
    }

    /// Delete a session document (scrub policy `spi` / `all`).
    pub async fn session_delete(&self, index: &str, session_id: &str) -> Result<()> {
        self.delete_doc(index, session_id, true).await
    }
}

/// Build the body for a session scroll: caller-supplied filter clauses,
/// ascending lastPacket order, narrowed `_source`.
pub fn scroll_body(filters: Vec<Value>, source: &[&str], page_size: u64) -> Value {
    json!({
        "query": { "bool": { "filter": filters } },
        "sort": [ { "lastPacket": { "order": "asc" } } ],
        "_source": source,
        "size": page_size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scroll_body_shape() {
        let body = scroll_body(
            vec![json!({"term": {"node": "cap01"}})],
            &["lastPacket", "node"],
            100,
        );
        assert_eq!(body["size"], 100);
        assert_eq!(body["sort"][0]["lastPacket"]["order"], "asc");
        assert_eq!(body["_source"][0], "lastPacket");
        assert_eq!(body["query"]["bool"]["filter"][0]["term"]["node"], "cap01");
    }
}
