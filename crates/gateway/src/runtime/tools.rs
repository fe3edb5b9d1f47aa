//! Tool registry — fragment read/write tools exposed to agents.
//!
//! Read tools are always available; write tools only when the tool set
//! is not read-only (the librarian gets them, the writer does not).
//! Tool failures are returned as error-flagged results for the model,
//! never raised.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value};

use quill_domain::fragment::KINDS;
use quill_domain::tool::ToolDefinition;
use quill_store::fragments::{NewFragment, VersionedPatch};
use quill_store::FragmentStore;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ToolSet
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ToolSet {
    fragments: Arc<FragmentStore>,
    story_id: String,
    read_only: bool,
}

impl ToolSet {
    pub fn new(fragments: Arc<FragmentStore>, story_id: impl Into<String>, read_only: bool) -> Self {
        Self { fragments, story_id: story_id.into(), read_only }
    }

    // ── Definitions ───────────────────────────────────────────────

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs = vec![
            ToolDefinition {
                name: "getFragment".into(),
                description: "Fetch a fragment by id, including its full content.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "id": { "type": "string", "description": "Fragment id, e.g. 'ch-a1b2c3'" }
                    },
                    "required": ["id"]
                }),
            },
            ToolDefinition {
                name: "listFragments".into(),
                description: "List fragment summaries, optionally filtered by type.".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "description": "Fragment type filter" },
                        "includeArchived": { "type": "boolean" }
                    }
                }),
            },
            ToolDefinition {
                name: "searchFragments".into(),
                description: "Case-insensitive substring search over fragment content. \
                              Returns matches with an excerpt around the first hit."
                    .into(),
                parameters: json!({
                    "type": "object",
                    "properties": {
                        "q": { "type": "string", "description": "Text to search for" },
                        "type": { "type": "string", "description": "Fragment type filter" }
                    },
                    "required": ["q"]
                }),
            },
            ToolDefinition {
                name: "listFragmentTypes".into(),
                description: "List the registered fragment types and their id prefixes.".into(),
                parameters: json!({ "type": "object", "properties": {} }),
            },
        ];

        // Per-type aliases: getCharacter / listCharacters, etc.
        for kind in KINDS {
            let capitalized = capitalize(kind.name);
            defs.push(ToolDefinition {
                name: format!("get{capitalized}"),
                description: format!("Fetch a {} fragment by id.", kind.name),
                parameters: json!({
                    "type": "object",
                    "properties": { "id": { "type": "string" } },
                    "required": ["id"]
                }),
            });
            defs.push(ToolDefinition {
                name: format!("list{capitalized}s"),
                description: format!("List {} fragment summaries.", kind.name),
                parameters: json!({ "type": "object", "properties": {} }),
            });
        }

        if !self.read_only {
            defs.extend([
                ToolDefinition {
                    name: "createFragment".into(),
                    description: "Create a new fragment.".into(),
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "type": { "type": "string", "description": "Fragment type" },
                            "name": { "type": "string" },
                            "description": { "type": "string" },
                            "content": { "type": "string" },
                            "sticky": { "type": "boolean" },
                            "tags": { "type": "array", "items": { "type": "string" } }
                        },
                        "required": ["type", "name"]
                    }),
                },
                ToolDefinition {
                    name: "updateFragment".into(),
                    description: "Replace a fragment's name, description or content. \
                                  The previous state is kept as a version snapshot."
                        .into(),
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "name": { "type": "string" },
                            "description": { "type": "string" },
                            "content": { "type": "string" }
                        },
                        "required": ["id"]
                    }),
                },
                ToolDefinition {
                    name: "editFragment".into(),
                    description: "Replace the first occurrence of oldText in a fragment's \
                                  content. Fails when oldText is not found."
                        .into(),
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "id": { "type": "string" },
                            "oldText": { "type": "string" },
                            "newText": { "type": "string" }
                        },
                        "required": ["id", "oldText", "newText"]
                    }),
                },
                ToolDefinition {
                    name: "editProse".into(),
                    description: "Replace the first occurrence of oldText in every active \
                                  prose fragment that contains it. Fails when nothing matches."
                        .into(),
                    parameters: json!({
                        "type": "object",
                        "properties": {
                            "oldText": { "type": "string" },
                            "newText": { "type": "string" }
                        },
                        "required": ["oldText", "newText"]
                    }),
                },
                ToolDefinition {
                    name: "deleteFragment".into(),
                    description: "Permanently delete a fragment.".into(),
                    parameters: json!({
                        "type": "object",
                        "properties": { "id": { "type": "string" } },
                        "required": ["id"]
                    }),
                },
            ]);
        }

        defs
    }

    // ── Dispatch ──────────────────────────────────────────────────

    /// Execute a tool call. Returns `(result, is_error)`; errors are
    /// payloads for the model, not exceptions.
    pub fn dispatch(&self, name: &str, args: &Value) -> (Value, bool) {
        // Per-type aliases resolve onto the canonical tools.
        for kind in KINDS {
            let capitalized = capitalize(kind.name);
            if name == format!("get{capitalized}") {
                return self.get_fragment(args, Some(kind.name));
            }
            if name == format!("list{capitalized}s") {
                return self.list_fragments(&json!({ "type": kind.name }));
            }
        }

        match name {
            "getFragment" => self.get_fragment(args, None),
            "listFragments" => self.list_fragments(args),
            "searchFragments" => self.search_fragments(args),
            "listFragmentTypes" => (
                json!(KINDS
                    .iter()
                    .map(|k| json!({ "type": k.name, "prefix": k.prefix }))
                    .collect::<Vec<_>>()),
                false,
            ),
            "createFragment" | "updateFragment" | "editFragment" | "editProse"
            | "deleteFragment"
                if self.read_only =>
            {
                err(format!("tool {name} is not available in read-only mode"))
            }
            "createFragment" => self.create_fragment(args),
            "updateFragment" => self.update_fragment(args),
            "editFragment" => self.edit_fragment(args),
            "editProse" => self.edit_prose(args),
            "deleteFragment" => self.delete_fragment(args),
            other => err(format!("unknown tool: {other}")),
        }
    }

    fn get_fragment(&self, args: &Value, expect_kind: Option<&str>) -> (Value, bool) {
        let Some(id) = args.get("id").and_then(|v| v.as_str()) else {
            return err("missing required argument: id");
        };
        match self.fragments.get(&self.story_id, id) {
            Some(fragment) => {
                if let Some(kind) = expect_kind {
                    if fragment.kind != kind {
                        return err(format!("{id} is a {} fragment, not {kind}", fragment.kind));
                    }
                }
                (json!(fragment), false)
            }
            None => err(format!("fragment not found: {id}")),
        }
    }

    fn list_fragments(&self, args: &Value) -> (Value, bool) {
        let kind = args.get("type").and_then(|v| v.as_str());
        let include_archived = args
            .get("includeArchived")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        match self
            .fragments
            .list_summaries(&self.story_id, kind, include_archived)
        {
            Ok(summaries) => (json!(summaries), false),
            Err(e) => err(e.to_string()),
        }
    }

    fn search_fragments(&self, args: &Value) -> (Value, bool) {
        let Some(q) = args.get("q").and_then(|v| v.as_str()) else {
            return err("missing required argument: q");
        };
        if q.is_empty() {
            return err("search query must not be empty");
        }
        let kind = args.get("type").and_then(|v| v.as_str());

        let fragments = match self.fragments.list_fragments(&self.story_id, kind, false) {
            Ok(fragments) => fragments,
            Err(e) => return err(e.to_string()),
        };

        let hits: Vec<Value> = fragments
            .iter()
            .filter_map(|f| {
                find_ci(&f.content, q).map(|at| {
                    json!({ "id": f.id, "excerpt": excerpt(&f.content, at, q.chars().count()) })
                })
            })
            .collect();
        (json!(hits), false)
    }

    fn create_fragment(&self, args: &Value) -> (Value, bool) {
        #[derive(Deserialize)]
        struct Args {
            #[serde(rename = "type")]
            kind: String,
            name: String,
            #[serde(default)]
            description: String,
            #[serde(default)]
            content: String,
            #[serde(default)]
            sticky: bool,
            #[serde(default)]
            tags: Vec<String>,
        }
        let args: Args = match serde_json::from_value(args.clone()) {
            Ok(args) => args,
            Err(e) => return err(format!("invalid arguments: {e}")),
        };
        match self.fragments.create(
            &self.story_id,
            NewFragment {
                kind: args.kind,
                name: args.name,
                description: args.description,
                content: args.content,
                sticky: args.sticky,
                tags: args.tags,
                ..Default::default()
            },
        ) {
            Ok(fragment) => (json!({ "id": fragment.id, "type": fragment.kind }), false),
            Err(e) => err(e.to_string()),
        }
    }

    fn update_fragment(&self, args: &Value) -> (Value, bool) {
        #[derive(Deserialize)]
        struct Args {
            id: String,
            name: Option<String>,
            description: Option<String>,
            content: Option<String>,
        }
        let args: Args = match serde_json::from_value(args.clone()) {
            Ok(args) => args,
            Err(e) => return err(format!("invalid arguments: {e}")),
        };
        match self.fragments.update_versioned(
            &self.story_id,
            &args.id,
            VersionedPatch {
                name: args.name,
                description: args.description,
                content: args.content,
                expected_version: None,
            },
        ) {
            Ok(fragment) => (json!({ "id": fragment.id, "version": fragment.version }), false),
            Err(e) => err(e.to_string()),
        }
    }

    fn edit_fragment(&self, args: &Value) -> (Value, bool) {
        #[derive(Deserialize)]
        struct Args {
            id: String,
            #[serde(rename = "oldText")]
            old_text: String,
            #[serde(rename = "newText")]
            new_text: String,
        }
        let args: Args = match serde_json::from_value(args.clone()) {
            Ok(args) => args,
            Err(e) => return err(format!("invalid arguments: {e}")),
        };

        let Some(fragment) = self.fragments.get(&self.story_id, &args.id) else {
            return err(format!("fragment not found: {}", args.id));
        };
        if !fragment.content.contains(&args.old_text) {
            return err(format!("oldText not found in {}", args.id));
        }
        let content = fragment.content.replacen(&args.old_text, &args.new_text, 1);
        match self.fragments.update_versioned(
            &self.story_id,
            &args.id,
            VersionedPatch { content: Some(content), ..Default::default() },
        ) {
            Ok(fragment) => (json!({ "id": fragment.id, "version": fragment.version }), false),
            Err(e) => err(e.to_string()),
        }
    }

    fn edit_prose(&self, args: &Value) -> (Value, bool) {
        #[derive(Deserialize)]
        struct Args {
            #[serde(rename = "oldText")]
            old_text: String,
            #[serde(rename = "newText")]
            new_text: String,
        }
        let args: Args = match serde_json::from_value(args.clone()) {
            Ok(args) => args,
            Err(e) => return err(format!("invalid arguments: {e}")),
        };

        let prose = match self.fragments.list_fragments(&self.story_id, Some("prose"), false) {
            Ok(prose) => prose,
            Err(e) => return err(e.to_string()),
        };

        let mut edited = Vec::new();
        for fragment in prose {
            if !fragment.content.contains(&args.old_text) {
                continue;
            }
            let content = fragment.content.replacen(&args.old_text, &args.new_text, 1);
            match self.fragments.update_versioned(
                &self.story_id,
                &fragment.id,
                VersionedPatch { content: Some(content), ..Default::default() },
            ) {
                Ok(_) => edited.push(fragment.id),
                Err(e) => return err(e.to_string()),
            }
        }
        if edited.is_empty() {
            return err("oldText not found in any active prose fragment");
        }
        (json!({ "edited": edited }), false)
    }

    fn delete_fragment(&self, args: &Value) -> (Value, bool) {
        let Some(id) = args.get("id").and_then(|v| v.as_str()) else {
            return err("missing required argument: id");
        };
        match self.fragments.delete(&self.story_id, id) {
            Ok(()) => (json!({ "deleted": id }), false),
            Err(e) => err(e.to_string()),
        }
    }
}

fn err(message: impl Into<String>) -> (Value, bool) {
    (json!({ "error": message.into() }), true)
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Search helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Case-insensitive substring search; returns the char index of the
/// first match.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let h: Vec<char> = haystack.chars().collect();
    let n: Vec<char> = needle.chars().collect();
    if n.is_empty() || h.len() < n.len() {
        return None;
    }
    (0..=h.len() - n.len()).find(|&i| {
        h[i..i + n.len()]
            .iter()
            .zip(&n)
            .all(|(a, b)| a.to_lowercase().eq(b.to_lowercase()))
    })
}

/// ±80 chars of context around the match.
fn excerpt(content: &str, match_at: usize, match_len: usize) -> String {
    const WINDOW: usize = 80;
    let chars: Vec<char> = content.chars().collect();
    let start = match_at.saturating_sub(WINDOW);
    let end = (match_at + match_len + WINDOW).min(chars.len());
    chars[start..end].iter().collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
