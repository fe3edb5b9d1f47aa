//! Instruction registry — named default prompt strings with
//! model-matching overrides.
//!
//! Overrides load from a directory of JSON documents:
//! `{name, modelMatch, priority (default 100), instructions: {key: text}}`.
//! `modelMatch` is an exact model id or a `/pattern/flags` regex.
//! Resolution scans overrides in ascending priority; the first set whose
//! pattern matches the active model and defines the key wins, otherwise
//! the built-in default is returned.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde::Deserialize;

use quill_domain::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const WRITER_SYSTEM: &str = "writer.system";
pub const WRITER_TOOL_SUFFIX: &str = "writer.tool_suffix";
pub const WRITER_REFINE: &str = "writer.refine";
pub const WRITER_REGENERATE: &str = "writer.regenerate";
pub const OUTPUT_PLAINTEXT: &str = "output.plaintext";
pub const OUTPUT_MARKDOWN: &str = "output.markdown";
pub const LIBRARIAN_ANALYSIS: &str = "librarian.analysis";
pub const SUGGEST_DIRECTIONS: &str = "suggest.directions";

fn builtin_defaults() -> HashMap<&'static str, &'static str> {
    HashMap::from([
        (
            WRITER_SYSTEM,
            "You are a fiction co-writer. Continue the story in the established voice \
             and tense. Write prose only: no headings, no commentary, no summaries of \
             what you wrote. Stay consistent with every character, guideline and \
             knowledge entry provided.",
        ),
        (
            WRITER_TOOL_SUFFIX,
            "You can look up story material with the provided tools. Shortlisted \
             entries show only a one-line summary; fetch the full fragment before \
             relying on details from it.",
        ),
        (
            WRITER_REFINE,
            "Rewrite the passage provided below according to the author's \
             instructions. Preserve events and continuity unless the instructions \
             say otherwise. Return only the rewritten passage.",
        ),
        (
            WRITER_REGENERATE,
            "Write a replacement for the passage that previously followed this \
             context. Produce a fresh take; do not repeat the old wording.",
        ),
        (OUTPUT_PLAINTEXT, "Write plain prose paragraphs without any markup."),
        (OUTPUT_MARKDOWN, "Markdown is allowed for emphasis and scene breaks."),
        (
            LIBRARIAN_ANALYSIS,
            "You are the story librarian. Analyze the newest passage against the \
             existing corpus. Use the tools to inspect and correct fragments where \
             the text contradicts them. Then respond with a single JSON object: \
             {\"summaryUpdate\": string, \"mentions\": [{\"fragmentId\": string?, \
             \"name\": string}], \"contradictions\": [{\"description\": string, \
             \"fragmentIds\": [string]}], \"knowledgeSuggestions\": [{\"name\": \
             string, \"description\": string, \"content\": string}], \
             \"timelineEvents\": [{\"title\": string, \"description\": string}]}.",
        ),
        (
            SUGGEST_DIRECTIONS,
            "Suggest distinct directions the next passage could take. Respond with \
             a single JSON array of {\"pacing\": string, \"title\": string, \
             \"description\": string, \"instruction\": string} objects and nothing \
             else.",
        ),
    ])
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Override sets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub enum ModelMatch {
    Exact(String),
    Pattern(regex::Regex),
}

impl ModelMatch {
    /// Parse from an exact string or a `/pattern/flags` delimited regex
    /// (only the `i` flag is honored).
    pub fn parse(raw: &str) -> Result<Self> {
        if let Some(rest) = raw.strip_prefix('/') {
            let Some(end) = rest.rfind('/') else {
                return Err(Error::Validation(format!("unterminated regex: {raw}")));
            };
            let (pattern, flags) = rest.split_at(end);
            let flags = &flags[1..];
            let regex = regex::RegexBuilder::new(pattern)
                .case_insensitive(flags.contains('i'))
                .build()
                .map_err(|e| Error::Validation(format!("bad modelMatch regex: {e}")))?;
            Ok(Self::Pattern(regex))
        } else {
            Ok(Self::Exact(raw.to_string()))
        }
    }

    pub fn matches(&self, model: &str) -> bool {
        match self {
            Self::Exact(s) => s == model,
            Self::Pattern(re) => re.is_match(model),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InstructionSet {
    pub name: String,
    pub model_match: ModelMatch,
    pub priority: i32,
    pub instructions: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstructionSetFile {
    name: String,
    model_match: String,
    #[serde(default = "d_priority")]
    priority: i32,
    instructions: HashMap<String, String>,
}

fn d_priority() -> i32 {
    100
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct InstructionRegistry {
    defaults: HashMap<&'static str, &'static str>,
    dir: PathBuf,
    /// Sorted by ascending priority. Loaded at boot and on reload;
    /// resolve only ever takes the read side.
    overrides: RwLock<Vec<InstructionSet>>,
}

impl InstructionRegistry {
    /// Build the registry and load overrides from `dir` (missing
    /// directory means no overrides).
    pub fn load(dir: impl Into<PathBuf>) -> Self {
        let registry = Self {
            defaults: builtin_defaults(),
            dir: dir.into(),
            overrides: RwLock::new(Vec::new()),
        };
        registry.reload();
        registry
    }

    /// Re-scan the override directory. Malformed files are logged and
    /// skipped.
    pub fn reload(&self) -> usize {
        let mut sets = Vec::new();
        if let Ok(read_dir) = std::fs::read_dir(&self.dir) {
            for entry in read_dir.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let raw = match std::fs::read_to_string(&path) {
                    Ok(raw) => raw,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "unreadable instruction set");
                        continue;
                    }
                };
                let parsed: InstructionSetFile = match serde_json::from_str(&raw) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "malformed instruction set skipped");
                        continue;
                    }
                };
                let model_match = match ModelMatch::parse(&parsed.model_match) {
                    Ok(m) => m,
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "instruction set skipped");
                        continue;
                    }
                };
                sets.push(InstructionSet {
                    name: parsed.name,
                    model_match,
                    priority: parsed.priority,
                    instructions: parsed.instructions,
                });
            }
        }
        sets.sort_by_key(|s| s.priority);
        let count = sets.len();
        tracing::info!(sets = count, dir = %self.dir.display(), "instruction overrides loaded");
        *self.overrides.write() = sets;
        count
    }

    /// Resolve an instruction for a model. Unknown keys fail.
    pub fn resolve(&self, key: &str, model: &str) -> Result<String> {
        let default = self
            .defaults
            .get(key)
            .ok_or_else(|| Error::UnknownInstruction(key.to_string()))?;

        let overrides = self.overrides.read();
        for set in overrides.iter() {
            if set.model_match.matches(model) {
                if let Some(text) = set.instructions.get(key) {
                    return Ok(text.clone());
                }
            }
        }
        Ok((*default).to_string())
    }

    pub fn default_keys(&self) -> Vec<&'static str> {
        let mut keys: Vec<_> = self.defaults.keys().copied().collect();
        keys.sort_unstable();
        keys
    }

    /// Drop loaded overrides (tests).
    pub fn clear(&self) {
        self.overrides.write().clear();
    }
}
