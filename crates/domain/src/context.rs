//! Transient per-request context state produced by the context builder.

use serde::Serialize;

use crate::fragment::Fragment;
use crate::story::Story;

/// Everything a single generation request knows about its story, split
/// the way the prompt needs it: windowed prose, sticky fragments in
/// full, everything else as one-line shortlist entries.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextState {
    pub story: Story,
    pub prose_fragments: Vec<Fragment>,
    pub sticky_guidelines: Vec<Fragment>,
    pub sticky_knowledge: Vec<Fragment>,
    pub sticky_characters: Vec<Fragment>,
    pub guideline_shortlist: Vec<String>,
    pub knowledge_shortlist: Vec<String>,
    pub character_shortlist: Vec<String>,
    /// Sticky fragments with `placement = system`, any kind.
    pub system_prompt_fragments: Vec<Fragment>,
    pub author_input: String,
}

/// One-line shortlist entry for a non-sticky fragment.
pub fn shortlist_entry(f: &Fragment) -> String {
    format!("{}: {} — {}", f.id, f.name, f.description)
}

/// Options threaded from the pipeline into the context builder.
#[derive(Debug, Clone, Default)]
pub struct ContextOptions {
    /// Start the prose window strictly before this fragment.
    pub prose_before_fragment_id: Option<String>,
    /// Suppress the rolling summary when the window starts before this
    /// fragment (the summary describes prose the window no longer ends at).
    pub summary_before_fragment_id: Option<String>,
}
