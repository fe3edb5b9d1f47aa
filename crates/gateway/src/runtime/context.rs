//! Context builder — turns a story's corpus into a [`ContextState`].
//!
//! Prose is windowed from the end of the chain backward under the
//! story's context limit; at least one prose fragment is always
//! included when any exists. Character/guideline/knowledge fragments
//! split into sticky (full content) and shortlist (one-line) groups.

use quill_domain::context::{shortlist_entry, ContextOptions, ContextState};
use quill_domain::fragment::{Fragment, Placement};
use quill_domain::story::{estimate_tokens, ContextLimit, ContextLimitMode};
use quill_domain::Result;
use quill_store::{FragmentStore, StoryStore};

/// Build the context state for one request.
pub fn build_context(
    stories: &StoryStore,
    fragments: &FragmentStore,
    story_id: &str,
    author_input: &str,
    opts: &ContextOptions,
) -> Result<ContextState> {
    let mut story = stories.require(story_id)?;
    let all = fragments.list_fragments(story_id, None, false)?;

    let mut prose = Vec::new();
    let mut characters = Vec::new();
    let mut guidelines = Vec::new();
    let mut knowledge = Vec::new();
    for fragment in all {
        match fragment.kind.as_str() {
            "prose" => prose.push(fragment),
            "character" => characters.push(fragment),
            "guideline" => guidelines.push(fragment),
            "knowledge" => knowledge.push(fragment),
            other => {
                tracing::debug!(kind = other, id = %fragment.id, "fragment kind not used in context");
            }
        }
    }
    prose.sort_by(|a, b| {
        a.order
            .cmp(&b.order)
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    let prose_fragments = prose_window(
        &prose,
        &story.settings.context_limit,
        opts.prose_before_fragment_id.as_deref(),
    );

    // The rolling summary covers the whole chain; when the window is
    // gated to before a fragment it would describe text the model is
    // about to rewrite, so it is suppressed.
    if opts.summary_before_fragment_id.is_some() {
        story.summary.clear();
    }

    let (sticky_characters, character_shortlist, system_characters) = sticky_split(characters);
    let (sticky_guidelines, guideline_shortlist, system_guidelines) = sticky_split(guidelines);
    let (sticky_knowledge, knowledge_shortlist, system_knowledge) = sticky_split(knowledge);

    let mut system_prompt_fragments = system_guidelines;
    system_prompt_fragments.extend(system_knowledge);
    system_prompt_fragments.extend(system_characters);

    Ok(ContextState {
        story,
        prose_fragments,
        sticky_guidelines,
        sticky_knowledge,
        sticky_characters,
        guideline_shortlist,
        knowledge_shortlist,
        character_shortlist,
        system_prompt_fragments,
        author_input: author_input.to_string(),
    })
}

/// Split one kind into (sticky user-placed, shortlist lines, sticky
/// system-placed).
fn sticky_split(fragments: Vec<Fragment>) -> (Vec<Fragment>, Vec<String>, Vec<Fragment>) {
    let mut sticky = Vec::new();
    let mut shortlist = Vec::new();
    let mut system = Vec::new();
    for fragment in fragments {
        if !fragment.sticky {
            shortlist.push(shortlist_entry(&fragment));
        } else if fragment.placement == Placement::System {
            system.push(fragment);
        } else {
            sticky.push(fragment);
        }
    }
    (sticky, shortlist, system)
}

/// Scan the prose chain from the end backward, including fragments
/// until the budget is exceeded; the most recent candidate is always
/// included. `before` starts the scan strictly before that fragment.
fn prose_window(prose: &[Fragment], limit: &ContextLimit, before: Option<&str>) -> Vec<Fragment> {
    let candidates: &[Fragment] = match before {
        Some(target) => match prose.iter().position(|f| f.id == target) {
            Some(idx) => &prose[..idx],
            None => prose,
        },
        None => prose,
    };

    let mut window: Vec<Fragment> = Vec::new();
    let mut spent: u64 = 0;
    for fragment in candidates.iter().rev() {
        let cost = match limit.mode {
            ContextLimitMode::Fragments => 1,
            ContextLimitMode::Tokens => estimate_tokens(&fragment.content),
            ContextLimitMode::Characters => fragment.content.chars().count() as u64,
        };
        if !window.is_empty() && spent + cost > limit.value {
            break;
        }
        spent += cost;
        window.push(fragment.clone());
    }
    window.reverse();
    window
}
