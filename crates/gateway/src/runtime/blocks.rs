//! Block engine — merges builtin blocks with a story's block
//! configuration into the final ordered block list.
//!
//! Pass order matters and is part of the contract:
//! 1. materialize enabled custom blocks (scripts evaluated here),
//! 2. apply content modes from overrides,
//! 3. assign positions from `blockOrder`,
//! 4. apply per-id order overrides,
//! 5. drop blocks disabled by an override.
//! Final sort: `system` before `user`, ascending order within a role,
//! insertion order on ties.

use quill_domain::blocks::{
    BlockConfig, BlockRole, BlockSource, ContentMode, ContextBlock, CustomBlockKind,
};

use super::script::{eval_script_block, ScriptEnv};

/// Apply a story's block configuration to the builtin blocks.
pub fn apply_block_config(
    defaults: Vec<ContextBlock>,
    config: &BlockConfig,
    script_env: &ScriptEnv,
) -> Vec<ContextBlock> {
    let mut blocks = defaults;

    // ── 1. Custom blocks ──────────────────────────────────────────
    for def in &config.custom_blocks {
        if !def.enabled {
            continue;
        }
        let content = match def.kind {
            CustomBlockKind::Simple => def.content.clone(),
            CustomBlockKind::Script => match eval_script_block(&def.content, script_env) {
                Ok(content) if content.is_empty() => continue, // empty result drops the block
                Ok(content) => content,
                Err(msg) => {
                    tracing::debug!(block = %def.name, error = %msg, "script block failed");
                    format!("[Script error in \"{}\": {}]", def.name, msg)
                }
            },
        };
        blocks.push(ContextBlock {
            id: def.id.clone(),
            role: def.role,
            content,
            order: def.order,
            source: BlockSource::Custom,
            name: Some(def.name.clone()),
        });
    }

    // ── 2. Content modes ──────────────────────────────────────────
    for block in blocks.iter_mut() {
        let Some(ov) = config.overrides.get(&block.id) else {
            continue;
        };
        if let (Some(mode), Some(custom)) = (ov.content_mode, ov.custom_content.as_ref()) {
            block.content = match mode {
                ContentMode::Override => custom.clone(),
                ContentMode::Prepend => format!("{custom}\n{}", block.content),
                ContentMode::Append => format!("{}\n{custom}", block.content),
            };
        }
    }

    // ── 3. blockOrder positions ───────────────────────────────────
    if !config.block_order.is_empty() {
        for block in blocks.iter_mut() {
            if let Some(pos) = config.block_order.iter().position(|id| *id == block.id) {
                block.order = pos as i64;
            }
        }
    }

    // ── 4. Per-id order overrides ─────────────────────────────────
    for block in blocks.iter_mut() {
        if let Some(order) = config.overrides.get(&block.id).and_then(|ov| ov.order) {
            block.order = order;
        }
    }

    // ── 5. Disabled blocks ────────────────────────────────────────
    blocks.retain(|block| {
        config
            .overrides
            .get(&block.id)
            .and_then(|ov| ov.enabled)
            .unwrap_or(true)
    });

    sort_blocks(&mut blocks);
    blocks
}

/// Role groups `system` before `user`; ascending order within a role;
/// stable on ties (insertion order).
pub fn sort_blocks(blocks: &mut [ContextBlock]) {
    blocks.sort_by(|a, b| {
        role_rank(a.role)
            .cmp(&role_rank(b.role))
            .then(a.order.cmp(&b.order))
    });
}

fn role_rank(role: BlockRole) -> u8 {
    match role {
        BlockRole::System => 0,
        BlockRole::User => 1,
    }
}

/// Concatenate one role's blocks into a message body.
pub fn concat_role(blocks: &[ContextBlock], role: BlockRole) -> String {
    blocks
        .iter()
        .filter(|b| b.role == role && !b.content.is_empty())
        .map(|b| b.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_domain::blocks::{BlockOverride, CustomBlockDefinition};
    use quill_domain::context::ContextState;
    use quill_domain::story::Story;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn builtin(id: &str, role: BlockRole, order: i64, content: &str) -> ContextBlock {
        ContextBlock {
            id: id.into(),
            role,
            content: content.into(),
            order,
            source: BlockSource::Builtin,
            name: None,
        }
    }

    fn script_env() -> (tempfile::TempDir, ScriptEnv) {
        let dir = tempfile::tempdir().unwrap();
        let fragments = Arc::new(quill_store::FragmentStore::new(dir.path()));
        let context = ContextState {
            story: Story::new("Voyage"),
            prose_fragments: Vec::new(),
            sticky_guidelines: Vec::new(),
            sticky_knowledge: Vec::new(),
            sticky_characters: Vec::new(),
            guideline_shortlist: Vec::new(),
            knowledge_shortlist: Vec::new(),
            character_shortlist: Vec::new(),
            system_prompt_fragments: Vec::new(),
            author_input: String::new(),
        };
        let env = ScriptEnv::new(&context, None, fragments);
        (dir, env)
    }

    fn custom(id: &str, name: &str, kind: CustomBlockKind, content: &str) -> CustomBlockDefinition {
        CustomBlockDefinition {
            id: id.into(),
            name: name.into(),
            role: BlockRole::User,
            order: 50,
            enabled: true,
            kind,
            content: content.into(),
        }
    }

    #[test]
    fn simple_custom_block_is_verbatim() {
        let (_dir, env) = script_env();
        let mut config = BlockConfig::default();
        config
            .custom_blocks
            .push(custom("cb-aa11", "lore", CustomBlockKind::Simple, "extra lore"));

        let out = apply_block_config(vec![], &config, &env);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].content, "extra lore");
        assert_eq!(out[0].source, BlockSource::Custom);
        assert_eq!(out[0].name.as_deref(), Some("lore"));
    }

    #[test]
    fn script_error_becomes_visible_block() {
        let (_dir, env) = script_env();
        let mut config = BlockConfig::default();
        config.custom_blocks.push(custom(
            "cb-aa11",
            "mood",
            CustomBlockKind::Script,
            r#"throw "boom""#,
        ));

        let out = apply_block_config(vec![], &config, &env);
        assert_eq!(out[0].content, r#"[Script error in "mood": boom]"#);
        assert_eq!(out[0].role, BlockRole::User);
        assert_eq!(out[0].order, 50);
    }

    #[test]
    fn empty_script_result_drops_the_block() {
        let (_dir, env) = script_env();
        let mut config = BlockConfig::default();
        config
            .custom_blocks
            .push(custom("cb-aa11", "quiet", CustomBlockKind::Script, r#""""#));
        assert!(apply_block_config(vec![], &config, &env).is_empty());
    }

    #[test]
    fn non_string_script_result_is_a_deterministic_error_block() {
        let (_dir, env) = script_env();
        let mut config = BlockConfig::default();
        config
            .custom_blocks
            .push(custom("cb-aa11", "n", CustomBlockKind::Script, "41 + 1"));
        let out = apply_block_config(vec![], &config, &env);
        assert_eq!(
            out[0].content,
            r#"[Script error in "n": script returned a non-string value]"#
        );
    }

    #[test]
    fn content_modes() {
        let (_dir, env) = script_env();
        let defaults = vec![
            builtin("a", BlockRole::User, 0, "base-a"),
            builtin("b", BlockRole::User, 1, "base-b"),
            builtin("c", BlockRole::User, 2, "base-c"),
        ];
        let mut config = BlockConfig::default();
        let mut set = |id: &str, mode, text: &str| {
            config.overrides.insert(
                id.into(),
                BlockOverride {
                    content_mode: Some(mode),
                    custom_content: Some(text.into()),
                    ..Default::default()
                },
            );
        };
        set("a", ContentMode::Override, "new-a");
        set("b", ContentMode::Prepend, "pre");
        set("c", ContentMode::Append, "post");

        let out = apply_block_config(defaults, &config, &env);
        assert_eq!(out[0].content, "new-a");
        assert_eq!(out[1].content, "pre\nbase-b");
        assert_eq!(out[2].content, "base-c\npost");
    }

    #[test]
    fn block_order_assigns_positions() {
        let (_dir, env) = script_env();
        let defaults = vec![
            builtin("a", BlockRole::User, 10, "a"),
            builtin("b", BlockRole::User, 20, "b"),
            builtin("c", BlockRole::User, 30, "c"),
        ];
        let mut config = BlockConfig::default();
        config.block_order = vec!["c".into(), "a".into()];

        let out = apply_block_config(defaults, &config, &env);
        let ids: Vec<_> = out.iter().map(|b| b.id.as_str()).collect();
        // c gets order 0, a gets order 1, b keeps 20.
        assert_eq!(ids, vec!["c", "a", "b"]);
        assert_eq!(out[0].order, 0);
        assert_eq!(out[1].order, 1);
    }

    #[test]
    fn order_override_beats_block_order() {
        let (_dir, env) = script_env();
        let defaults = vec![
            builtin("a", BlockRole::User, 10, "a"),
            builtin("b", BlockRole::User, 20, "b"),
        ];
        let mut config = BlockConfig::default();
        config.block_order = vec!["a".into(), "b".into()];
        config
            .overrides
            .insert("a".into(), BlockOverride { order: Some(99), ..Default::default() });

        let out = apply_block_config(defaults, &config, &env);
        let ids: Vec<_> = out.iter().map(|b| b.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn disabled_override_removes_block() {
        let (_dir, env) = script_env();
        let defaults = vec![
            builtin("a", BlockRole::User, 0, "a"),
            builtin("b", BlockRole::User, 1, "b"),
        ];
        let mut config = BlockConfig::default();
        config
            .overrides
            .insert("a".into(), BlockOverride { enabled: Some(false), ..Default::default() });

        let out = apply_block_config(defaults, &config, &env);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].id, "b");
    }

    #[test]
    fn system_blocks_sort_before_user_blocks() {
        let mut blocks = vec![
            builtin("u1", BlockRole::User, 0, "u1"),
            builtin("s1", BlockRole::System, 5, "s1"),
            builtin("u2", BlockRole::User, 0, "u2"),
        ];
        sort_blocks(&mut blocks);
        let ids: Vec<_> = blocks.iter().map(|b| b.id.as_str()).collect();
        // Ties between u1 and u2 keep insertion order.
        assert_eq!(ids, vec!["s1", "u1", "u2"]);
    }

    #[test]
    fn concat_skips_empty_blocks() {
        let blocks = vec![
            builtin("a", BlockRole::User, 0, "one"),
            builtin("b", BlockRole::User, 1, ""),
            builtin("c", BlockRole::User, 2, "two"),
        ];
        assert_eq!(concat_role(&blocks, BlockRole::User), "one\n\ntwo");
    }
}
