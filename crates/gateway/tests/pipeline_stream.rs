//! End-to-end pipeline tests over a scripted provider: NDJSON event
//! ordering, persistence, block overrides and the librarian handoff.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use quill_domain::blocks::{BlockConfig, BlockRole, CustomBlockDefinition, CustomBlockKind};
use quill_domain::config::Config;
use quill_domain::genlog::GenerationMode;
use quill_domain::story::Story;
use quill_domain::stream::ModelPart;
use quill_gateway::bootstrap::build_app_state;
use quill_gateway::runtime::pipeline::{start_generation, GenerateRequest};
use quill_gateway::state::AppState;
use quill_providers::ScriptedProvider;
use quill_store::fragments::NewFragment;

fn scripted_text(text: &str) -> Vec<quill_domain::Result<ModelPart>> {
    vec![
        Ok(ModelPart::TextDelta { text: text.to_string() }),
        Ok(ModelPart::Finish { finish_reason: Some("stop".into()), usage: None }),
    ]
}

struct Fixture {
    _dir: tempfile::TempDir,
    state: AppState,
    story_id: String,
}

fn fixture(steps: Vec<Vec<quill_domain::Result<ModelPart>>>) -> Fixture {
    let dir = tempfile::tempdir().unwrap();

    let mut config = Config::default();
    config.storage.data_dir = dir.path().join("data");
    config.storage.instruction_sets_dir = dir.path().join("instruction-sets");
    config.librarian.debounce_ms = 100;

    let state = build_app_state(Arc::new(config), Arc::new(ScriptedProvider::new(steps)));

    let story = Story::new("Voyage");
    let story_id = story.id.clone();
    state.deps.stories.create(&story).unwrap();

    Fixture { _dir: dir, state, story_id }
}

fn seed(fx: &Fixture, kind: &str, name: &str, content: &str, sticky: bool) -> String {
    fx.state
        .deps
        .fragments
        .create(
            &fx.story_id,
            NewFragment {
                kind: kind.into(),
                name: name.into(),
                content: content.into(),
                sticky,
                ..Default::default()
            },
        )
        .unwrap()
        .id
}

fn generate_req(input: &str, save: bool) -> GenerateRequest {
    GenerateRequest {
        input: input.into(),
        save_result: save,
        mode: GenerationMode::Generate,
        fragment_id: None,
        model: None,
    }
}

async fn run_to_events(fx: &Fixture, req: GenerateRequest) -> Vec<Value> {
    let mut lines = start_generation(&fx.state, &fx.story_id, req).await.unwrap();
    let mut events = Vec::new();
    while let Some(line) = lines.recv().await {
        assert!(line.ends_with('\n'));
        events.push(serde_json::from_str(line.trim()).unwrap());
    }
    events
}

async fn wait_for_log(fx: &Fixture) -> quill_domain::genlog::GenerationLog {
    for _ in 0..200 {
        let index = fx.state.deps.logs.list(&fx.story_id);
        if let Some(summary) = index.first() {
            if let Some(log) = fx.state.deps.logs.get(&fx.story_id, &summary.id) {
                return log;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("generation log was never persisted");
}

#[tokio::test]
async fn generate_streams_text_and_single_trailing_finish() {
    let fx = fixture(vec![scripted_text("The storm finally broke.")]);
    seed(&fx, "guideline", "tone", "keep it grim", true);
    seed(&fx, "prose", "p1", "Chapter one.", false);
    seed(&fx, "prose", "p2", "Chapter two.", false);

    let events = run_to_events(&fx, generate_req("continue", false)).await;

    assert!(events.iter().any(|e| e["type"] == "text"));
    let finishes: Vec<_> = events.iter().filter(|e| e["type"] == "finish").collect();
    assert_eq!(finishes.len(), 1);
    assert_eq!(events.last().unwrap()["type"], "finish");
    assert_eq!(events.last().unwrap()["stepCount"], 1);

    // saveResult=false: no prose fragment was created.
    let log = wait_for_log(&fx).await;
    assert!(log.fragment_id.is_none());
    assert_eq!(log.generated_text, "The storm finally broke.");
    let prose = fx
        .state
        .deps
        .fragments
        .list_summaries(&fx.story_id, Some("prose"), true)
        .unwrap();
    assert_eq!(prose.len(), 2);
}

#[tokio::test]
async fn saved_generation_creates_prose_and_wakes_the_librarian() {
    let fx = fixture(vec![
        scripted_text("New passage text."),
        // The librarian run consumes the second step.
        scripted_text(r#"{"summaryUpdate": "a passage was added"}"#),
    ]);
    seed(&fx, "prose", "p1", "Chapter one.", false);

    let events = run_to_events(&fx, generate_req("continue", true)).await;
    assert_eq!(events.last().unwrap()["type"], "finish");

    let log = wait_for_log(&fx).await;
    let fragment_id = log.fragment_id.clone().expect("prose fragment persisted");
    let fragment = fx.state.deps.fragments.get(&fx.story_id, &fragment_id).unwrap();
    assert_eq!(fragment.content, "New passage text.");
    assert_eq!(fragment.kind, "prose");
    assert_eq!(fragment.version, 1);

    // Debounce (100ms) then the analyzer integrates the summary.
    for _ in 0..300 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let story = fx.state.deps.stories.require(&fx.story_id).unwrap();
        if !story.summary.is_empty() {
            break;
        }
    }
    let story = fx.state.deps.stories.require(&fx.story_id).unwrap();
    assert_eq!(story.summary, "a passage was added");
}

#[tokio::test]
async fn tool_loop_events_appear_on_the_wire_and_in_the_log() {
    let fx = fixture(vec![
        vec![
            Ok(ModelPart::ToolCall {
                id: "c1".into(),
                tool_name: "listFragments".into(),
                args: json!({ "type": "character" }),
            }),
            Ok(ModelPart::Finish { finish_reason: Some("tool-calls".into()), usage: None }),
        ],
        scripted_text("Done after lookup."),
    ]);
    seed(&fx, "character", "Ada", "an engineer", false);
    seed(&fx, "prose", "p1", "Chapter one.", false);

    let events = run_to_events(&fx, generate_req("continue", false)).await;
    let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
    assert!(types.contains(&"tool-call"));
    assert!(types.contains(&"tool-result"));
    assert_eq!(*types.last().unwrap(), "finish");
    assert_eq!(events.last().unwrap()["stepCount"], 2);

    let log = wait_for_log(&fx).await;
    assert_eq!(log.tool_calls.len(), 1);
    assert_eq!(log.tool_calls[0].tool_name, "listFragments");
    // Args were merged back by call id.
    assert_eq!(log.tool_calls[0].args["type"], "character");
    assert_eq!(log.step_count, 2);
}

#[tokio::test]
async fn failing_script_block_is_visible_in_the_user_message() {
    let fx = fixture(vec![scripted_text("prose")]);
    seed(&fx, "prose", "p1", "Chapter one.", false);

    let mut block_config = BlockConfig::default();
    block_config.custom_blocks.push(CustomBlockDefinition {
        id: "cb-mood".into(),
        name: "mood".into(),
        role: BlockRole::User,
        order: 5,
        enabled: true,
        kind: CustomBlockKind::Script,
        content: r#"throw "boom""#.into(),
    });
    fx.state
        .deps
        .block_configs
        .save(&fx.story_id, &block_config)
        .unwrap();

    run_to_events(&fx, generate_req("continue", false)).await;

    let log = wait_for_log(&fx).await;
    let user_message = log.messages[1].content.extract_all_text();
    assert!(
        user_message.contains(r#"[Script error in "mood": boom]"#),
        "user message was: {user_message}"
    );
}

#[tokio::test]
async fn regenerate_replaces_target_content_with_a_version_snapshot() {
    let fx = fixture(vec![scripted_text("A fresh take.")]);
    seed(&fx, "prose", "p1", "Chapter one.", false);
    let target = seed(&fx, "prose", "p2", "Old chapter two.", false);

    let req = GenerateRequest {
        input: String::new(),
        save_result: true,
        mode: GenerationMode::Regenerate,
        fragment_id: Some(target.clone()),
        model: None,
    };
    let events = run_to_events(&fx, req).await;
    assert_eq!(events.last().unwrap()["type"], "finish");

    let log = wait_for_log(&fx).await;
    assert_eq!(log.fragment_id.as_deref(), Some(target.as_str()));

    let fragment = fx.state.deps.fragments.get(&fx.story_id, &target).unwrap();
    assert_eq!(fragment.content, "A fresh take.");
    assert_eq!(fragment.version, 2);
    assert_eq!(fragment.versions[0].content, "Old chapter two.");
}

#[tokio::test]
async fn regenerate_without_target_is_a_validation_error() {
    let fx = fixture(vec![]);
    let req = GenerateRequest {
        input: String::new(),
        save_result: true,
        mode: GenerationMode::Regenerate,
        fragment_id: None,
        model: None,
    };
    let err = start_generation(&fx.state, &fx.story_id, req).await.unwrap_err();
    assert!(matches!(err, quill_domain::Error::Validation(_)));
}

#[tokio::test]
async fn unknown_story_is_not_found() {
    let fx = fixture(vec![]);
    let err = start_generation(&fx.state, "st-ghost1", generate_req("x", false))
        .await
        .unwrap_err();
    assert!(matches!(err, quill_domain::Error::NotFound { .. }));
}
