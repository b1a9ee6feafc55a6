use std::collections::HashMap;
use std::sync::Arc;

use super::{RecordingAdapter, TestHarness};
use crate::platform::StreamingMode;
use crate::storage::{WorkflowRun, WorkflowRunStatus};
use crate::workflow::{
    LoopSpec, SingleStep, WorkflowDefinition, WorkflowDispatch, WorkflowExecutor, WorkflowStep,
};
use ai_client::MessageChunk;

fn single(command: &str) -> WorkflowStep {
    WorkflowStep::Single(SingleStep {
        command: command.to_string(),
        clear_context: false,
    })
}

fn steps_workflow(name: &str, steps: Vec<WorkflowStep>) -> WorkflowDefinition {
    WorkflowDefinition {
        name: name.to_string(),
        description: String::new(),
        provider: "claude".to_string(),
        steps,
        loop_spec: None,
    }
}

fn loop_workflow(name: &str, until: &str, max_iterations: u32, fresh: bool) -> WorkflowDefinition {
    WorkflowDefinition {
        name: name.to_string(),
        description: String::new(),
        provider: "claude".to_string(),
        steps: Vec::new(),
        loop_spec: Some(LoopSpec {
            prompt: "Iteration $ITERATION: work on $USER_MESSAGE".to_string(),
            until: until.to_string(),
            max_iterations,
            fresh_context: fresh,
        }),
    }
}

async fn dispatch_for(
    harness: &TestHarness,
    key: &str,
    definition: WorkflowDefinition,
    trigger: &str,
) -> (WorkflowDispatch, WorkflowRun) {
    let conversation = harness.bound_conversation(key).await;
    let run = harness
        .store
        .create_workflow_run(
            &conversation.id,
            &harness.codebase.id,
            &definition.name,
            trigger,
            &HashMap::new(),
        )
        .await
        .unwrap();
    let dispatch = WorkflowDispatch {
        run: run.clone(),
        definition,
        conversation,
        codebase: harness.codebase.clone(),
        cwd: harness.repo_path.clone(),
        platform_conversation_id: key.to_string(),
        external_context: None,
        client: harness.client.clone(),
        adapter: Arc::new(RecordingAdapter::new(StreamingMode::Batch)),
    };
    (dispatch, run)
}

#[tokio::test]
async fn sequential_steps_resume_one_session() {
    let harness = TestHarness::new().await;
    let definition = steps_workflow("build", vec![single("review"), single("execute")]);
    let (dispatch, run) = dispatch_for(&harness, "wf-1", definition, "add logging").await;

    let executor = WorkflowExecutor::new(harness.store.clone());
    executor.execute(dispatch).await.unwrap();

    let queries = harness.client.recorded_queries();
    assert_eq!(queries.len(), 2);
    // First step starts fresh; second resumes the assistant session the
    // first step returned.
    assert_eq!(queries[0].resume_session_id, None);
    assert_eq!(queries[1].resume_session_id.as_deref(), Some("mock-session-1"));

    let run = harness.store.get_workflow_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.run_status(), Some(WorkflowRunStatus::Completed));
    assert_eq!(
        run.metadata_map().get("lastStepIndex").and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        run.metadata_map().get("exitReason").and_then(|v| v.as_str()),
        Some("completed")
    );
}

#[tokio::test]
async fn clear_context_step_starts_fresh() {
    let harness = TestHarness::new().await;
    let definition = steps_workflow(
        "build",
        vec![
            single("review"),
            WorkflowStep::Single(SingleStep {
                command: "execute".to_string(),
                clear_context: true,
            }),
        ],
    );
    let (dispatch, _) = dispatch_for(&harness, "wf-2", definition, "x").await;

    WorkflowExecutor::new(harness.store.clone())
        .execute(dispatch)
        .await
        .unwrap();

    let queries = harness.client.recorded_queries();
    assert_eq!(queries[1].resume_session_id, None);
}

#[tokio::test]
async fn parallel_block_fails_fast_and_skips_following_steps() {
    let harness = TestHarness::new().await;
    let definition = steps_workflow(
        "fanout",
        vec![
            WorkflowStep::Parallel {
                parallel: vec![
                    SingleStep { command: "write-tests".to_string(), clear_context: false },
                    SingleStep { command: "write-docs".to_string(), clear_context: false },
                    SingleStep { command: "review".to_string(), clear_context: false },
                ],
            },
            single("execute"),
        ],
    );
    let (dispatch, run) = dispatch_for(&harness, "wf-3", definition, "ship it").await;

    // Three parallel turns: one of them dies mid-stream.
    harness.client.push_text_turn("done a", "p1");
    harness.client.push_failing_turn("worker exploded");
    harness.client.push_text_turn("done c", "p3");

    let result = WorkflowExecutor::new(harness.store.clone())
        .execute(dispatch)
        .await;
    assert!(result.is_err());

    // All three block steps started; the step after the block never ran.
    let queries = harness.client.recorded_queries();
    assert_eq!(queries.len(), 3);
    for query in &queries {
        assert_eq!(query.resume_session_id, None);
    }

    let run = harness.store.get_workflow_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.run_status(), Some(WorkflowRunStatus::Failed));
    assert_eq!(
        run.metadata_map().get("failedBlock").and_then(|v| v.as_i64()),
        Some(0)
    );
}

#[tokio::test]
async fn step_after_parallel_block_starts_fresh() {
    let harness = TestHarness::new().await;
    let definition = steps_workflow(
        "fanout",
        vec![
            WorkflowStep::Parallel {
                parallel: vec![SingleStep {
                    command: "write-tests".to_string(),
                    clear_context: false,
                }],
            },
            single("review"),
        ],
    );
    let (dispatch, run) = dispatch_for(&harness, "wf-4", definition, "x").await;

    WorkflowExecutor::new(harness.store.clone())
        .execute(dispatch)
        .await
        .unwrap();

    let queries = harness.client.recorded_queries();
    assert_eq!(queries.len(), 2);
    // Single-step parallel block behaves like a sequential step except for
    // the fresh sessions on both sides of the block boundary.
    assert_eq!(queries[0].resume_session_id, None);
    assert_eq!(queries[1].resume_session_id, None);

    let run = harness.store.get_workflow_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.run_status(), Some(WorkflowRunStatus::Completed));
}

#[tokio::test]
async fn loop_exits_on_completion_signal() {
    let harness = TestHarness::new().await;
    let definition = loop_workflow("fix-tests", "DONE", 5, false);
    let (dispatch, run) = dispatch_for(&harness, "wf-5", definition, "make tests green").await;

    harness.client.push_text_turn("still red", "it1");
    harness.client.push_turn(vec![
        MessageChunk::assistant("all green now <promise>DONE</promise>"),
        MessageChunk::result(Some("it2".into())),
    ]);

    WorkflowExecutor::new(harness.store.clone())
        .execute(dispatch)
        .await
        .unwrap();

    let queries = harness.client.recorded_queries();
    assert_eq!(queries.len(), 2);
    assert!(queries[0].prompt.contains("Iteration 1"));
    assert!(queries[1].prompt.contains("Iteration 2"));
    // Second iteration resumed the first iteration's session.
    assert_eq!(queries[1].resume_session_id.as_deref(), Some("it1"));

    let run = harness.store.get_workflow_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.run_status(), Some(WorkflowRunStatus::Completed));
    let metadata = run.metadata_map();
    assert_eq!(
        metadata.get("exitReason").and_then(|v| v.as_str()),
        Some("completion-signal")
    );
    assert_eq!(metadata.get("iterations").and_then(|v| v.as_i64()), Some(2));
}

#[tokio::test]
async fn loop_with_max_one_runs_exactly_once() {
    let harness = TestHarness::new().await;
    let definition = loop_workflow("one-shot", "NEVER-EMITTED", 1, false);
    let (dispatch, run) = dispatch_for(&harness, "wf-6", definition, "x").await;

    WorkflowExecutor::new(harness.store.clone())
        .execute(dispatch)
        .await
        .unwrap();

    assert_eq!(harness.client.recorded_queries().len(), 1);
    let run = harness.store.get_workflow_run(&run.id).await.unwrap().unwrap();
    assert_eq!(
        run.metadata_map().get("exitReason").and_then(|v| v.as_str()),
        Some("max-iterations")
    );
}

#[tokio::test]
async fn fresh_context_loop_never_resumes() {
    let harness = TestHarness::new().await;
    let definition = loop_workflow("probe", "DONE", 3, true);
    let (dispatch, _) = dispatch_for(&harness, "wf-7", definition, "x").await;

    WorkflowExecutor::new(harness.store.clone())
        .execute(dispatch)
        .await
        .unwrap();

    let queries = harness.client.recorded_queries();
    assert_eq!(queries.len(), 3);
    assert!(queries.iter().all(|q| q.resume_session_id.is_none()));
}

#[tokio::test]
async fn cancelled_run_stops_before_next_step() {
    let harness = TestHarness::new().await;
    let definition = steps_workflow("build", vec![single("review"), single("execute")]);
    let (dispatch, run) = dispatch_for(&harness, "wf-8", definition, "x").await;

    // Cancel before execution starts; the executor must not run any step.
    harness
        .store
        .set_workflow_run_status(&run.id, WorkflowRunStatus::Cancelled)
        .await
        .unwrap();

    WorkflowExecutor::new(harness.store.clone())
        .execute(dispatch)
        .await
        .unwrap();

    assert!(harness.client.recorded_queries().is_empty());
    let run = harness.store.get_workflow_run(&run.id).await.unwrap().unwrap();
    assert_eq!(run.run_status(), Some(WorkflowRunStatus::Cancelled));
}

#[tokio::test]
async fn failed_run_auto_commits_partial_work() {
    let harness = TestHarness::new().await;
    let definition = steps_workflow("build", vec![single("review")]);
    let (dispatch, _) = dispatch_for(&harness, "wf-9", definition, "x").await;

    // Leave uncommitted work in the cwd, then fail the only step.
    tokio::fs::write(harness.repo_path.join("partial.txt"), "half done")
        .await
        .unwrap();
    harness.client.push_failing_turn("boom");

    let result = WorkflowExecutor::new(harness.store.clone())
        .execute(dispatch)
        .await;
    assert!(result.is_err());

    // The safety net committed the partial work.
    let repo = crate::git::GitRepo::open(&harness.repo_path);
    assert!(!repo.has_uncommitted_changes().await.unwrap());
}
