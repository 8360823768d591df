use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use gptscript_sdk::schema::{
    AuthResponse, GlobalOptions, Options, RunEventType, RunState, ToolDef,
};
use gptscript_sdk::{
    event_handler, Engine, EngineConfig, EventHandler, FailureKind, GptScript, RunError,
    GENERIC_RUN_ERROR,
};
use httpmock::prelude::*;
use serde_json::{json, Value};

async fn client_for(server: &MockServer) -> GptScript {
    GptScript::with_engine(
        Engine::new(EngineConfig::default()),
        GlobalOptions {
            url: server.base_url(),
            env: vec!["PATH=/usr/bin:/bin".to_string()],
            ..GlobalOptions::default()
        },
    )
    .await
    .expect("client should connect to mock engine")
}

fn event_stream(records: &[Value]) -> String {
    let mut body: String = records
        .iter()
        .map(|record| format!("data: {record}\n\n"))
        .collect();
    body.push_str("data: [DONE]\n\n");
    body
}

fn echo_tools() -> Vec<ToolDef> {
    vec![
        ToolDef {
            tools: vec!["echo".to_string()],
            instructions: "echo hello there".to_string(),
            ..ToolDef::default()
        },
        ToolDef {
            name: "other".to_string(),
            tools: vec!["echo".to_string()],
            instructions: "echo hello somewhere else".to_string(),
            ..ToolDef::default()
        },
        ToolDef {
            name: "echo".to_string(),
            instructions: "#!/bin/bash\necho \"${input}\"".to_string(),
            ..ToolDef::default()
        },
    ]
}

fn recording_handler() -> (EventHandler, Arc<Mutex<Vec<(RunEventType, String)>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = event_handler(move |_run, frame| {
        let sink = Arc::clone(&sink);
        async move {
            sink.lock()
                .expect("handler log lock")
                .push((frame.event_type(), frame.id().to_string()));
            Ok::<(), anyhow::Error>(())
        }
    });
    (handler, seen)
}

#[tokio::test]
async fn integration_evaluate_tool_list_streams_frames_to_handlers() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST).path("/evaluate").json_body_includes(
            json!({
                "toolDefs": [{"tools": ["echo"], "instructions": "echo hello there"}],
                "input": "",
                "chatState": ""
            })
            .to_string(),
        );
        then.status(200)
            .header("content-type", "text/event-stream")
            .body(event_stream(&[
                json!({"run": {"id": "r1", "type": "runStart", "program": {"name": "main", "entryToolId": "t1", "toolSet": {}}}}),
                json!({"call": {"id": "c1", "type": "callStart", "toolCategory": ""}}),
                json!({"call": {"id": "c2", "parentID": "c1", "type": "callStart", "toolCategory": ""}}),
                json!({"call": {"id": "c1", "type": "callFinish", "toolCategory": "", "output": [{"content": "hello there"}]}}),
                json!({"run": {"id": "r1", "type": "runFinish"}}),
                json!({"stdout": "hello there\n"}),
            ]));
    });

    let client = client_for(&server).await;
    let (handler, seen) = recording_handler();
    let mut run = client
        .evaluate(echo_tools(), Options::default(), vec![handler])
        .expect("start run");

    let output = run.text().await.expect("run output");
    mock.assert();
    assert_eq!(output, "hello there\n");
    assert_eq!(run.state(), RunState::Finished);
    assert_eq!(run.program().map(|program| program.name), Some("main".to_string()));
    assert_eq!(run.parent_call_id(), "c1");
    assert_eq!(run.calls().len(), 2);
    assert_eq!(
        run.parent_call_frame().map(|call| call.output_text()),
        Some("hello there".to_string())
    );
    assert_eq!(
        *seen.lock().expect("handler log lock"),
        vec![
            (RunEventType::RunStart, "r1".to_string()),
            (RunEventType::CallStart, "c1".to_string()),
            (RunEventType::CallStart, "c2".to_string()),
            (RunEventType::CallFinish, "c1".to_string()),
            (RunEventType::RunFinish, "r1".to_string()),
        ]
    );
    client.close().await.expect("close client");
}

#[tokio::test]
async fn integration_sub_tool_selects_named_entry_point() {
    let server = MockServer::start();
    let mock = server.mock(|when, then| {
        when.method(POST)
            .path("/evaluate")
            .json_body_includes(json!({"subTool": "other"}).to_string());
        then.status(200)
            .body(event_stream(&[json!({"stdout": "hello somewhere else\n"})]));
    });

    let client = client_for(&server).await;
    let mut run = client
        .evaluate(
            echo_tools(),
            Options {
                sub_tool: "other".to_string(),
                ..Options::default()
            },
            Vec::new(),
        )
        .expect("start run");

    assert_eq!(run.text().await.expect("output"), "hello somewhere else\n");
    mock.assert();
}

#[tokio::test]
async fn functional_chat_turns_forward_state_after_continue() {
    let server = MockServer::start();
    let first = server.mock(|when, then| {
        when.method(POST)
            .path("/run")
            .json_body_includes(json!({"file": "chat.gpt", "input": "hi", "chatState": ""}).to_string());
        then.status(200).body(event_stream(&[json!({
            "stdout": {"content": "hello", "state": {"turn": 1}, "done": false}
        })]));
    });
    let second = server.mock(|when, then| {
        when.method(POST).path("/run").json_body_includes(
            json!({"file": "chat.gpt", "input": "bye", "chatState": "{\"turn\":1}"}).to_string(),
        );
        then.status(200).body(event_stream(&[json!({
            "stdout": {"content": "goodbye", "state": {"turn": 2}, "done": true}
        })]));
    });

    let client = client_for(&server).await;
    let mut turn = client
        .run(
            "chat.gpt",
            Options {
                input: "hi".to_string(),
                ..Options::default()
            },
            Vec::new(),
        )
        .expect("first turn");
    assert_eq!(turn.text().await.expect("first output"), "hello");
    assert_eq!(turn.state(), RunState::Continue);
    assert_eq!(turn.chat_state(), "{\"turn\":1}");

    let mut next = turn.next_chat("bye").expect("second turn");
    assert_eq!(next.text().await.expect("second output"), "goodbye");
    assert_eq!(next.state(), RunState::Finished);
    assert!(matches!(
        next.next_chat("again"),
        Err(RunError::InvalidState(_))
    ));
    first.assert();
    second.assert();
}

#[tokio::test]
async fn regression_retry_after_error_does_not_forward_failed_chat_state() {
    let server = MockServer::start();
    let failing = server.mock(|when, then| {
        when.method(POST)
            .path("/run")
            .json_body_includes(json!({"input": "first"}).to_string());
        then.status(200).body(event_stream(&[
            json!({"stdout": {"content": "partial", "state": {"turn": 9}, "done": false}}),
            json!({"stderr": "tool crashed\n"}),
            json!({"run": {"id": "r1", "type": "runFinish", "error": "exit status 1"}}),
        ]));
    });
    let retry = server.mock(|when, then| {
        when.method(POST)
            .path("/run")
            .json_body_includes(json!({"input": "retry", "chatState": ""}).to_string());
        then.status(200)
            .body(event_stream(&[json!({"stdout": {"content": "ok", "done": true}})]));
    });

    let client = client_for(&server).await;
    let mut failed = client
        .run(
            "chat.gpt",
            Options {
                input: "first".to_string(),
                ..Options::default()
            },
            Vec::new(),
        )
        .expect("start run");

    let error = failed.text().await.expect_err("run should fail");
    assert_eq!(
        error.to_string(),
        "run encountered an error: exit status 1 with error output: tool crashed\n"
    );
    assert_eq!(error.failure_kind(), Some(FailureKind::Engine));
    assert_eq!(failed.state(), RunState::Error);
    assert_eq!(failed.err_output(), "tool crashed\n");

    let mut retried = failed.next_chat("retry").expect("retry turn");
    assert_eq!(retried.text().await.expect("retry output"), "ok");
    failing.assert();
    retry.assert();
}

#[tokio::test]
async fn regression_failing_status_records_generic_error_and_keeps_stderr() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/evaluate");
        then.status(500)
            .body("data: {\"stderr\": \"engine exploded\"}\n\ninternal server error\n");
    });

    let client = client_for(&server).await;
    let mut run = client
        .evaluate(ToolDef::new("echo hi"), Options::default(), Vec::new())
        .expect("start run");

    let error = run.text().await.expect_err("status 500 should fail");
    assert_eq!(run.state(), RunState::Error);
    assert_eq!(run.error(), GENERIC_RUN_ERROR);
    assert_eq!(run.failure_kind(), Some(FailureKind::HttpStatus));
    assert!(run.err_output().contains("engine exploded"));
    assert!(run.err_output().contains("internal server error"));
    assert!(matches!(
        error,
        RunError::Failed {
            kind: FailureKind::HttpStatus,
            ..
        }
    ));
    assert!(!run.was_aborted());
}

#[tokio::test]
async fn regression_prompt_without_permission_stops_reading_and_is_not_dispatched() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST)
            .path("/evaluate")
            .json_body_includes(json!({"prompt": false}).to_string());
        then.status(200).body(event_stream(&[
            json!({"call": {"id": "c1", "type": "callStart", "toolCategory": ""}}),
            json!({"prompt": {"id": "p1", "type": "prompt", "message": "first name?", "fields": ["first name"]}}),
            json!({"call": {"id": "c2", "type": "callStart", "toolCategory": ""}}),
            json!({"stdout": "never"}),
        ]));
    });

    let client = client_for(&server).await;
    let (handler, seen) = recording_handler();
    let mut run = client
        .evaluate(
            ToolDef::new("ask for a name"),
            Options::default(),
            vec![handler],
        )
        .expect("start run");

    let error = run.text().await.expect_err("prompt should fail the run");
    assert_eq!(error.failure_kind(), Some(FailureKind::PolicyViolation));
    assert!(run
        .error()
        .starts_with("prompt occurred when prompt was not allowed"));
    assert!(run.error().contains("first name?"));
    assert_eq!(run.state(), RunState::Error);
    assert_eq!(run.output(), "");
    assert_eq!(run.calls().len(), 1);
    assert_eq!(
        *seen.lock().expect("handler log lock"),
        vec![(RunEventType::CallStart, "c1".to_string())]
    );
}

#[tokio::test]
async fn functional_prompt_frames_reach_handlers_when_prompting_is_enabled() {
    let server = MockServer::start();
    let prompt_answer = server.mock(|when, then| {
        when.method(POST)
            .path("/prompt-response/p1")
            .json_body(json!({"first name": "Clicky"}));
        then.status(200);
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/evaluate")
            .json_body_includes(json!({"prompt": true}).to_string());
        then.status(200).body(event_stream(&[
            json!({"prompt": {"id": "p1", "message": "first name?", "fields": [{"name": "first name"}]}}),
            json!({"stdout": "Hello, Clicky"}),
        ]));
    });

    let client = Arc::new(client_for(&server).await);
    let answering = Arc::clone(&client);
    let handler = event_handler(move |_run, frame| {
        let client = Arc::clone(&answering);
        async move {
            if let Some(prompt) = frame.as_prompt() {
                let mut response = gptscript_sdk::schema::PromptResponse::new(prompt.id.clone());
                for field in &prompt.fields {
                    response = response.with_response(field.name.clone(), "Clicky");
                }
                client.prompt_response(&response).await?;
            }
            Ok::<(), anyhow::Error>(())
        }
    });

    let mut run = client
        .evaluate(
            ToolDef::new("ask for a name"),
            Options {
                prompt: true,
                ..Options::default()
            },
            vec![handler],
        )
        .expect("start run");

    assert_eq!(run.text().await.expect("output"), "Hello, Clicky");
    prompt_answer.assert();
}

#[tokio::test]
async fn integration_confirm_handler_answers_call_confirm_frames() {
    let server = MockServer::start();
    let confirm = server.mock(|when, then| {
        when.method(POST)
            .path("/confirm/c1")
            .json_body(json!({"id": "c1", "accept": true, "message": ""}));
        then.status(200);
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/evaluate")
            .json_body_includes(json!({"confirm": true}).to_string());
        then.status(200).body(event_stream(&[
            json!({"call": {"id": "c1", "type": "callConfirm", "toolCategory": ""}}),
            json!({"call": {"id": "c1", "type": "callFinish", "toolCategory": ""}}),
            json!({"stdout": "confirmed"}),
        ]));
    });

    let client = Arc::new(client_for(&server).await);
    let confirming = Arc::clone(&client);
    let handler = event_handler(move |_run, frame| {
        let client = Arc::clone(&confirming);
        async move {
            if frame.event_type() == RunEventType::CallConfirm {
                client.confirm(&AuthResponse::accept(frame.id())).await?;
            }
            Ok::<(), anyhow::Error>(())
        }
    });

    let mut run = client
        .evaluate(
            ToolDef::new("ls"),
            Options {
                confirm: true,
                ..Options::default()
            },
            vec![handler],
        )
        .expect("start run");

    assert_eq!(run.text().await.expect("output"), "confirmed");
    confirm.assert();
}

#[tokio::test]
async fn integration_denied_confirm_returns_engine_fallback_output() {
    let server = MockServer::start();
    let deny = server.mock(|when, then| {
        when.method(POST)
            .path("/confirm/c1")
            .json_body(json!({"id": "c1", "accept": false, "message": "not today"}));
        then.status(200);
    });
    server.mock(|when, then| {
        when.method(POST)
            .path("/evaluate")
            .json_body_includes(json!({"confirm": true}).to_string());
        then.status(200).body(event_stream(&[
            json!({"call": {"id": "c1", "type": "callConfirm", "toolCategory": ""}}),
            json!({"call": {"id": "c1", "type": "callFinish", "toolCategory": ""}}),
            json!({"stdout": "FAIL"}),
        ]));
    });

    let client = Arc::new(client_for(&server).await);
    let denying = Arc::clone(&client);
    let handler = event_handler(move |_run, frame| {
        let client = Arc::clone(&denying);
        async move {
            if frame.event_type() == RunEventType::CallConfirm {
                client
                    .confirm(&AuthResponse::deny(frame.id(), "not today"))
                    .await?;
            }
            Ok::<(), anyhow::Error>(())
        }
    });

    let mut run = client
        .evaluate(
            ToolDef::new("rm -rf ./scratch"),
            Options {
                confirm: true,
                ..Options::default()
            },
            vec![handler],
        )
        .expect("start run");

    assert_eq!(run.text().await.expect("output"), "FAIL");
    assert_eq!(run.state(), RunState::Finished);
    deny.assert();
}

#[tokio::test]
async fn integration_cancel_aborts_in_flight_run() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/evaluate");
        then.status(200)
            .delay(Duration::from_secs(10))
            .body(event_stream(&[json!({"stdout": "too late"})]));
    });

    let client = client_for(&server).await;
    let mut run = client
        .evaluate(ToolDef::new("sleep 10"), Options::default(), Vec::new())
        .expect("start run");
    assert_eq!(run.state(), RunState::Running);
    assert!(matches!(
        run.next_chat("again"),
        Err(RunError::InvalidState(_))
    ));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let started = Instant::now();
    run.cancel().expect("first cancel");
    run.cancel().expect("second cancel is a no-op");

    let error = run.text().await.expect_err("cancelled run should fail");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(matches!(error, RunError::Aborted { .. }));
    assert_eq!(run.state(), RunState::Error);
    assert_eq!(run.error(), "run was aborted");
    assert!(run.was_aborted());
    assert_eq!(run.failure_kind(), Some(FailureKind::Aborted));
}

#[tokio::test]
async fn functional_cancel_after_completion_leaves_outcome_untouched() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/evaluate");
        then.status(200)
            .body(event_stream(&[json!({"stdout": "done"})]));
    });

    let client = client_for(&server).await;
    let mut run = client
        .evaluate(ToolDef::new("echo done"), Options::default(), Vec::new())
        .expect("start run");
    assert_eq!(run.text().await.expect("output"), "done");

    run.cancel().expect("cancel after completion");
    assert_eq!(run.state(), RunState::Finished);
    assert!(!run.was_aborted());
    assert_eq!(run.text().await.expect("output again"), "done");
}

#[tokio::test]
async fn functional_handlers_keep_stream_order_and_cannot_fail_the_run() {
    let server = MockServer::start();
    let frames: Vec<Value> = (0..8)
        .map(|index| {
            json!({"call": {"id": format!("c{index}"), "type": "callProgress", "toolCategory": ""}})
        })
        .chain(std::iter::once(json!({"stdout": "fine"})))
        .collect();
    server.mock(|when, then| {
        when.method(POST).path("/evaluate");
        then.status(200).body(event_stream(&frames));
    });

    let slow_seen = Arc::new(Mutex::new(Vec::new()));
    let slow_sink = Arc::clone(&slow_seen);
    let slow = event_handler(move |_run, frame| {
        let sink = Arc::clone(&slow_sink);
        async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            sink.lock()
                .expect("slow log lock")
                .push(frame.id().to_string());
            Ok::<(), anyhow::Error>(())
        }
    });
    let (fast, fast_seen) = recording_handler();
    let failing = event_handler(|_run, _frame| async move {
        Err::<(), anyhow::Error>(anyhow::anyhow!("handler failure is only logged"))
    });
    let panicking = event_handler(|_run, frame| async move {
        if frame.id() == "c3" {
            panic!("handler panic is isolated");
        }
        Ok::<(), anyhow::Error>(())
    });

    let client = client_for(&server).await;
    let mut run = client
        .evaluate(
            ToolDef::new("progress"),
            Options::default(),
            vec![slow, fast, failing, panicking],
        )
        .expect("start run");

    assert_eq!(run.text().await.expect("output"), "fine");
    assert_eq!(run.state(), RunState::Finished);
    let expected: Vec<String> = (0..8).map(|index| format!("c{index}")).collect();
    assert_eq!(*slow_seen.lock().expect("slow log lock"), expected);
    let fast_ids: Vec<String> = fast_seen
        .lock()
        .expect("fast log lock")
        .iter()
        .map(|(_, id)| id.clone())
        .collect();
    assert_eq!(fast_ids, expected);
}

#[tokio::test]
async fn functional_handler_can_cancel_its_own_run() {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/evaluate");
        then.status(200)
            .body(event_stream(&[
                json!({"call": {"id": "c1", "type": "callStart", "toolCategory": ""}}),
            ]))
            .delay(Duration::from_millis(10));
    });

    let client = client_for(&server).await;
    let cancelling = event_handler(|run, _frame| async move {
        run.cancel();
        Ok::<(), anyhow::Error>(())
    });
    let mut run = client
        .evaluate(ToolDef::new("x"), Options::default(), vec![cancelling])
        .expect("start run");

    // The body may already be fully read when the handler cancels.
    match run.text().await {
        Ok(_) => assert_eq!(run.state(), RunState::Finished),
        Err(error) => assert!(matches!(error, RunError::Aborted { .. })),
    }
}
