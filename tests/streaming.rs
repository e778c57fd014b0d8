mod support;

use std::sync::Arc;

use futures::StreamExt;
use support::{harness, ExecCall, ExecReply, FakeRuntime};
use tokio::sync::Notify;
use underleaf_sandbox::errors::SandboxError;
use underleaf_sandbox::events::NO_RESPONSE;
use underleaf_sandbox::models::{AssistantRequest, LoginResponse, SandboxKey};
use underleaf_sandbox::service::SandboxService;

fn key() -> SandboxKey {
    SandboxKey::new("alice", "thesis")
}

fn is_turn(call: &ExecCall) -> bool {
    call.has_arg("--print")
}

fn is_login_driver(call: &ExecCall) -> bool {
    call.argv.first().map(String::as_str) == Some("expect")
}

const GREETING: &[&str] = &[
    r#"{"type":"system","subtype":"init","session_id":"sess-42"}"#,
    r#"{"type":"assistant","message":{"content":[{"type":"text","text":"hi"}]},"session_id":"sess-42"}"#,
    r#"{"type":"result","result":"hi","session_id":"sess-42"}"#,
];

#[tokio::test]
async fn second_turn_resumes_the_first() {
    let fake = FakeRuntime::with_handler(|call| {
        if is_turn(call) {
            ExecReply::lines(GREETING)
        } else {
            ExecReply::ok()
        }
    });
    let manager = harness(&fake);

    let first: Vec<String> = manager
        .bridge()
        .start_turn(&key(), "hello")
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(first, vec!["hi\n\n".to_string()]);
    assert_eq!(
        manager.bridge().sessions().get(&key()).await.as_deref(),
        Some("sess-42")
    );

    let _second: Vec<String> = manager
        .bridge()
        .start_turn(&key(), "and again")
        .await
        .unwrap()
        .collect()
        .await;

    let turns: Vec<ExecCall> = fake.execs().into_iter().filter(is_turn).collect();
    assert_eq!(turns.len(), 2);
    assert!(!turns[0].has_arg("--resume"));
    assert_eq!(turns[1].arg_after("--resume"), Some("sess-42"));
    assert_eq!(turns[1].argv.last().unwrap(), "and again");
}

#[tokio::test]
async fn cleared_session_starts_fresh() {
    let fake = FakeRuntime::with_handler(|call| {
        if is_turn(call) {
            ExecReply::lines(GREETING)
        } else {
            ExecReply::ok()
        }
    });
    let manager = harness(&fake);
    manager.provision_project("thesis".into()).await.unwrap();

    let _: Vec<String> = manager
        .bridge()
        .start_turn(&key(), "hello")
        .await
        .unwrap()
        .collect()
        .await;
    assert!(manager.clear_assistant_session(key()).await.unwrap());
    assert!(!manager.clear_assistant_session(key()).await.unwrap());

    let _: Vec<String> = manager
        .bridge()
        .start_turn(&key(), "hello again")
        .await
        .unwrap()
        .collect()
        .await;
    let turns: Vec<ExecCall> = fake.execs().into_iter().filter(is_turn).collect();
    assert!(!turns[1].has_arg("--resume"));
}

/// Dropping the response stream must stop the assistant process in the sandbox.
#[tokio::test]
async fn disconnect_kills_the_assistant() {
    let fake = FakeRuntime::with_handler(|call| {
        if is_turn(call) {
            ExecReply::lines(&[r#"{"type":"content_block_delta","delta":{"text":"Thinking"}}"#])
                .hanging()
        } else {
            ExecReply::ok()
        }
    });
    let manager = harness(&fake);

    let mut stream = manager.bridge().start_turn(&key(), "hello").await.unwrap();
    assert_eq!(stream.next().await.as_deref(), Some("Thinking"));
    drop(stream);

    let kill = fake
        .wait_for_exec(|call| call.script().contains("kill"))
        .await
        .expect("kill script ran");
    let turn = fake.execs().into_iter().find(is_turn).unwrap();
    // The pid file recorded by the wrapper is the one the kill script reads.
    assert_eq!(kill.argv.last(), turn.argv.get(4));
}

#[tokio::test]
async fn finished_turn_only_removes_the_pid_file() {
    let fake = FakeRuntime::with_handler(|call| {
        if is_turn(call) {
            ExecReply::lines(GREETING)
        } else {
            ExecReply::ok()
        }
    });
    let manager = harness(&fake);

    let _: Vec<String> = manager
        .bridge()
        .start_turn(&key(), "hello")
        .await
        .unwrap()
        .collect()
        .await;

    let cleanup = fake
        .wait_for_exec(|call| call.script().starts_with("rm -f"))
        .await
        .expect("pid file removed");
    assert!(cleanup.argv.last().unwrap().ends_with(".pid"));
    assert!(!fake.execs().iter().any(|call| call.script().contains("kill")));
}

/// A stop event ends the turn even if the CLI has not exited yet; it must not linger.
#[tokio::test]
async fn turn_ending_on_message_stop_stops_the_assistant() {
    let fake = FakeRuntime::with_handler(|call| {
        if is_turn(call) {
            ExecReply::lines(&[
                r#"{"type":"content_block_delta","delta":{"text":"Done."}}"#,
                r#"{"type":"message_stop"}"#,
            ])
            .hanging()
        } else {
            ExecReply::ok()
        }
    });
    let manager = harness(&fake);

    let chunks: Vec<String> = manager
        .bridge()
        .start_turn(&key(), "hello")
        .await
        .unwrap()
        .collect()
        .await;
    assert_eq!(chunks, vec!["Done.".to_string()]);

    let kill = fake
        .wait_for_exec(|call| call.script().contains("kill"))
        .await
        .expect("kill script ran");
    let turn = fake.execs().into_iter().find(is_turn).unwrap();
    assert_eq!(kill.argv.last(), turn.argv.get(4));
}

#[tokio::test]
async fn silent_turn_reports_no_response() {
    let fake = FakeRuntime::new();
    let manager = harness(&fake);

    let chunks: Vec<String> = manager
        .bridge()
        .start_turn(&key(), "hello")
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(chunks, vec![NO_RESPONSE.to_string()]);
}

#[tokio::test]
async fn broken_stream_is_reported_in_band() {
    let fake = FakeRuntime::with_handler(|call| {
        if is_turn(call) {
            ExecReply {
                raw: Some(b"\x09\x00\x00\x00\x00\x00\x00\x01x".to_vec()),
                ..ExecReply::default()
            }
        } else {
            ExecReply::ok()
        }
    });
    let manager = harness(&fake);

    let chunks: Vec<String> = manager
        .bridge()
        .start_turn(&key(), "hello")
        .await
        .unwrap()
        .collect()
        .await;

    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].starts_with("Stream error:"));
}

#[tokio::test]
async fn unauthenticated_assistant_is_refused() {
    let fake = FakeRuntime::with_handler(|call| {
        if call.has_arg("whoami") {
            ExecReply::failed(1, "Not authenticated")
        } else {
            ExecReply::ok()
        }
    });
    let manager = harness(&fake);
    manager.provision_project("thesis".into()).await.unwrap();

    let error = manager
        .assistant_turn(
            key(),
            AssistantRequest {
                message: "fix my bibliography".into(),
            },
        )
        .await
        .err()
        .expect("turn refused");

    assert!(matches!(error, SandboxError::AuthError(_)));
    assert!(!fake.execs().iter().any(is_turn));
}

#[tokio::test]
async fn assistant_settings_are_written_once() {
    let fake = FakeRuntime::with_handler(|call| {
        match call.argv.first().map(String::as_str) {
            // No settings file yet.
            Some("test") => ExecReply::failed(1, ""),
            _ => ExecReply::ok(),
        }
    });
    let manager = harness(&fake);

    assert!(manager.bridge().ensure_assistant_settings(&key()).await.unwrap());

    let write = fake
        .execs()
        .into_iter()
        .find(|call| !call.stdin.is_empty())
        .unwrap();
    let settings: serde_json::Value = serde_json::from_slice(&write.stdin).unwrap();
    assert_eq!(settings["includeCoAuthoredBy"], false);
    assert!(settings["mcpServers"]["underleaf_permissions"]["command"].is_string());
    assert!(settings["permissions"]["allow"]
        .as_array()
        .unwrap()
        .iter()
        .any(|tool| tool == "Edit"));
}

const SIGN_IN: &str =
    "Opening browser\r\nAUTH_URL_FOUND: https://claude.ai/oauth/authorize?state=xyz\r\nWAITING_FOR_CODE\r\n";

fn is_code_write(call: &ExecCall) -> bool {
    !call.stdin.is_empty()
        && call
            .argv
            .last()
            .is_some_and(|path| path.ends_with("verification_code.txt"))
}

#[tokio::test]
async fn login_verifies_through_live_output() {
    let release = Arc::new(Notify::new());
    let driver_release = Arc::clone(&release);
    let fake = FakeRuntime::with_handler(move |call| {
        if is_login_driver(call) {
            ExecReply {
                stdout: vec![SIGN_IN.as_bytes().to_vec()],
                later: Some((
                    Arc::clone(&driver_release),
                    vec![b"CODE_RECEIVED\r\nCODE_SUBMITTED\r\nAUTHENTICATION_SUCCESS\r\n".to_vec()],
                )),
                hang: true,
                ..ExecReply::default()
            }
        } else if is_code_write(call) {
            driver_release.notify_one();
            ExecReply::ok()
        } else if call.argv.first().map(String::as_str) == Some("cat") {
            ExecReply::stdout("code-123")
        } else {
            ExecReply::ok()
        }
    });
    let manager = harness(&fake);

    let started = manager.bridge().start_login(&key()).await.unwrap();
    let LoginResponse::WaitingForCode { auth_url, .. } = started else {
        panic!("expected a sign-in URL, got {started:?}");
    };
    assert_eq!(auth_url, "https://claude.ai/oauth/authorize?state=xyz");
    assert!(manager.bridge().has_live_login(&key()).await);

    let verified = manager
        .bridge()
        .verify_code(&key(), " code-123 ")
        .await
        .unwrap();

    assert!(verified.configured);
    assert!(verified.acknowledged);
    assert!(!manager.bridge().has_live_login(&key()).await);
    let script = fake
        .execs()
        .into_iter()
        .find(|call| call.stdin.starts_with(b"#!/usr/bin/expect"))
        .expect("driver script installed");
    assert!(String::from_utf8_lossy(&script.stdin).contains("/tmp/claude-comm"));
}

/// Once the driver is gone the verdict is read from the result file instead.
#[tokio::test]
async fn login_falls_back_to_the_result_file() {
    let fake = FakeRuntime::with_handler(|call| {
        if is_login_driver(call) {
            ExecReply::stdout(SIGN_IN)
        } else if call.script().contains("exit 3") {
            ExecReply::stdout("AUTHENTICATION_SUCCESS\n")
        } else {
            ExecReply::ok()
        }
    });
    let manager = harness(&fake);

    let started = manager.bridge().start_login(&key()).await.unwrap();
    assert!(matches!(started, LoginResponse::WaitingForCode { .. }));

    let verified = manager.bridge().verify_code(&key(), "code-123").await.unwrap();

    assert!(verified.configured);
    assert!(!verified.acknowledged);
}

#[tokio::test]
async fn rejected_code_is_an_auth_error() {
    let release = Arc::new(Notify::new());
    let driver_release = Arc::clone(&release);
    let fake = FakeRuntime::with_handler(move |call| {
        if is_login_driver(call) {
            ExecReply {
                stdout: vec![SIGN_IN.as_bytes().to_vec()],
                later: Some((
                    Arc::clone(&driver_release),
                    vec![b"CODE_RECEIVED\r\nCODE_ERROR OAuth error: Invalid code\r\n".to_vec()],
                )),
                hang: true,
                ..ExecReply::default()
            }
        } else if is_code_write(call) {
            driver_release.notify_one();
            ExecReply::ok()
        } else {
            ExecReply::ok()
        }
    });
    let manager = harness(&fake);

    manager.bridge().start_login(&key()).await.unwrap();
    let error = manager
        .bridge()
        .verify_code(&key(), "wrong")
        .await
        .unwrap_err();

    match error {
        SandboxError::AuthError(detail) => assert!(detail.contains("CODE_ERROR")),
        other => panic!("expected AuthError, got {other:?}"),
    }
}

#[tokio::test]
async fn already_signed_in_needs_no_code() {
    let fake = FakeRuntime::with_handler(|call| {
        if is_login_driver(call) {
            ExecReply::stdout("ALREADY_AUTHENTICATED\r\n")
        } else {
            ExecReply::ok()
        }
    });
    let manager = harness(&fake);

    let started = manager.bridge().start_login(&key()).await.unwrap();

    assert_eq!(started, LoginResponse::AlreadyConfigured);
}
