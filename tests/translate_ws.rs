//! Streaming translation protocol scenarios, driven through the
//! orchestrator with an in-memory sink in place of the socket.

mod common;

use common::{test_state, RecordingLoader};
use futures::channel::mpsc;
use futures::StreamExt;
use std::sync::Arc;
use translate_stream_core::api::ServerMessage;
use translate_stream_core::server::orchestrator::TranslationOrchestrator;

/// Run frames through one "connection" and collect everything it sent
async fn run_connection(loader: Arc<RecordingLoader>, frames: &[&str]) -> Vec<ServerMessage> {
    let state = test_state(loader);
    let orchestrator = TranslationOrchestrator::from_state(&state);
    let (mut tx, rx) = mpsc::unbounded();
    for frame in frames {
        orchestrator.handle_frame(frame, &mut tx).await.unwrap();
    }
    drop(tx);
    rx.collect().await
}

fn error_text(message: &ServerMessage) -> Option<&str> {
    match message {
        ServerMessage::Error { error, .. } => Some(error),
        _ => None,
    }
}

#[tokio::test]
async fn test_traditional_chinese_streams_chunks_then_done() {
    let loader = Arc::new(RecordingLoader::new(&["你好", "，", "世界"]));
    let out = run_connection(
        loader.clone(),
        &[r#"{"type":"text","source_lang":"en","target_lang":"zh-TW","content":"Hello, world"}"#],
    )
    .await;

    assert_eq!(
        out,
        vec![
            ServerMessage::chunk("你好"),
            ServerMessage::chunk("，"),
            ServerMessage::chunk("世界"),
            ServerMessage::done(),
        ]
    );

    let prompts = loader.prompts();
    assert_eq!(prompts.len(), 1);
    assert!(prompts[0].contains("zh-TW"));
    assert!(prompts[0].contains("Translate the following text into Traditional Chinese (繁體中文):\nHello, world"));
}

#[tokio::test]
async fn test_image_request_is_rejected_and_connection_stays_usable() {
    let loader = Arc::new(RecordingLoader::new(&["Bonjour"]));
    let out = run_connection(
        loader.clone(),
        &[
            r#"{"type":"image","image_data":"aGVsbG8=","source_lang":"en","target_lang":"fr"}"#,
            r#"{"type":"text","source_lang":"en","target_lang":"fr","content":"Hello"}"#,
        ],
    )
    .await;

    assert_eq!(out.len(), 3);
    assert_eq!(error_text(&out[0]), Some("Only text supported, got 'image'"));
    assert_eq!(out[1], ServerMessage::chunk("Bonjour"));
    assert_eq!(out[2], ServerMessage::done());
    // only the text request reached the generator
    assert_eq!(loader.prompts().len(), 1);
}

#[tokio::test]
async fn test_invalid_json_then_valid_request() {
    let loader = Arc::new(RecordingLoader::new(&["Hola"]));
    let out = run_connection(
        loader,
        &["{\"content\": ", r#"{"content":"Hello","target_lang":"es"}"#],
    )
    .await;

    assert_eq!(out.len(), 3);
    assert_eq!(error_text(&out[0]), Some("Invalid JSON"));
    assert_eq!(out[1], ServerMessage::chunk("Hola"));
    assert_eq!(out[2], ServerMessage::done());
}

#[tokio::test]
async fn test_blank_content_is_a_validation_error() {
    let loader = Arc::new(RecordingLoader::new(&["unused"]));
    let out = run_connection(loader.clone(), &[r#"{"content":""}"#]).await;

    assert_eq!(out.len(), 1);
    match &out[0] {
        ServerMessage::Error { details, .. } => {
            assert_eq!(details.as_ref().unwrap()["kind"], "validation_error");
        }
        other => panic!("expected an error frame, got {:?}", other),
    }
    assert!(loader.loads().is_empty());
}

#[tokio::test]
async fn test_first_request_loads_hinted_model() {
    let loader = Arc::new(RecordingLoader::new(&["ok"]));
    run_connection(loader.clone(), &[r#"{"content":"Hello","model":"12b"}"#]).await;
    assert_eq!(loader.loads(), vec!["google/translategemma-12b-it".to_string()]);
}
