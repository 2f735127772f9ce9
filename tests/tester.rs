//! ApiTester: engine gating, per-key results, masking.

use std::sync::Arc;

use lingo::args::thinking::ThinkingMatrix;
use lingo::config::Config;
use lingo::dispatch::client_pool::ClientPool;
use lingo::engine::{Engine, EngineStatus};
use lingo::model::{ApiFormat, ModelConfig};
use lingo::requester::Services;
use lingo::tester::{ApiTester, TesterError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_test::{assert_err, assert_ok};

const GOOD_KEY: &str = "sk-good-0123456789abcdef";
const BAD_KEY: &str = "sk-bad-0123456789abcdefgh";

async fn read_request(socket: &mut TcpStream) -> String {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = socket.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&data);
        if let Some(end) = text.find("\r\n\r\n") {
            let content_length = text[..end]
                .lines()
                .filter_map(|line| line.split_once(':'))
                .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
                .and_then(|(_, value)| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if data.len() >= end + 4 + content_length {
                break;
            }
        }
    }
    String::from_utf8_lossy(&data).into_owned()
}

/// Answer OK for `GOOD_KEY` and 401 for anything else.
async fn key_checking_server(connections: usize) -> (u16, tokio::task::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = tokio::spawn(async move {
        for _ in 0..connections {
            let (mut socket, _) = listener.accept().await.unwrap();
            let request = read_request(&mut socket).await;
            let response = if request.contains(GOOD_KEY) {
                "HTTP/1.1 200 OK\r\n\
                 Content-Type: text/event-stream\r\n\
                 Connection: close\r\n\r\n\
                 data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"0\\\":\\\"魔导具师妲莉亚永不妥协\\\"}\"}}]}\n\n\
                 data: {\"choices\":[],\"usage\":{\"prompt_tokens\":40,\"completion_tokens\":12}}\n\n\
                 data: [DONE]\n\n"
            } else {
                "HTTP/1.1 401 Unauthorized\r\n\
                 Content-Length: 11\r\n\
                 Connection: close\r\n\r\n\
                 invalid key"
            };
            socket.write_all(response.as_bytes()).await.unwrap();
        }
    });
    (port, handle)
}

fn services(engine: &Arc<Engine>) -> Services {
    Services {
        pool: Arc::new(ClientPool::default()),
        tracker: engine.clone(),
        matrix: Arc::new(ThinkingMatrix::builtin()),
    }
}

fn model(port: u16, api_key: &str) -> ModelConfig {
    ModelConfig {
        id: "tester".into(),
        api_format: ApiFormat::OpenAi,
        api_url: format!("http://127.0.0.1:{port}/v1"),
        api_key: api_key.into(),
        model_id: "qwen-plus".into(),
        ..Default::default()
    }
}

#[tokio::test]
async fn tests_every_key_and_reports_each() {
    let (port, server) = key_checking_server(2).await;
    let engine = Arc::new(Engine::new());
    let config = Config::default();
    let tester = ApiTester::new(&config, &engine, services(&engine));

    let result = assert_ok!(
        tester
            .run(&model(port, &format!("{GOOD_KEY}\n{BAD_KEY}")))
            .await
    );

    assert!(!result.success);
    assert_eq!(result.total_count, 2);
    assert_eq!((result.success_count, result.failure_count), (1, 1));

    let good = &result.key_results[0];
    assert!(good.success);
    assert_eq!((good.input_tokens, good.output_tokens), (40, 12));
    assert!(good.error_reason.is_empty());
    assert_eq!(good.masked_key, "sk-good-********89abcdef");

    let bad = &result.key_results[1];
    assert!(!bad.success);
    assert!(
        bad.error_reason.contains("authentication failed"),
        "{}",
        bad.error_reason
    );
    assert!(!bad.error_reason.contains("invalid key"), "{}", bad.error_reason);
    assert!(!bad.masked_key.contains("0123456789"));

    assert_eq!(
        result.total_response_time_ms,
        good.response_time_ms + bad.response_time_ms
    );
    assert_eq!(engine.status(), EngineStatus::Idle);
    assert_eq!(engine.request_in_flight(), 0);
    server.await.unwrap();
}

#[tokio::test]
async fn all_good_keys_succeed() {
    let (port, server) = key_checking_server(1).await;
    let engine = Arc::new(Engine::new());
    let config = Config::default();
    let tester = ApiTester::new(&config, &engine, services(&engine));

    let result = assert_ok!(tester.run(&model(port, GOOD_KEY)).await);

    assert!(result.success);
    assert_eq!(result.success_count, 1);
    assert!(result.result_msg.contains("1 succeeded"), "{}", result.result_msg);
    server.await.unwrap();
}

#[tokio::test]
async fn refuses_when_engine_busy() {
    let engine = Arc::new(Engine::new());
    engine.set_status(EngineStatus::Translating);
    let config = Config::default();
    let tester = ApiTester::new(&config, &engine, services(&engine));

    let err = assert_err!(tester.run(&model(9, GOOD_KEY)).await);

    assert!(matches!(err, TesterError::Busy));
    assert_eq!(engine.status(), EngineStatus::Translating);
}

#[tokio::test]
async fn failed_run_returns_engine_to_idle() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let engine = Arc::new(Engine::new());
    let config = Config::default();
    let tester = ApiTester::new(&config, &engine, services(&engine));

    let result = assert_ok!(tester.run(&model(port, BAD_KEY)).await);

    assert!(!result.success);
    assert_eq!(result.failure_count, 1);
    assert!(!result.key_results[0].error_reason.is_empty());
    assert_eq!(engine.status(), EngineStatus::Idle);
}
