//! HTTP contract tests for the LLM and TTS clients against a mock server.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use aria::config::{LlmConfig, TtsConfig};
use aria::llm::{HttpLlm, LanguageModel};
use aria::tts::{HttpTts, SpeechSynthesizer};
use std::io::Cursor;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn sse_body(deltas: &[&str]) -> String {
    let mut body = String::new();
    for delta in deltas {
        let chunk = serde_json::json!({
            "choices": [{"delta": {"content": delta}}]
        });
        body.push_str(&format!("data: {chunk}\n\n"));
    }
    body.push_str("data: [DONE]\n\n");
    body
}

#[tokio::test]
async fn llm_assembles_streamed_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(body_partial_json(serde_json::json!({"stream": true})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(sse_body(&["Hello", " there", "!"]), "text/event-stream"),
        )
        .mount(&server)
        .await;

    let llm = HttpLlm::new(&LlmConfig {
        api_url: server.uri(),
        ..LlmConfig::default()
    })
    .unwrap();

    let reply = llm
        .reply(&[], "hi", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, "Hello there!");
}

#[tokio::test]
async fn llm_sends_bearer_auth_when_key_configured() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(sse_body(&["ok"]), "text/event-stream"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let llm = HttpLlm::new(&LlmConfig {
        api_url: server.uri(),
        api_key: "sk-test".to_owned(),
        ..LlmConfig::default()
    })
    .unwrap();

    let reply = llm
        .reply(&[], "hi", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, "ok");
}

#[tokio::test]
async fn llm_error_status_is_a_pipeline_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream on fire"))
        .mount(&server)
        .await;

    let llm = HttpLlm::new(&LlmConfig {
        api_url: server.uri(),
        ..LlmConfig::default()
    })
    .unwrap();

    let err = llm
        .reply(&[], "hi", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn llm_pre_cancelled_token_aborts_before_sending() {
    let server = MockServer::start().await;
    // No mock mounted: a request reaching the server would 404 and the
    // error text would differ from the cancellation message.
    let llm = HttpLlm::new(&LlmConfig {
        api_url: server.uri(),
        ..LlmConfig::default()
    })
    .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = llm.reply(&[], "hi", &cancel).await.unwrap_err();
    assert!(err.to_string().contains("cancelled"));
}

fn wav_body(samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 24_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).unwrap();
        for &s in samples {
            writer.write_sample(s).unwrap();
        }
        writer.finalize().unwrap();
    }
    cursor.into_inner()
}

#[tokio::test]
async fn tts_decodes_wav_response() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/speech"))
        .and(body_partial_json(
            serde_json::json!({"input": "hello", "response_format": "wav"}),
        ))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(wav_body(&[0, 8_192, -8_192]), "audio/wav"),
        )
        .mount(&server)
        .await;

    let tts = HttpTts::new(&TtsConfig {
        api_url: server.uri(),
        ..TtsConfig::default()
    })
    .unwrap();

    let audio = tts
        .synthesize("hello", &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(audio.sample_rate, 24_000);
    assert_eq!(audio.samples.len(), 3);
}

#[tokio::test]
async fn tts_error_status_is_a_pipeline_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/speech"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let tts = HttpTts::new(&TtsConfig {
        api_url: server.uri(),
        ..TtsConfig::default()
    })
    .unwrap();

    let err = tts
        .synthesize("hello", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("503"));
}

#[tokio::test]
async fn tts_garbage_body_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/audio/speech"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(b"definitely not wav".to_vec(), "audio/wav"))
        .mount(&server)
        .await;

    let tts = HttpTts::new(&TtsConfig {
        api_url: server.uri(),
        ..TtsConfig::default()
    })
    .unwrap();

    assert!(
        tts.synthesize("hello", &CancellationToken::new())
            .await
            .is_err()
    );
}
