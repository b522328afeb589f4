//! Streaming speech recognition client.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const AUDIO_BUFFER: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecognitionConfig {
    pub encoding: String,
    pub sample_rate_hertz: u32,
    /// Interleaved channels in each audio chunk.
    pub audio_channel_count: u8,
    pub language_code: String,
    pub interim_results: bool,
}

impl RecognitionConfig {
    /// 16-bit PCM at `sample_rate_hertz`, final results only.
    pub fn linear16(sample_rate_hertz: u32, audio_channel_count: u8, language_code: &str) -> Self {
        Self {
            encoding: "LINEAR16".to_string(),
            sample_rate_hertz,
            audio_channel_count,
            language_code: language_code.to_string(),
            interim_results: false,
        }
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        vec![
            ("encoding", self.encoding.clone()),
            ("sampleRateHertz", self.sample_rate_hertz.to_string()),
            ("audioChannelCount", self.audio_channel_count.to_string()),
            ("languageCode", self.language_code.clone()),
            ("interimResults", self.interim_results.to_string()),
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptSegment {
    pub text: String,
    pub is_final: bool,
    pub confidence: Option<f32>,
}

/// Both halves of one recognition session. Dropping `audio` ends the request
/// stream; `segments` closes once the service has sent everything.
pub struct RecognitionStream {
    pub audio: mpsc::Sender<Bytes>,
    pub segments: mpsc::Receiver<Result<TranscriptSegment>>,
}

#[async_trait]
pub trait SpeechRecognizer: Send + Sync {
    async fn open_stream(&self, config: RecognitionConfig) -> Result<RecognitionStream>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingResponse {
    #[serde(default)]
    results: Vec<StreamingResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StreamingResult {
    #[serde(default)]
    alternatives: Vec<Alternative>,
    #[serde(default)]
    is_final: bool,
}

#[derive(Debug, Deserialize)]
struct Alternative {
    #[serde(default)]
    transcript: String,
    confidence: Option<f32>,
}

/// Takes the top alternative of the first result, if any.
fn parse_response_line(line: &str) -> Result<Option<TranscriptSegment>> {
    let response: StreamingResponse =
        serde_json::from_str(line).context("Failed to parse recognition response")?;

    Ok(response.results.into_iter().next().and_then(|result| {
        let is_final = result.is_final;
        result
            .alternatives
            .into_iter()
            .next()
            .map(|alternative| TranscriptSegment {
                text: alternative.transcript,
                is_final,
                confidence: alternative.confidence,
            })
    }))
}

/// Posts raw audio as a chunked request body and reads newline-delimited JSON
/// recognition results from the response body.
pub struct HttpStreamingRecognizer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpStreamingRecognizer {
    pub fn new(endpoint: String, api_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            api_key,
        }
    }
}

#[async_trait]
impl SpeechRecognizer for HttpStreamingRecognizer {
    async fn open_stream(&self, config: RecognitionConfig) -> Result<RecognitionStream> {
        let (audio_tx, mut audio_rx) = mpsc::channel::<Bytes>(AUDIO_BUFFER);
        let (segment_tx, segment_rx) = mpsc::channel(AUDIO_BUFFER);

        // The request body is fed through an in-memory pipe.
        let (mut pipe_writer, pipe_reader) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            while let Some(chunk) = audio_rx.recv().await {
                if pipe_writer.write_all(&chunk).await.is_err() {
                    break;
                }
            }
            let _ = pipe_writer.shutdown().await;
        });

        let mut request = self
            .client
            .post(&self.endpoint)
            .query(&config.query())
            .header("content-type", "application/octet-stream")
            .body(reqwest::Body::wrap_stream(ReaderStream::new(pipe_reader)));
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) if response.status().is_success() => response,
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    let _ = segment_tx
                        .send(Err(anyhow!("recognizer returned {}: {}", status, body)))
                        .await;
                    return;
                }
                Err(err) => {
                    let _ = segment_tx
                        .send(Err(anyhow!("recognizer request failed: {}", err)))
                        .await;
                    return;
                }
            };

            let mut body = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();
            while let Some(chunk) = body.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        warn!("recognition stream interrupted: {}", err);
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    match parse_response_line(line) {
                        Ok(Some(segment)) => {
                            if segment_tx.send(Ok(segment)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => debug!("recognition response without results"),
                        Err(err) => {
                            if segment_tx.send(Err(err)).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        });

        Ok(RecognitionStream {
            audio: audio_tx,
            segments: segment_rx,
        })
    }
}
