//! Scripted stand-ins for the AI engine and the PBX

use async_trait::async_trait;
use callwise_ingest::models::{PbxProfile, ResolvedPrompt, Stage};
use callwise_ingest::services::pbx_client::classify_status;
use callwise_ingest::services::{AudioInput, DownloadedRecording, EnrichmentEngine, PbxClient, Transcript};
use callwise_ingest::PipelineError;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub const DEFAULT_TRANSCRIPT: &str =
    "Agent: Thanks for calling. Caller: My order is two weeks late and I want a refund.";

/// One scripted engine reply
#[derive(Debug, Clone)]
pub enum EngineReply {
    /// Transcript text (transcription) or raw JSON (analysis)
    Transcript(String),
    Json(Value),
    Transient,
    Permanent,
}

fn default_reply(stage: Stage) -> EngineReply {
    match stage {
        Stage::Transcription => EngineReply::Transcript(DEFAULT_TRANSCRIPT.to_string()),
        Stage::Sentiment => EngineReply::Json(json!({"label": "negative", "score": -0.6})),
        Stage::Quality => EngineReply::Json(json!({"score": 72, "rationale": "Polite, no resolution offered"})),
        Stage::Compliance => EngineReply::Json(json!({
            "alerts": [{"rule": "refund_promise", "severity": "medium", "excerpt": "I want a refund"}]
        })),
        Stage::Summary => EngineReply::Json(json!({"summary": "Caller reports a late order and asks for a refund."})),
    }
}

/// EnrichmentEngine that replays queued replies per stage
///
/// An empty queue falls back to a well-formed default reply.
#[derive(Default)]
pub struct ScriptedEngine {
    scripts: Mutex<HashMap<Stage, VecDeque<EngineReply>>>,
    calls: Mutex<HashMap<Stage, usize>>,
    prompts: Mutex<Vec<(Stage, String)>>,
    gates: Mutex<HashMap<Stage, Arc<Notify>>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, stage: Stage, reply: EngineReply) {
        self.scripts
            .lock()
            .unwrap()
            .entry(stage)
            .or_default()
            .push_back(reply);
    }

    pub fn push_many(&self, stage: Stage, reply: EngineReply, count: usize) {
        for _ in 0..count {
            self.push(stage, reply.clone());
        }
    }

    /// Make calls for `stage` wait until `open` is called
    pub fn hold(&self, stage: Stage) {
        self.gates
            .lock()
            .unwrap()
            .insert(stage, Arc::new(Notify::new()));
    }

    pub fn open(&self, stage: Stage) {
        if let Some(gate) = self.gates.lock().unwrap().remove(&stage) {
            gate.notify_one();
        }
    }

    async fn wait_gate(&self, stage: Stage) {
        let gate = self.gates.lock().unwrap().get(&stage).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
    }

    pub fn calls(&self, stage: Stage) -> usize {
        self.calls.lock().unwrap().get(&stage).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().unwrap().values().sum()
    }

    /// Prompt identities seen for `stage`, in call order
    pub fn prompts_seen(&self, stage: Stage) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == stage)
            .map(|(_, identity)| identity.clone())
            .collect()
    }

    fn next(&self, stage: Stage, prompt: &ResolvedPrompt) -> EngineReply {
        *self.calls.lock().unwrap().entry(stage).or_insert(0) += 1;
        self.prompts.lock().unwrap().push((stage, prompt.identity()));
        self.scripts
            .lock()
            .unwrap()
            .get_mut(&stage)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| default_reply(stage))
    }
}

fn stage_error(stage: Stage, transient: bool) -> PipelineError {
    PipelineError::EnrichmentStage {
        stage,
        message: if transient {
            "engine returned 503".to_string()
        } else {
            "engine returned 400".to_string()
        },
        transient,
    }
}

#[async_trait]
impl EnrichmentEngine for ScriptedEngine {
    async fn transcribe(
        &self,
        _audio: &AudioInput,
        prompt: &ResolvedPrompt,
    ) -> Result<Transcript, PipelineError> {
        match self.next(Stage::Transcription, prompt) {
            EngineReply::Transcript(text) => Ok(Transcript {
                text,
                language: Some("en".to_string()),
            }),
            EngineReply::Json(value) => Ok(Transcript {
                text: value.to_string(),
                language: None,
            }),
            EngineReply::Transient => Err(stage_error(Stage::Transcription, true)),
            EngineReply::Permanent => Err(stage_error(Stage::Transcription, false)),
        }
    }

    async fn analyze(
        &self,
        stage: Stage,
        _transcript: &str,
        prompt: &ResolvedPrompt,
    ) -> Result<Value, PipelineError> {
        self.wait_gate(stage).await;
        match self.next(stage, prompt) {
            EngineReply::Json(value) => Ok(value),
            EngineReply::Transcript(text) => Ok(Value::String(text)),
            EngineReply::Transient => Err(stage_error(stage, true)),
            EngineReply::Permanent => Err(stage_error(stage, false)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum PbxReply {
    Audio(Vec<u8>),
    Status(u16),
}

/// PbxClient that replays queued replies; defaults to a small WAV body
#[derive(Default)]
pub struct MockPbx {
    replies: Mutex<VecDeque<PbxReply>>,
    references: Mutex<Vec<String>>,
}

impl MockPbx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, reply: PbxReply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    pub fn push_many(&self, reply: PbxReply, count: usize) {
        for _ in 0..count {
            self.push(reply.clone());
        }
    }

    pub fn calls(&self) -> usize {
        self.references.lock().unwrap().len()
    }

    pub fn references(&self) -> Vec<String> {
        self.references.lock().unwrap().clone()
    }
}

#[async_trait]
impl PbxClient for MockPbx {
    async fn download(
        &self,
        _profile: &PbxProfile,
        reference: &str,
    ) -> Result<DownloadedRecording, PipelineError> {
        self.references.lock().unwrap().push(reference.to_string());
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| PbxReply::Audio(b"RIFF\x24\x00\x00\x00WAVEfmt ".to_vec()));

        match reply {
            PbxReply::Audio(bytes) => Ok(DownloadedRecording {
                bytes,
                content_type: Some("audio/wav".to_string()),
            }),
            PbxReply::Status(code) => Err(classify_status(
                StatusCode::from_u16(code).unwrap(),
                "mock pbx",
            )),
        }
    }
}
