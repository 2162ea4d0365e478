//! Caller-supplied LLM and embedder callables, plus the parsing helpers the
//! engines use to turn free-form LLM output into structured data.
//!
//! Both callables are synchronous and may be slow. The engines never hold a
//! database transaction open while one of them runs.

use std::sync::OnceLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::MnemosError;

pub type CallableError = Box<dyn std::error::Error + Send + Sync>;

/// Text in, text out.
pub trait Llm: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, CallableError>;
}

impl<F> Llm for F
where
    F: Fn(&str) -> Result<String, CallableError> + Send + Sync,
{
    fn complete(&self, prompt: &str) -> Result<String, CallableError> {
        self(prompt)
    }
}

/// Text in, fixed-dimension vector out.
pub trait Embedder: Send + Sync {
    fn embed(&self, text: &str) -> Result<Vec<f32>, CallableError>;
}

impl<F> Embedder for F
where
    F: Fn(&str) -> Result<Vec<f32>, CallableError> + Send + Sync,
{
    fn embed(&self, text: &str) -> Result<Vec<f32>, CallableError> {
        self(text)
    }
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*(.*?)\s*```$").expect("static regex"))
}

/// Strip a surrounding markdown code fence, if any.
pub fn strip_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    match fence_re().captures(trimmed).and_then(|c| c.get(1)) {
        Some(m) => m.as_str(),
        None => trimmed,
    }
}

/// Ask the LLM and parse its answer as JSON. On a parse failure the model is
/// re-asked with the error and its own bad output, up to `retries` times.
pub fn parse_json_response<T: DeserializeOwned>(
    llm: &dyn Llm,
    prompt: &str,
    retries: usize,
    user_id: &str,
    stage: &'static str,
) -> Result<T, MnemosError> {
    let mut raw = llm
        .complete(prompt)
        .map_err(|e| MnemosError::extraction(user_id, stage, e))?;
    let mut attempt = 0;
    loop {
        match serde_json::from_str::<T>(strip_fences(&raw)) {
            Ok(v) => return Ok(v),
            Err(e) if attempt < retries => {
                attempt += 1;
                debug!(stage, attempt, error = %e, "invalid JSON from LLM, re-asking");
                let retry = crate::prompts::json_retry(prompt, &raw, &e.to_string());
                raw = llm
                    .complete(&retry)
                    .map_err(|e| MnemosError::extraction(user_id, stage, e))?;
            }
            Err(e) => {
                return Err(MnemosError::extraction(
                    user_id,
                    stage,
                    format!("unparseable output: {e}"),
                ))
            }
        }
    }
}

/// YES/NO judgement, decided by the first word of the answer.
pub fn parse_bool_response(
    llm: &dyn Llm,
    prompt: &str,
    user_id: &str,
    stage: &'static str,
) -> Result<bool, MnemosError> {
    let raw = llm
        .complete(prompt)
        .map_err(|e| MnemosError::extraction(user_id, stage, e))?;
    Ok(leading_yes(&raw))
}

/// True when the first word is YES, ignoring case, fences and punctuation.
fn leading_yes(raw: &str) -> bool {
    raw.split(|c: char| !c.is_alphanumeric())
        .find(|w| !w.is_empty())
        .is_some_and(|w| w.eq_ignore_ascii_case("yes"))
}

/// Plain text answer, trimmed. Empty output is treated as a failure.
pub fn complete_text(
    llm: &dyn Llm,
    prompt: &str,
    user_id: &str,
    stage: &'static str,
) -> Result<String, MnemosError> {
    let raw = llm
        .complete(prompt)
        .map_err(|e| MnemosError::extraction(user_id, stage, e))?;
    let text = raw.trim();
    if text.is_empty() {
        return Err(MnemosError::extraction(user_id, stage, "empty output"));
    }
    Ok(text.to_string())
}

pub fn embed_text(
    embedder: &dyn Embedder,
    text: &str,
    user_id: &str,
) -> Result<Vec<f32>, MnemosError> {
    let v = embedder
        .embed(text)
        .map_err(|e| MnemosError::extraction(user_id, "embed", e))?;
    if v.is_empty() || v.iter().any(|x| !x.is_finite()) {
        return Err(MnemosError::extraction(user_id, "embed", "embedder returned an invalid vector"));
    }
    Ok(v)
}

/// Cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut na, mut nb) = (0.0f64, 0.0f64, 0.0f64);
    for i in 0..a.len() {
        let (ai, bi) = (a[i] as f64, b[i] as f64);
        dot += ai * bi;
        na += ai * ai;
        nb += bi * bi;
    }
    let denom = na.sqrt() * nb.sqrt();
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Serialize an f32 vector to bytes (little-endian) for SQLite BLOB storage.
pub fn embedding_to_bytes(v: &[f32]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(v.len() * 4);
    for &f in v {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    buf
}

/// Deserialize bytes back to an f32 vector. Trailing partial chunks are dropped.
pub fn bytes_to_embedding(b: &[u8]) -> Vec<f32> {
    b.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
