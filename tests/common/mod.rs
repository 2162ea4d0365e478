//! Deterministic stand-ins for the caller's LLM and embedder.
#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mnemos::{AgentMemory, CallableError, Embedder, Llm, MemoryMode};

pub const DAY_MS: i64 = 86_400_000;

const VOCAB: &[&str] = &["python", "coffee", "acme", "globex", "tea", "berlin"];

/// One dimension per vocabulary word plus a constant bias, so texts sharing
/// the same vocabulary words embed identically.
pub fn keyword_embed(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v: Vec<f32> = VOCAB
        .iter()
        .map(|w| if lower.contains(w) { 1.0 } else { 0.0 })
        .collect();
    v.push(0.1);
    v
}

pub fn embedder() -> Arc<dyn Embedder> {
    Arc::new(|t: &str| -> Result<Vec<f32>, CallableError> { Ok(keyword_embed(t)) })
}

pub fn failing_embedder() -> Arc<dyn Embedder> {
    Arc::new(|_t: &str| -> Result<Vec<f32>, CallableError> { Err("embedding service down".into()) })
}

/// Lines of the form "- x" after `marker` (or in the whole prompt).
fn bullets(prompt: &str, marker: Option<&str>) -> Vec<String> {
    let section = match marker.and_then(|m| prompt.find(m).map(|i| &prompt[i + m.len()..])) {
        Some(s) => s,
        None => prompt,
    };
    section
        .lines()
        .filter_map(|l| l.strip_prefix("- "))
        .map(str::to_string)
        .collect()
}

fn between<'a>(prompt: &'a str, start: &str, end: &str) -> &'a str {
    let Some(i) = prompt.find(start) else { return "" };
    let rest = &prompt[i + start.len()..];
    match rest.find(end) {
        Some(j) => &rest[..j],
        None => rest,
    }
}

fn json<T: serde::Serialize>(v: &T) -> Result<String, CallableError> {
    Ok(serde_json::to_string(v)?)
}

/// Answers every prompt the engines send, keyed on the prompt's wording.
pub fn stub_complete(prompt: &str) -> Result<String, CallableError> {
    if prompt.contains("Extract discrete, atomic facts") {
        let text = between(prompt, "Text:\n", "\n\nReturn");
        let items: Vec<serde_json::Value> = text
            .split('.')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| serde_json::json!({ "content": format!("User says: {s}"), "category_hint": "notes" }))
            .collect();
        return json(&items);
    }
    if prompt.contains("Assign each memory item") {
        let items = bullets(prompt, Some("Items:\n"));
        let out: Vec<serde_json::Value> = items
            .iter()
            .map(|i| {
                let cat = if i.to_lowercase().contains("python") { "preferences" } else { "general" };
                serde_json::json!({ "content": i, "category": cat })
            })
            .collect();
        return json(&out);
    }
    if prompt.contains("Pick the memory categories") {
        return Ok(r#"["preferences"]"#.into());
    }
    if prompt.contains("enough information") {
        return Ok("NO".into());
    }
    if prompt.contains("knowledge-graph triplets") {
        let text = between(prompt, "Text:\n", "\n\nReturn").to_lowercase();
        let mut out = Vec::new();
        if text.contains("acme") {
            out.push(serde_json::json!({"subject": "User", "predicate": "works_at", "object": "Acme", "status": "current"}));
        }
        if text.contains("tea") {
            out.push(serde_json::json!({"subject": "User", "predicate": "likes", "object": "tea", "status": "probably"}));
        }
        return json(&out);
    }
    if prompt.contains("List the entities") {
        return Ok("[]".into());
    }
    if prompt.contains("Rewrite this user message") {
        let message = between(prompt, "User message: ", "\n");
        if message.contains("drink") {
            return Ok("\"coffee habits\"".into());
        }
        return Ok(message.to_string());
    }
    if prompt.contains("Merge them into ONE") {
        return Ok(bullets(prompt, None).join("; "));
    }
    if prompt.contains("Write the current summary") {
        return Ok(format!("Summary: {}", bullets(prompt, Some("Items:\n")).join("; ")));
    }
    if prompt.contains("long-term record") {
        let items = bullets(prompt, Some("Older items not yet reflected in it:"));
        return Ok(format!("Addendum: {}", items.join("; ")));
    }
    Err(format!("unexpected prompt: {}", prompt.lines().next().unwrap_or_default()).into())
}

pub fn llm() -> Arc<dyn Llm> {
    Arc::new(stub_complete)
}

/// Counts calls, then answers like `stub_complete`.
pub fn counting_llm(calls: Arc<AtomicUsize>) -> Arc<dyn Llm> {
    Arc::new(move |p: &str| -> Result<String, CallableError> {
        calls.fetch_add(1, Ordering::SeqCst);
        stub_complete(p)
    })
}

pub fn failing_llm() -> Arc<dyn Llm> {
    Arc::new(|_p: &str| -> Result<String, CallableError> { Err("model overloaded".into()) })
}

/// Tool-mode file memory with an embedder.
pub fn file_memory() -> AgentMemory {
    AgentMemory::builder().embedder(embedder()).build().expect("memory")
}

/// File memory whose maintenance jobs have an LLM to call.
pub fn file_memory_with_llm() -> AgentMemory {
    AgentMemory::builder()
        .embedder(embedder())
        .llm(llm())
        .build()
        .expect("memory")
}

pub fn graph_memory() -> AgentMemory {
    AgentMemory::builder()
        .mode(MemoryMode::Graph)
        .embedder(embedder())
        .build()
        .expect("memory")
}
