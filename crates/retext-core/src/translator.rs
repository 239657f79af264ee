//! Instruction translator
//!
//! Turns a free-text editing prompt into a [`DirectiveSet`] by asking an
//! OpenAI-compatible chat-completions endpoint for strict JSON. This is the
//! only outbound network call the engine makes.

use crate::config::TranslatorConfig;
use crate::directive::{Directive, DirectiveSet};
use crate::error::{ParseError, TransportError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const SYSTEM_PROMPT: &str = r#"You convert a user's instruction about editing text in a PDF into find-and-replace directives.

Respond with ONLY valid JSON, no markdown and no explanation, using this schema:
{
  "directives": [
    {"original": "text to find", "replacement": "new text", "case_sensitive": false}
  ],
  "notes": "assumptions or limitations, or an empty string"
}

Rules:
1. Extract every find-and-replace pair in the instruction.
2. Set case_sensitive to true only when the user asks for exact casing.
3. If the instruction is ambiguous, pick the most likely reading and explain it in "notes".
4. Constraints you cannot express (for example "only in headings") go in "notes".
5. Instructions may be in any language.
6. For dates, emit every pair needed (for example "January" and "Jan").

Example:
User: "Replace 2025 with 2026"
Response: {"directives": [{"original": "2025", "replacement": "2026", "case_sensitive": false}], "notes": ""}"#;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: &str) -> Self {
        Self {
            role: role.to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

/// Assistant message text plus token usage, if reported
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub model: Option<String>,
    pub usage: Option<Usage>,
}

/// Transport to a chat-completions service
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError>;
}

/// `POST {base_url}/chat/completions` with a bearer key
#[derive(Debug, Clone)]
pub struct HttpCompletionClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpCompletionClient {
    pub fn new(config: &TranslatorConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.trim().is_empty()),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    model: Option<String>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, TransportError> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| TransportError::NotConfigured("no API key set".to_string()))?;

        let timeout_ms = self.timeout.as_millis() as u64;
        let classify = |e: reqwest::Error| {
            if e.is_timeout() {
                TransportError::Timeout(timeout_ms)
            } else if e.is_decode() || e.is_body() {
                TransportError::InvalidBody(e.to_string())
            } else {
                TransportError::Connection(e.to_string())
            }
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(api_key)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(classify)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: body.chars().take(200).collect(),
            });
        }

        let body: ChatResponse = response.json().await.map_err(classify)?;
        let content = body
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TransportError::InvalidBody("response has no message".to_string()))?;

        Ok(Completion {
            content,
            model: body.model,
            usage: body.usage,
        })
    }
}

/// Directives extracted from a prompt
#[derive(Debug, Clone, PartialEq)]
pub struct ParseResult {
    pub directives: DirectiveSet,
    /// Remarks from the model and entries that had to be dropped
    pub notes: Vec<String>,
    /// Some entries of the response were unusable
    pub partial: bool,
}

pub struct Translator {
    client: Arc<dyn CompletionClient>,
    config: TranslatorConfig,
}

impl Translator {
    pub fn new(client: Arc<dyn CompletionClient>, config: TranslatorConfig) -> Self {
        Self { client, config }
    }

    /// Translator talking HTTP to the configured endpoint
    pub fn from_config(config: TranslatorConfig) -> Self {
        let client = Arc::new(HttpCompletionClient::new(&config));
        Self::new(client, config)
    }

    pub async fn translate(&self, prompt: &str) -> Result<ParseResult, ParseError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(ParseError::EmptyPrompt);
        }

        let request = CompletionRequest {
            model: self.config.model.clone(),
            messages: vec![
                ChatMessage::new("system", SYSTEM_PROMPT),
                ChatMessage::new("user", prompt),
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let completion = match self.client.complete(&request).await {
            Ok(completion) => completion,
            Err(e) if e.is_transient() => {
                warn!(error = %e, backoff_ms = self.config.retry_backoff_ms, "translator call failed, retrying once");
                tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms)).await;
                self.client
                    .complete(&request)
                    .await
                    .map_err(|e| ParseError::Unavailable(e.to_string()))?
            }
            Err(e) => return Err(ParseError::Unavailable(e.to_string())),
        };

        if let Some(usage) = &completion.usage {
            info!(
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                total_tokens = usage.total_tokens,
                model = completion.model.as_deref().unwrap_or("unknown"),
                "translator usage"
            );
        }

        let result = parse_response(&completion.content, &self.config)?;
        debug!(
            directives = result.directives.len(),
            partial = result.partial,
            "prompt translated"
        );
        Ok(result)
    }
}

/// Remove a surrounding markdown code fence, if any.
fn strip_code_fences(content: &str) -> &str {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return trimmed;
    }
    let body = match trimmed.find('\n') {
        Some(newline) => &trimmed[newline + 1..],
        None => return trimmed.trim_matches('`'),
    };
    body.trim_end().trim_end_matches("```").trim()
}

fn notes_of(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect(),
        _ => Vec::new(),
    }
}

/// Validate a model response. Accepts `{"directives": [...]}` and the
/// older `{"replacements": {old: new}, "case_sensitive": bool}` shape.
pub fn parse_response(content: &str, config: &TranslatorConfig) -> Result<ParseResult, ParseError> {
    let json = strip_code_fences(content);
    let root: Value = serde_json::from_str(json).map_err(|e| {
        ParseError::MalformedResponse(format!("{}: {}", e, json.chars().take(200).collect::<String>()))
    })?;
    let root = root
        .as_object()
        .ok_or_else(|| ParseError::MalformedResponse("expected a JSON object".to_string()))?;

    let default_case = root
        .get("case_sensitive")
        .and_then(Value::as_bool)
        .unwrap_or(config.default_case_sensitive);
    let mut notes = notes_of(root.get("notes"));
    let mut candidates: Vec<Directive> = Vec::new();
    let mut dropped = 0usize;

    if let Some(entries) = root.get("directives") {
        let entries = entries
            .as_array()
            .ok_or_else(|| ParseError::MalformedResponse("'directives' is not a list".to_string()))?;
        for (i, entry) in entries.iter().enumerate() {
            match directive_from_entry(entry, default_case) {
                Ok(directive) => candidates.push(directive),
                Err(reason) => {
                    dropped += 1;
                    notes.push(format!("Dropped directive #{}: {}", i + 1, reason));
                }
            }
        }
    } else if let Some(map) = root.get("replacements") {
        let map = map.as_object().ok_or_else(|| {
            ParseError::MalformedResponse("'replacements' is not an object".to_string())
        })?;
        for (original, replacement) in map {
            let directive = replacement
                .as_str()
                .ok_or_else(|| "replacement is not a string".to_string())
                .and_then(|r| {
                    Directive::new(original.as_str(), r, default_case).map_err(|e| e.to_string())
                });
            match directive {
                Ok(directive) => candidates.push(directive),
                Err(reason) => {
                    dropped += 1;
                    notes.push(format!("Dropped replacement for '{}': {}", original, reason));
                }
            }
        }
    } else {
        return Err(ParseError::MalformedResponse(
            "response has neither 'directives' nor 'replacements'".to_string(),
        ));
    }

    let mut directives = DirectiveSet::from_directives(candidates);
    let extra = directives.truncate(config.max_directives);
    if extra > 0 {
        dropped += extra;
        notes.push(format!(
            "Dropped {} directive(s) beyond the limit of {}",
            extra, config.max_directives
        ));
    }

    if directives.is_empty() {
        let reason = if notes.is_empty() {
            "the response contained no directives".to_string()
        } else {
            notes.join("; ")
        };
        return Err(ParseError::NoUsableDirectives(reason));
    }

    let partial = dropped > 0;
    if partial {
        warn!(dropped, kept = directives.len(), "translator response partially usable");
    }

    Ok(ParseResult {
        directives,
        notes,
        partial,
    })
}

fn directive_from_entry(entry: &Value, default_case: bool) -> Result<Directive, String> {
    let object = entry.as_object().ok_or("entry is not an object")?;
    let original = object
        .get("original")
        .and_then(Value::as_str)
        .ok_or("missing string 'original'")?;
    let replacement = object
        .get("replacement")
        .and_then(Value::as_str)
        .ok_or("missing string 'replacement'")?;
    let case_sensitive = match object.get("case_sensitive") {
        None | Some(Value::Null) => default_case,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err("'case_sensitive' is not a boolean".to_string()),
    };
    Directive::new(original, replacement, case_sensitive).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<Completion, TransportError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(mut replies: Vec<Result<Completion, TransportError>>) -> Arc<Self> {
            replies.reverse();
            Arc::new(Self {
                replies: Mutex::new(replies),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl CompletionClient for Scripted {
        async fn complete(&self, _request: &CompletionRequest) -> Result<Completion, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Err(TransportError::Connection("script exhausted".into())))
        }
    }

    fn reply(content: &str) -> Result<Completion, TransportError> {
        Ok(Completion {
            content: content.to_string(),
            ..Completion::default()
        })
    }

    fn config() -> TranslatorConfig {
        TranslatorConfig {
            retry_backoff_ms: 1,
            ..TranslatorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_translate_year_prompt() {
        let client = Scripted::new(vec![reply(
            r#"{"directives":[{"original":"2025","replacement":"2026","case_sensitive":false}],"notes":""}"#,
        )]);
        let translator = Translator::new(client, config());
        let result = translator
            .translate("Replace all occurrences of 2025 with 2026")
            .await
            .unwrap();
        assert_eq!(result.directives.len(), 1);
        let d = &result.directives.directives()[0];
        assert_eq!((d.original(), d.replacement(), d.case_sensitive()), ("2025", "2026", false));
        assert!(!result.partial);
        assert!(result.notes.is_empty());
    }

    #[tokio::test]
    async fn test_empty_prompt_is_rejected_without_calling() {
        let client = Scripted::new(vec![]);
        let translator = Translator::new(client.clone(), config());
        assert_eq!(translator.translate("   ").await.unwrap_err(), ParseError::EmptyPrompt);
        assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transient_failure_retried_once() {
        let client = Scripted::new(vec![
            Err(TransportError::Timeout(30_000)),
            reply(r#"{"replacements":{"Draft":"Final"},"case_sensitive":true}"#),
        ]);
        let translator = Translator::new(client.clone(), config());
        let result = translator.translate("Draft -> Final").await.unwrap();
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
        assert!(result.directives.directives()[0].case_sensitive());
    }

    #[tokio::test]
    async fn test_second_failure_is_unavailable() {
        let client = Scripted::new(vec![
            Err(TransportError::Connection("refused".into())),
            Err(TransportError::Connection("refused".into())),
        ]);
        let translator = Translator::new(client.clone(), config());
        let err = translator.translate("Replace a with b").await.unwrap_err();
        assert!(matches!(err, ParseError::Unavailable(_)));
        assert_eq!(client.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_not_retried() {
        let client = Scripted::new(vec![Err(TransportError::Status {
            status: 401,
            body: "bad key".into(),
        })]);
        let translator = Translator::new(client.clone(), config());
        assert!(matches!(
            translator.translate("Replace a with b").await,
            Err(ParseError::Unavailable(_))
        ));
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_unavailable() {
        let translator = Translator::from_config(TranslatorConfig {
            api_key: None,
            ..config()
        });
        assert!(matches!(
            translator.translate("Replace a with b").await,
            Err(ParseError::Unavailable(msg)) if msg.contains("not configured")
        ));
    }

    #[test]
    fn test_code_fences_are_stripped() {
        let fenced = "```json\n{\"replacements\": {\"a\": \"b\"}}\n```";
        let result = parse_response(fenced, &config()).unwrap();
        assert_eq!(result.directives.len(), 1);
        assert_eq!(strip_code_fences("  {\"x\":1} "), "{\"x\":1}");
    }

    #[test]
    fn test_invalid_entries_dropped_with_notes() {
        let content = r#"{"directives":[
            {"original":"2025","replacement":"2026"},
            {"original":"","replacement":"x"},
            {"original":"a","replacement":3},
            "not an object"
        ],"notes":"assumed all years"}"#;
        let result = parse_response(content, &config()).unwrap();
        assert_eq!(result.directives.len(), 1);
        assert!(result.partial);
        assert_eq!(result.notes.len(), 4);
        assert_eq!(result.notes[0], "assumed all years");
    }

    #[test]
    fn test_case_flag_falls_back_to_top_level_then_config() {
        let content = r#"{"case_sensitive":true,"directives":[
            {"original":"A","replacement":"B"},
            {"original":"C","replacement":"D","case_sensitive":false}
        ]}"#;
        let result = parse_response(content, &config()).unwrap();
        let flags: Vec<bool> = result
            .directives
            .directives()
            .iter()
            .map(|d| d.case_sensitive())
            .collect();
        assert_eq!(flags, vec![true, false]);

        let strict = TranslatorConfig {
            default_case_sensitive: true,
            ..config()
        };
        let result = parse_response(r#"{"directives":[{"original":"A","replacement":"B"}]}"#, &strict).unwrap();
        assert!(result.directives.directives()[0].case_sensitive());
    }

    #[test]
    fn test_directive_limit() {
        let entries: Vec<String> = (0..5)
            .map(|i| format!(r#"{{"original":"w{}","replacement":"x"}}"#, i))
            .collect();
        let content = format!(r#"{{"directives":[{}]}}"#, entries.join(","));
        let limited = TranslatorConfig {
            max_directives: 3,
            ..config()
        };
        let result = parse_response(&content, &limited).unwrap();
        assert_eq!(result.directives.len(), 3);
        assert!(result.partial);
        assert!(result.notes.iter().any(|n| n.contains("limit of 3")));
    }

    #[test]
    fn test_directive_limit_counts_unique_originals() {
        let content = r#"{"directives":[
            {"original":"2025","replacement":"2026"},
            {"original":"2025","replacement":"2026"},
            {"original":"Draft","replacement":"Final"},
            {"original":"2025","replacement":"2027"},
            {"original":"ACME","replacement":"Acme"}
        ]}"#;
        let limited = TranslatorConfig {
            max_directives: 3,
            ..config()
        };
        let result = parse_response(content, &limited).unwrap();
        let originals: Vec<&str> = result
            .directives
            .directives()
            .iter()
            .map(|d| d.original())
            .collect();
        assert_eq!(originals, vec!["2025", "Draft", "ACME"]);
        assert_eq!(result.directives.directives()[0].replacement(), "2027");
        assert!(!result.partial);
        assert!(!result.notes.iter().any(|n| n.contains("limit")));
    }

    #[test]
    fn test_unusable_responses() {
        assert!(matches!(
            parse_response("Sure! Here you go", &config()),
            Err(ParseError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_response(r#"{"edits":[]}"#, &config()),
            Err(ParseError::MalformedResponse(_))
        ));
        assert!(matches!(
            parse_response(r#"{"directives":[]}"#, &config()),
            Err(ParseError::NoUsableDirectives(_))
        ));
        assert!(matches!(
            parse_response(r#"{"directives":[{"original":""}]}"#, &config()),
            Err(ParseError::NoUsableDirectives(_))
        ));
    }
}
