//! Language-model relevance oracle over an OpenAI-compatible chat API.
//!
//! Two reply modes are supported. In scalar mode the model answers with a
//! bare grade and the first token of the reply is parsed. In
//! explanation mode the model must call the `annotate_relevance` function
//! with a JSON `{score, explanation}` argument object.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::label_store::Grade;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "o4-mini";
pub const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";
pub const DEFAULT_MAX_DOCUMENT_CHARS: usize = 10_000;
pub const DEFAULT_DELAY: Duration = Duration::from_secs(1);

const TOOL_NAME: &str = "annotate_relevance";

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a relevance assessor for a \
personal web archive search engine. Given a search query and a saved web page, \
judge how well the page satisfies the query. Use this scale: 0 = not relevant, \
1 = relevant (partially answers the query or is on topic), 2 = highly relevant \
(directly and substantially answers the query). Reply with the single digit only.";

const EXPLAIN_SYSTEM_PROMPT_SUFFIX: &str = " Report your judgment by calling the \
annotate_relevance function with the score and a one or two sentence explanation.";

/// A single graded judgment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Judgment {
    pub grade: Grade,
    pub explanation: Option<String>,
}

/// Anything that can grade a document for a query.
pub trait RelevanceOracle {
    /// Grade `document` against `query`.
    ///
    /// Fails with [`Error::InvalidGrade`] when the reply cannot be read as a
    /// grade in `0..=2`.
    fn judge(&self, query: &str, document: &str) -> Result<Judgment>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleSettings {
    pub endpoint: String,
    pub model: String,
    pub api_key: Option<String>,
    pub system_prompt: String,
    pub max_document_chars: usize,
    pub with_explanation: bool,
    /// Pause between consecutive oracle calls.
    pub delay: Duration,
}

impl Default for OracleSettings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            max_document_chars: DEFAULT_MAX_DOCUMENT_CHARS,
            with_explanation: false,
            delay: DEFAULT_DELAY,
        }
    }
}

/// Build the user message, truncating the document to `max_chars`
/// characters.
pub fn user_prompt(query: &str, document: &str, max_chars: usize) -> String {
    let cut = document
        .char_indices()
        .nth(max_chars)
        .map_or(document.len(), |(i, _)| i);
    format!("Query: {query}\n\nDocument:\n{}", &document[..cut])
}

/// Read a grade from the first whitespace-delimited token of a plain reply.
///
/// Trailing punctuation on the token is ignored, so `"2."` reads as 2, but
/// the rest must be exactly `0`, `1` or `2`.
pub fn parse_scalar_reply(reply: &str) -> Result<Grade> {
    reply
        .split_whitespace()
        .next()
        .map(|token| token.trim_end_matches(|c: char| c.is_ascii_punctuation()))
        .and_then(|token| token.parse::<u8>().ok())
        .and_then(Grade::new)
        .ok_or_else(|| Error::InvalidGrade(reply.to_string()))
}

#[derive(Debug, Deserialize)]
struct ToolArguments {
    score: i64,
    #[serde(default)]
    explanation: Option<String>,
}

/// Read a judgment from the JSON arguments of an `annotate_relevance` call.
pub fn parse_tool_arguments(arguments: &str) -> Result<Judgment> {
    let args: ToolArguments = serde_json::from_str(arguments)
        .map_err(|_| Error::InvalidGrade(arguments.to_string()))?;
    Ok(Judgment {
        grade: Grade::try_from(args.score)?,
        explanation: args.explanation.filter(|e| !e.trim().is_empty()),
    })
}

// -- Wire types --

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<MessageRequest<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    role: &'a str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Option<MessageContent>,
}

#[derive(Debug, Deserialize)]
struct MessageContent {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCallResponse>,
}

#[derive(Debug, Deserialize)]
struct ToolCallResponse {
    function: FunctionCallResponse,
}

#[derive(Debug, Deserialize)]
struct FunctionCallResponse {
    name: String,
    arguments: String,
}

fn annotate_tool() -> serde_json::Value {
    json!({
        "type": "function",
        "function": {
            "name": TOOL_NAME,
            "description": "Record the relevance grade of the document for the query.",
            "parameters": {
                "type": "object",
                "properties": {
                    "score": {
                        "type": "integer",
                        "enum": [0, 1, 2],
                        "description": "0 = not relevant, 1 = relevant, 2 = highly relevant"
                    },
                    "explanation": {
                        "type": "string",
                        "description": "Short justification for the score."
                    }
                },
                "required": ["score", "explanation"]
            }
        }
    })
}

/// Oracle backed by a chat-completions endpoint.
pub struct ChatOracle {
    client: reqwest::blocking::Client,
    settings: OracleSettings,
}

impl ChatOracle {
    pub fn new(settings: OracleSettings) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .map_err(|e| Error::Oracle(e.to_string()))?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &OracleSettings {
        &self.settings
    }

    fn request(&self, query: &str, document: &str) -> Result<MessageContent> {
        let mut system = self.settings.system_prompt.clone();
        if self.settings.with_explanation {
            system.push_str(EXPLAIN_SYSTEM_PROMPT_SUFFIX);
        }

        let request = ChatRequest {
            model: &self.settings.model,
            messages: vec![
                MessageRequest {
                    role: "system",
                    content: system,
                },
                MessageRequest {
                    role: "user",
                    content: user_prompt(
                        query,
                        document,
                        self.settings.max_document_chars,
                    ),
                },
            ],
            tools: self.settings.with_explanation.then(|| vec![annotate_tool()]),
            tool_choice: self.settings.with_explanation.then(|| {
                json!({"type": "function", "function": {"name": TOOL_NAME}})
            }),
        };

        debug!(
            url = %self.settings.endpoint,
            model = %self.settings.model,
            "sending oracle request"
        );

        let mut builder = self.client.post(&self.settings.endpoint);
        if let Some(key) = &self.settings.api_key {
            builder = builder.bearer_auth(key);
        } else {
            warn!("no API key configured for the relevance oracle");
        }

        let response = builder
            .json(&request)
            .send()
            .map_err(|e| Error::Oracle(format!("network error: {e}")))?;
        let status = response.status();
        let body = response
            .text()
            .map_err(|e| Error::Oracle(format!("reading response: {e}")))?;

        if !status.is_success() {
            let preview: String = body.chars().take(500).collect();
            warn!(status = status.as_u16(), body = %preview, "oracle request failed");
            return Err(Error::Oracle(format!(
                "HTTP {}: {preview}",
                status.as_u16()
            )));
        }

        let parsed: ChatResponse = serde_json::from_str(&body)?;
        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .ok_or_else(|| Error::Oracle("response contained no message".into()))
    }
}

impl RelevanceOracle for ChatOracle {
    fn judge(&self, query: &str, document: &str) -> Result<Judgment> {
        let message = self.request(query, document)?;

        if self.settings.with_explanation {
            let call = message
                .tool_calls
                .iter()
                .find(|c| c.function.name == TOOL_NAME)
                .ok_or_else(|| {
                    Error::InvalidGrade(
                        message.content.clone().unwrap_or_default(),
                    )
                })?;
            return parse_tool_arguments(&call.function.arguments);
        }

        let reply = message.content.unwrap_or_default();
        Ok(Judgment {
            grade: parse_scalar_reply(&reply)?,
            explanation: None,
        })
    }
}

impl std::fmt::Debug for ChatOracle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatOracle")
            .field("endpoint", &self.settings.endpoint)
            .field("model", &self.settings.model)
            .finish_non_exhaustive()
    }
}
