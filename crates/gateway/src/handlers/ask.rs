//! Question answering handler
//!
//! `POST /ask` resolves the scope and source, retrieves grounding context and
//! streams the answer back as newline-delimited JSON. Every outcome after
//! request validation, including retrieval failures, is delivered as a
//! stream whose last line has `done: true`.

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::{header, HeaderMap},
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use std::convert::Infallible;
use tracing::Instrument;
use uuid::Uuid;
use validator::Validate;

use crate::AppState;
use scoperag_common::{
    errors::{AppError, Result},
    scope::{ScopeSelector, SourceType},
};
use scoperag_search::{
    answer::prompt::{is_greeting, scope_fallback_notice},
    retrieval::NoResultReason,
    AnswerRequest, AnswerStream, AnswerStreamer, StreamChunk,
};

/// Header carrying the requested scope
pub const SCOPE_HEADER: &str = "x-qdrant-scope";

pub const NDJSON: &str = "application/x-ndjson";

/// Ask request
#[derive(Debug, Deserialize, Validate)]
pub struct AskRequest {
    #[validate(length(min = 1, max = 4000))]
    pub question: String,

    #[serde(default = "default_source")]
    pub source: String,

    /// Overrides the configured LLM model for this request
    #[serde(default)]
    #[validate(length(min = 1, max = 200))]
    pub model: Option<String>,
}

fn default_source() -> String {
    SourceType::Mail.as_str().to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct AskQuery {
    pub db_scope: Option<String>,
}

/// Scope from the header, then the query parameter, then the default
///
/// A value that is present but not a known scope is rejected rather than
/// replaced by the default.
pub fn resolve_scope(
    headers: &HeaderMap,
    query: &AskQuery,
    default: ScopeSelector,
) -> Result<ScopeSelector> {
    if let Some(value) = headers.get(SCOPE_HEADER) {
        let value = value.to_str().map_err(|_| AppError::InvalidScope {
            value: String::from_utf8_lossy(value.as_bytes()).into_owned(),
        })?;
        return Ok(value.parse()?);
    }

    match query.db_scope.as_deref() {
        Some(value) => Ok(value.parse()?),
        None => Ok(default),
    }
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Answer a question with a streamed NDJSON response
pub async fn ask(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<AskQuery>,
    Json(mut request): Json<AskRequest>,
) -> Result<Response> {
    request.question = request.question.trim().to_string();
    if request.question.is_empty() {
        return Err(AppError::EmptyQuestion);
    }

    request.validate().map_err(|e| AppError::Validation {
        message: e.to_string(),
        field: None,
    })?;

    let scope = resolve_scope(&headers, &query, state.config.qdrant.default_scope)?;
    let source: SourceType = request.source.parse()?;

    let span = tracing::info_span!(
        "ask",
        request_id = %request_id(&headers),
        scope = %scope,
        source = %source,
    );

    let stream = answer(&state, request, scope, source).instrument(span).await;
    Ok(ndjson_response(stream))
}

async fn answer(
    state: &AppState,
    request: AskRequest,
    scope: ScopeSelector,
    source: SourceType,
) -> AnswerStream {
    let chat = &state.config.chat;
    if is_greeting(&request.question, &chat.greetings) {
        tracing::info!("Greeting answered without retrieval");
        return AnswerStreamer::canned(chat.greeting_reply.clone(), Vec::new(), None);
    }

    let result = match state.retrieval.retrieve(&request.question, scope, source).await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(error = %e, code = ?e.code(), "Retrieval failed");
            return AnswerStreamer::error(e.to_string());
        }
    };

    let notice = result
        .scope_fallback
        .as_ref()
        .map(|event| scope_fallback_notice(event.fallback_from.as_str(), event.fallback_to.as_str()));

    if !result.is_found() {
        let reason = result.reason.unwrap_or(NoResultReason::BelowThreshold);
        tracing::info!(reason = ?reason, collection = ?result.collection, "No relevant results");
        return AnswerStreamer::no_results(source, reason, notice);
    }

    tracing::info!(
        collection = ?result.collection,
        scope_used = ?result.scope_used,
        fallback_used = result.fallback_used,
        hits = result.context.hits.len(),
        "Streaming answer"
    );

    state.streamer.stream_answer(AnswerRequest {
        question: request.question,
        source,
        context: result.context.text,
        references: result.references,
        model: request.model,
        notice,
    })
}

fn encode_line(chunk: &StreamChunk) -> Bytes {
    let mut line = serde_json::to_vec(chunk).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to encode stream chunk");
        br#"{"content":"","done":true,"error":"encoding failed"}"#.to_vec()
    });
    line.push(b'\n');
    Bytes::from(line)
}

/// Stream chunks as NDJSON lines
///
/// Dropping the response body (client disconnect) drops the chunk
/// receiver, which the streamer observes as cancellation.
pub fn ndjson_response(stream: AnswerStream) -> Response {
    let chunks = futures::stream::unfold(stream.into_receiver(), |mut rx| async move {
        let chunk = rx.recv().await?;
        Some((Ok::<_, Infallible>(encode_line(&chunk)), rx))
    });

    ([(header::CONTENT_TYPE, NDJSON)], Body::from_stream(chunks)).into_response()
}
