//! The version-aware mutation protocol, free of any I/O.
//!
//! Every operation is split in two halves. `prepare_*` validates input, reads
//! the tracker once to capture the expected version, and builds the request.
//! [`ContextProtocol::complete`] maps the response, classifies conflicts and
//! applies the call's effect on the tracker. The blocking and async clients
//! only differ in how they carry the request to the transport in between, so
//! a call that is dropped before completion (a cancelled future) leaves the
//! tracker untouched.

use bytes::Bytes;
use serde_json::{json, Value};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

use super::response_mapper::{self, FromWire};
use crate::config::ClientConfig;
use crate::domain::{
    CompressOptions, CompressResponse, ConflictError, CreateContextOptions, CreateContextResponse,
    GetContextOptions, GetContextResponse, ListContextsResponse, MessagePatch, MutationResponse,
    NewMessage, UltraContextError, UltraContextResult, UncompressOptions, VersionTracker,
};
use crate::ports::out_ports::{HttpRequest, HttpResponse, Method};

/// Header carrying the expected version precondition
pub const PRECONDITION_HEADER: &str = "If-Match";

/// Responses whose decoding feeds the version tracker
pub trait ProtocolOutput: FromWire {
    /// Head version reported by the server, if any
    fn head_version(&self) -> Option<u64> {
        None
    }

    /// Id of a context created by the call, if any
    fn created_context_id(&self) -> Option<&str> {
        None
    }
}

impl ProtocolOutput for ListContextsResponse {}

impl ProtocolOutput for CreateContextResponse {
    fn head_version(&self) -> Option<u64> {
        self.version
    }

    fn created_context_id(&self) -> Option<&str> {
        Some(self.id.as_str()).filter(|id| !id.is_empty())
    }
}

impl ProtocolOutput for GetContextResponse {
    fn head_version(&self) -> Option<u64> {
        self.version
    }
}

impl ProtocolOutput for MutationResponse {
    fn head_version(&self) -> Option<u64> {
        self.version
    }
}

impl ProtocolOutput for CompressResponse {
    fn head_version(&self) -> Option<u64> {
        self.version
    }
}

/// What a successful response does to the tracker
#[derive(Debug, Clone, PartialEq, Eq)]
enum Effect {
    None,
    Seed,
    Observe {
        context_id: String,
    },
    Mutate {
        context_id: String,
        expected: Option<u64>,
    },
    Delete {
        context_id: String,
        expected: Option<u64>,
    },
}

/// A request ready for the transport, plus what to do with its response
#[derive(Debug)]
#[must_use = "a prepared call does nothing until it is sent and completed"]
pub struct PreparedCall<T> {
    request: HttpRequest,
    effect: Effect,
    operation: &'static str,
    output: PhantomData<fn() -> T>,
}

impl<T> PreparedCall<T> {
    pub fn request(&self) -> &HttpRequest {
        &self.request
    }

    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// Version precondition captured when the call was prepared
    pub fn expected_version(&self) -> Option<u64> {
        match &self.effect {
            Effect::Mutate { expected, .. } | Effect::Delete { expected, .. } => *expected,
            _ => None,
        }
    }
}

/// Shared protocol core behind both calling conventions
#[derive(Debug, Clone)]
pub struct ContextProtocol {
    base_url: String,
    default_headers: Vec<(String, String)>,
    tracker: Arc<VersionTracker>,
}

impl ContextProtocol {
    pub fn new(config: &ClientConfig, tracker: Arc<VersionTracker>) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            default_headers: config.default_headers(),
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<VersionTracker> {
        &self.tracker
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn prepare_create(
        &self,
        options: CreateContextOptions,
    ) -> UltraContextResult<PreparedCall<CreateContextResponse>> {
        let mut body = serde_json::Map::new();
        if let Some(id) = options.id {
            validate_context_id(&id)?;
            body.insert("id".to_string(), Value::String(id));
        }
        if let Some(metadata) = options.metadata {
            body.insert("metadata".to_string(), Value::Object(metadata));
        }

        let request = self.request(Method::Post, &["contexts"], &[], Some(&Value::Object(body)), None)?;
        Ok(self.call("create", request, Effect::Seed))
    }

    pub fn prepare_list(&self) -> UltraContextResult<PreparedCall<ListContextsResponse>> {
        let request = self.request(Method::Get, &["contexts"], &[], None, None)?;
        Ok(self.call("list", request, Effect::None))
    }

    pub fn prepare_get(
        &self,
        context_id: &str,
        options: GetContextOptions,
    ) -> UltraContextResult<PreparedCall<GetContextResponse>> {
        validate_context_id(context_id)?;

        let mut query = Vec::new();
        if let Some(version) = options.version {
            query.push(("version", version.to_string()));
        }
        if let Some(at) = options.at {
            query.push(("at", at.to_string()));
        }
        if let Some(before) = options.before.as_deref() {
            query.push(("before", before.to_string()));
        }
        if options.history {
            query.push(("history", "true".to_string()));
        }

        // Historical reads describe the past, not the head.
        let effect = if options.is_historical() {
            Effect::None
        } else {
            Effect::Observe {
                context_id: context_id.to_string(),
            }
        };

        let request = self.request(Method::Get, &["contexts", context_id], &query, None, None)?;
        Ok(self.call("get", request, effect))
    }

    pub fn prepare_append(
        &self,
        context_id: &str,
        messages: Vec<NewMessage>,
    ) -> UltraContextResult<PreparedCall<MutationResponse>> {
        validate_context_id(context_id)?;
        if messages.is_empty() {
            return Err(UltraContextError::validation(
                "append requires at least one message",
            ));
        }
        if let Some(position) = messages.iter().position(|m| m.role.trim().is_empty()) {
            return Err(UltraContextError::validation(format!(
                "message {position} has an empty role"
            )));
        }

        let body = json!({ "messages": messages });
        self.prepare_mutation("append", Method::Post, context_id, &["contexts", context_id], &body)
    }

    pub fn prepare_update(
        &self,
        context_id: &str,
        patches: Vec<MessagePatch>,
    ) -> UltraContextResult<PreparedCall<MutationResponse>> {
        validate_context_id(context_id)?;
        if patches.is_empty() {
            return Err(UltraContextError::validation(
                "update requires at least one patch",
            ));
        }
        if let Some(position) = patches
            .iter()
            .position(|patch| patch.id.is_none() && patch.index.is_none())
        {
            return Err(UltraContextError::validation(format!(
                "patch {position} must name a message id or index"
            )));
        }

        let body = json!({ "updates": patches });
        self.prepare_mutation("update", Method::Patch, context_id, &["contexts", context_id], &body)
    }

    pub fn prepare_delete(
        &self,
        context_id: &str,
    ) -> UltraContextResult<PreparedCall<MutationResponse>> {
        validate_context_id(context_id)?;

        let expected = self.tracker.expected(context_id);
        let request = self.request(
            Method::Delete,
            &["contexts", context_id],
            &[],
            None,
            expected,
        )?;
        Ok(self.call(
            "delete",
            request,
            Effect::Delete {
                context_id: context_id.to_string(),
                expected,
            },
        ))
    }

    pub fn prepare_compress(
        &self,
        context_id: &str,
        options: CompressOptions,
    ) -> UltraContextResult<PreparedCall<CompressResponse>> {
        validate_context_id(context_id)?;
        validate_range(options.start, options.end)?;

        let body = serde_json::to_value(&options)?;
        let path = ["contexts", context_id, "compress"];
        self.prepare_mutation("compress", Method::Post, context_id, &path, &body)
    }

    pub fn prepare_uncompress(
        &self,
        context_id: &str,
        options: UncompressOptions,
    ) -> UltraContextResult<PreparedCall<MutationResponse>> {
        validate_context_id(context_id)?;
        validate_range(options.start, options.end)?;

        let body = serde_json::to_value(&options)?;
        let path = ["contexts", context_id, "uncompress"];
        self.prepare_mutation("uncompress", Method::Post, context_id, &path, &body)
    }

    /// Map the transport's response and apply the call's tracker effect
    pub fn complete<T: ProtocolOutput>(
        &self,
        call: PreparedCall<T>,
        response: HttpResponse,
    ) -> UltraContextResult<T> {
        let PreparedCall {
            request,
            effect,
            operation,
            ..
        } = call;

        if let Effect::Mutate { expected, .. } | Effect::Delete { expected, .. } = &effect {
            if response_mapper::is_conflict_status(response.status) {
                let conflict = ConflictError {
                    http: response_mapper::http_error(
                        request.method,
                        request.url.as_str(),
                        &response,
                    ),
                    expected_version: *expected,
                    current_version: response_mapper::conflict_version(&response),
                };
                warn!(
                    operation,
                    url = %request.url,
                    expected_version = ?conflict.expected_version,
                    current_version = ?conflict.current_version,
                    "version conflict"
                );
                return Err(conflict.into());
            }
        }

        if !response.is_success() {
            warn!(operation, url = %request.url, status = response.status, "request failed");
        }

        let output: T = response_mapper::decode(request.method, request.url.as_str(), &response)?;
        self.apply(operation, effect, &output);
        Ok(output)
    }

    fn apply<T: ProtocolOutput>(&self, operation: &'static str, effect: Effect, output: &T) {
        match effect {
            Effect::None => {}
            Effect::Seed => {
                // A new context starts a new history under its id.
                if let Some(context_id) = output.created_context_id() {
                    let version = output.head_version();
                    self.tracker.seed(context_id, version);
                    debug!(operation, context_id, version = ?version, "seeded version");
                }
            }
            Effect::Observe { context_id } | Effect::Mutate { context_id, .. } => {
                if let Some(version) = output.head_version() {
                    let tracked = self.tracker.observe(&context_id, version);
                    debug!(operation, context_id = %context_id, version, tracked, "observed version");
                }
            }
            Effect::Delete { context_id, .. } => {
                self.tracker.reset(&context_id);
                debug!(operation, context_id = %context_id, "forgot version");
            }
        }
    }

    fn prepare_mutation<T>(
        &self,
        operation: &'static str,
        method: Method,
        context_id: &str,
        path: &[&str],
        body: &Value,
    ) -> UltraContextResult<PreparedCall<T>> {
        let expected = self.tracker.expected(context_id);
        let request = self.request(method, path, &[], Some(body), expected)?;
        Ok(self.call(
            operation,
            request,
            Effect::Mutate {
                context_id: context_id.to_string(),
                expected,
            },
        ))
    }

    fn request(
        &self,
        method: Method,
        path: &[&str],
        query: &[(&str, String)],
        body: Option<&Value>,
        expected: Option<u64>,
    ) -> UltraContextResult<HttpRequest> {
        let url = self.url(path, query)?;
        let mut headers = self.default_headers.clone();
        let body = match body {
            Some(value) => {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
                Some(Bytes::from(serde_json::to_vec(value)?))
            }
            None => None,
        };
        if let Some(version) = expected {
            headers.push((PRECONDITION_HEADER.to_string(), version.to_string()));
        }

        Ok(HttpRequest {
            method,
            url,
            headers,
            body,
        })
    }

    /// Each path segment is percent-encoded on its own, so ids may hold `/`
    fn url(&self, path: &[&str], query: &[(&str, String)]) -> UltraContextResult<Url> {
        let mut url = Url::parse(&self.base_url).map_err(|err| {
            UltraContextError::validation(format!("invalid base url '{}': {err}", self.base_url))
        })?;
        url.path_segments_mut()
            .map_err(|_| {
                UltraContextError::validation(format!(
                    "base url '{}' cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .extend(path);
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(key, value)| (*key, value.as_str())));
        }
        Ok(url)
    }

    fn call<T>(&self, operation: &'static str, request: HttpRequest, effect: Effect) -> PreparedCall<T> {
        debug!(
            operation,
            method = %request.method,
            url = %request.url,
            expected_version = ?request.header(PRECONDITION_HEADER),
            "prepared request"
        );
        PreparedCall {
            request,
            effect,
            operation,
            output: PhantomData,
        }
    }
}

fn validate_context_id(context_id: &str) -> UltraContextResult<()> {
    if context_id.trim().is_empty() {
        return Err(UltraContextError::validation("context id must not be empty"));
    }
    Ok(())
}

fn validate_range(start: Option<u64>, end: Option<u64>) -> UltraContextResult<()> {
    if let (Some(start), Some(end)) = (start, end) {
        if start > end {
            return Err(UltraContextError::validation(format!(
                "range start {start} is past its end {end}"
            )));
        }
    }
    Ok(())
}
