use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;
use uuid::Uuid;

use crate::application::protocol::PRECONDITION_HEADER;
use crate::domain::{CompressStrategy, Metadata, TransportError};
use crate::ports::out_ports::{BlockingTransport, HttpRequest, HttpResponse, Method, Transport};

/// In-process context store speaking the HTTP wire protocol.
///
/// Enforces `If-Match` version preconditions, keeps a snapshot per version
/// for historical reads, and retains compressed originals for the
/// `archive` and `summarize` strategies. Clones share the same state.
/// Used for testing and offline development.
#[derive(Clone, Debug, Default)]
pub struct InMemoryContextServer {
    state: Arc<Mutex<ServerState>>,
}

#[derive(Debug, Default)]
struct ServerState {
    order: Vec<String>,
    contexts: HashMap<String, StoredContext>,
}

#[derive(Debug, Clone)]
struct StoredContext {
    id: String,
    metadata: Metadata,
    created_at: String,
    version: u64,
    messages: Vec<StoredMessage>,
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    role: String,
    content: String,
    metadata: Metadata,
    /// Originals folded into this placeholder by compress
    folded: Vec<StoredMessage>,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    version: u64,
    created_at: DateTime<Utc>,
    operation: &'static str,
    affected: Vec<String>,
    snapshot: Vec<StoredMessage>,
}

type Handled = Result<HttpResponse, HttpResponse>;

impl InMemoryContextServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current server-side version of a context
    pub fn version_of(&self, context_id: &str) -> Option<u64> {
        self.lock().contexts.get(context_id).map(|context| context.version)
    }

    pub fn context_count(&self) -> usize {
        self.lock().contexts.len()
    }

    /// Serve one request
    pub fn handle(&self, request: &HttpRequest) -> HttpResponse {
        let segments = request.path_segments();
        let segments: Vec<&str> = segments.iter().map(String::as_str).collect();
        debug!(method = %request.method, path = request.path(), "in-memory request");

        let mut state = self.lock();
        let handled = match (request.method, segments.as_slice()) {
            (Method::Post, ["contexts"]) => state.create(request),
            (Method::Get, ["contexts"]) => Ok(state.list()),
            (Method::Get, ["contexts", id]) => state.get(id, request),
            (Method::Post, ["contexts", id]) => state.append(id, request),
            (Method::Patch, ["contexts", id]) => state.update(id, request),
            (Method::Delete, ["contexts", id]) => state.delete(id, request),
            (Method::Post, ["contexts", id, "compress"]) => state.compress(id, request),
            (Method::Post, ["contexts", id, "uncompress"]) => state.uncompress(id, request),
            (_, ["contexts"]) | (_, ["contexts", _]) | (_, ["contexts", _, _]) => {
                Err(error(405, "method not allowed"))
            }
            _ => Err(error(404, "route not found")),
        };
        handled.unwrap_or_else(|response| response)
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for InMemoryContextServer {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        Ok(self.handle(&request))
    }
}

impl BlockingTransport for InMemoryContextServer {
    fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        Ok(self.handle(&request))
    }
}

impl ServerState {
    fn create(&mut self, request: &HttpRequest) -> Handled {
        let body = body_json(request)?;
        let id = match body.get("id") {
            Some(Value::String(id)) if !id.trim().is_empty() => id.clone(),
            Some(_) => return Err(error(400, "id must be a non-empty string")),
            None => new_id("ctx"),
        };
        if self.contexts.contains_key(&id) {
            return Err(error(409, "context already exists"));
        }

        let now = Utc::now();
        let context = StoredContext {
            id: id.clone(),
            metadata: body
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
            created_at: now.to_rfc3339(),
            version: 0,
            messages: Vec::new(),
            history: vec![HistoryEntry {
                version: 0,
                created_at: now,
                operation: "create",
                affected: Vec::new(),
                snapshot: Vec::new(),
            }],
        };
        let payload = context.summary();
        self.order.push(id.clone());
        self.contexts.insert(id, context);

        Ok(HttpResponse::json(201, &payload))
    }

    fn list(&self) -> HttpResponse {
        let data: Vec<Value> = self
            .order
            .iter()
            .filter_map(|id| self.contexts.get(id))
            .map(StoredContext::summary)
            .collect();
        HttpResponse::json(200, &json!({ "data": data }))
    }

    fn get(&self, id: &str, request: &HttpRequest) -> Handled {
        let context = self.contexts.get(id).ok_or_else(context_not_found)?;
        let params = request.query_pairs();
        let param = |name: &str| {
            params
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };

        let entry = if let Some(raw) = param("version") {
            let version = parse_u64(raw, "version")?;
            Some(
                context
                    .history
                    .iter()
                    .find(|entry| entry.version == version)
                    .ok_or_else(|| error(404, "version not found"))?,
            )
        } else if let Some(raw) = param("at") {
            let index = parse_u64(raw, "at")? as usize;
            Some(
                context
                    .history
                    .iter()
                    .find(|entry| entry.snapshot.len() > index)
                    .ok_or_else(|| error(404, "no version contains that index"))?,
            )
        } else if let Some(raw) = param("before") {
            let before = DateTime::parse_from_rfc3339(raw)
                .map_err(|_| error(400, "before must be an RFC 3339 timestamp"))?
                .with_timezone(&Utc);
            Some(
                context
                    .history
                    .iter()
                    .rev()
                    .find(|entry| entry.created_at < before)
                    .ok_or_else(|| error(404, "no version before that time"))?,
            )
        } else {
            None
        };

        let (messages, version) = match entry {
            Some(entry) => (&entry.snapshot, entry.version),
            None => (&context.messages, context.version),
        };
        let mut payload = json!({ "data": render(messages), "version": version });
        if param("history") == Some("true") {
            payload["versions"] = context.history.iter().map(HistoryEntry::to_wire).collect();
        }
        Ok(HttpResponse::json(200, &payload))
    }

    fn append(&mut self, id: &str, request: &HttpRequest) -> Handled {
        let body = body_json(request)?;
        let context = self.context_mut(id)?;
        check_precondition(context, request)?;

        let items = body
            .get("messages")
            .and_then(Value::as_array)
            .filter(|items| !items.is_empty())
            .ok_or_else(|| error(400, "messages must be a non-empty array"))?;

        let mut appended = Vec::with_capacity(items.len());
        for item in items {
            let role = item
                .get("role")
                .and_then(Value::as_str)
                .filter(|role| !role.trim().is_empty())
                .ok_or_else(|| error(400, "each message needs a role"))?;
            appended.push(StoredMessage {
                id: new_id("msg"),
                role: role.to_string(),
                content: content_text(item.get("content")),
                metadata: item
                    .get("metadata")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default(),
                folded: Vec::new(),
            });
        }

        let start = context.messages.len();
        context.messages.extend(appended.iter().cloned());
        let affected = appended.iter().map(|message| message.id.clone()).collect();
        let version = context.commit("append", affected);

        let data: Vec<Value> = appended
            .iter()
            .enumerate()
            .map(|(offset, message)| message.to_wire(start + offset))
            .collect();
        Ok(HttpResponse::json(200, &json!({ "data": data, "version": version })))
    }

    fn update(&mut self, id: &str, request: &HttpRequest) -> Handled {
        let body = body_json(request)?;
        let context = self.context_mut(id)?;
        check_precondition(context, request)?;

        let updates = body
            .get("updates")
            .and_then(Value::as_array)
            .filter(|updates| !updates.is_empty())
            .ok_or_else(|| error(400, "updates must be a non-empty array"))?;

        // Resolve every target before touching anything.
        let mut targets = Vec::with_capacity(updates.len());
        for update in updates {
            let position = match (update.get("id").and_then(Value::as_str), update.get("index")) {
                (Some(message_id), _) => context
                    .messages
                    .iter()
                    .position(|message| message.id == message_id),
                (None, Some(index)) => index
                    .as_u64()
                    .map(|index| index as usize)
                    .filter(|index| *index < context.messages.len()),
                (None, None) => return Err(error(400, "each update needs an id or index")),
            };
            let position = position.ok_or_else(|| error(404, "message not found"))?;
            targets.push((position, update));
        }

        let mut touched = Vec::with_capacity(targets.len());
        for (position, update) in targets {
            let message = &mut context.messages[position];
            if let Some(role) = update.get("role").and_then(Value::as_str) {
                message.role = role.to_string();
            }
            if update.get("content").is_some() {
                message.content = content_text(update.get("content"));
            }
            if let Some(metadata) = update.get("metadata").and_then(Value::as_object) {
                message.metadata = metadata.clone();
            }
            touched.push(position);
        }

        let affected = touched
            .iter()
            .map(|position| context.messages[*position].id.clone())
            .collect();
        let version = context.commit("update", affected);
        let data: Vec<Value> = touched
            .iter()
            .map(|position| context.messages[*position].to_wire(*position))
            .collect();
        Ok(HttpResponse::json(200, &json!({ "data": data, "version": version })))
    }

    fn delete(&mut self, id: &str, request: &HttpRequest) -> Handled {
        let (data, version) = {
            let context = self.context_mut(id)?;
            check_precondition(context, request)?;
            (render(&context.messages), context.version + 1)
        };
        self.contexts.remove(id);
        self.order.retain(|existing| existing != id);

        Ok(HttpResponse::json(200, &json!({ "data": data, "version": version })))
    }

    fn compress(&mut self, id: &str, request: &HttpRequest) -> Handled {
        let body = body_json(request)?;
        let context = self.context_mut(id)?;
        check_precondition(context, request)?;

        let strategy = match body.get("strategy").and_then(Value::as_str) {
            Some(raw) => CompressStrategy::parse(raw)
                .ok_or_else(|| error(400, &format!("unknown strategy {raw}")))?,
            None => CompressStrategy::default(),
        };
        let (start, end) = bounds(&body, context.messages.len())?;
        if start >= end {
            return Err(error(400, "compression range is empty"));
        }

        let removed: Vec<StoredMessage> = context.messages.drain(start..end).collect();
        let count = removed.len();
        let original_size: usize = removed.iter().map(|message| message.content.len()).sum();
        let affected: Vec<String> = removed.iter().map(|message| message.id.clone()).collect();

        let content = match strategy {
            CompressStrategy::Truncate => None,
            CompressStrategy::Archive => Some(format!("[{count} messages archived]")),
            CompressStrategy::Summarize => Some(summarize(&removed)),
        };
        let compressed_size = content.as_ref().map(String::len).unwrap_or(0);
        if let Some(content) = content {
            let mut metadata = Metadata::new();
            metadata.insert("compressed".to_string(), Value::Bool(true));
            metadata.insert("strategy".to_string(), json!(strategy.as_str()));
            metadata.insert("compressed_messages".to_string(), json!(count));
            context.messages.insert(
                start,
                StoredMessage {
                    id: new_id("cmp"),
                    role: "system".to_string(),
                    content,
                    metadata,
                    folded: removed,
                },
            );
        }

        let version = context.commit("compress", affected);
        Ok(HttpResponse::json(
            200,
            &json!({
                "data": render(&context.messages),
                "version": version,
                "compression": {
                    "strategy": strategy.as_str(),
                    "compressed_messages": count,
                    "original_size": original_size,
                    "compressed_size": compressed_size,
                }
            }),
        ))
    }

    fn uncompress(&mut self, id: &str, request: &HttpRequest) -> Handled {
        let body = body_json(request)?;
        let context = self.context_mut(id)?;
        check_precondition(context, request)?;

        let (start, end) = bounds(&body, context.messages.len())?;
        if start > end {
            return Err(error(400, "uncompress range is inverted"));
        }
        let in_range = |position: usize| position >= start && position < end;
        let expandable = context
            .messages
            .iter()
            .enumerate()
            .any(|(position, message)| in_range(position) && !message.folded.is_empty());
        if !expandable {
            return Err(error(400, "no compressed messages in range"));
        }

        let mut affected = Vec::new();
        let mut rebuilt = Vec::with_capacity(context.messages.len());
        for (position, message) in std::mem::take(&mut context.messages).into_iter().enumerate() {
            if in_range(position) && !message.folded.is_empty() {
                affected.push(message.id.clone());
                rebuilt.extend(message.flatten());
            } else {
                rebuilt.push(message);
            }
        }
        context.messages = rebuilt;

        let version = context.commit("uncompress", affected);
        Ok(HttpResponse::json(
            200,
            &json!({ "data": render(&context.messages), "version": version }),
        ))
    }

    fn context_mut(&mut self, id: &str) -> Result<&mut StoredContext, HttpResponse> {
        self.contexts.get_mut(id).ok_or_else(context_not_found)
    }
}

impl StoredContext {
    fn commit(&mut self, operation: &'static str, affected: Vec<String>) -> u64 {
        self.version += 1;
        self.history.push(HistoryEntry {
            version: self.version,
            created_at: Utc::now(),
            operation,
            affected,
            snapshot: self.messages.clone(),
        });
        self.version
    }

    fn summary(&self) -> Value {
        json!({
            "id": self.id,
            "metadata": self.metadata,
            "created_at": self.created_at,
        })
    }
}

impl StoredMessage {
    fn to_wire(&self, index: usize) -> Value {
        json!({
            "id": self.id,
            "index": index,
            "role": self.role,
            "content": self.content,
            "metadata": self.metadata,
        })
    }

    /// Restore the originals behind a placeholder, all the way down
    fn flatten(self) -> Vec<StoredMessage> {
        if self.folded.is_empty() {
            return vec![self];
        }
        self.folded
            .into_iter()
            .flat_map(StoredMessage::flatten)
            .collect()
    }
}

impl HistoryEntry {
    fn to_wire(&self) -> Value {
        json!({
            "version": self.version,
            "created_at": self.created_at.to_rfc3339(),
            "operation": self.operation,
            "affected": self.affected,
        })
    }
}

fn check_precondition(context: &StoredContext, request: &HttpRequest) -> Result<(), HttpResponse> {
    let Some(raw) = request.header(PRECONDITION_HEADER) else {
        return Ok(());
    };
    let expected = parse_u64(raw.trim_matches('"'), PRECONDITION_HEADER)?;
    if expected != context.version {
        return Err(HttpResponse::json(
            409,
            &json!({
                "error": "version conflict",
                "expected_version": expected,
                "current_version": context.version,
            }),
        ));
    }
    Ok(())
}

fn bounds(body: &Value, len: usize) -> Result<(usize, usize), HttpResponse> {
    let read = |key: &str| -> Result<Option<usize>, HttpResponse> {
        match body.get(key) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => value
                .as_u64()
                .map(|bound| Some(bound as usize))
                .ok_or_else(|| error(400, &format!("{key} must be a non-negative integer"))),
        }
    };
    let start = read("start")?.unwrap_or(0).min(len);
    let end = read("end")?.unwrap_or(len).min(len);
    Ok((start, end))
}

fn summarize(messages: &[StoredMessage]) -> String {
    let lines: Vec<String> = messages
        .iter()
        .map(|message| {
            let excerpt: String = message.content.chars().take(40).collect();
            format!("{}: {}", message.role, excerpt)
        })
        .collect();
    format!("Summary of {} messages. {}", messages.len(), lines.join("; "))
}

fn render(messages: &[StoredMessage]) -> Vec<Value> {
    messages
        .iter()
        .enumerate()
        .map(|(index, message)| message.to_wire(index))
        .collect()
}

fn content_text(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(text)) => text.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn body_json(request: &HttpRequest) -> Result<Value, HttpResponse> {
    match request.body.as_deref() {
        None | Some([]) => Ok(Value::Null),
        Some(bytes) => {
            serde_json::from_slice(bytes).map_err(|_| error(400, "request body is not valid JSON"))
        }
    }
}

fn parse_u64(raw: &str, name: &str) -> Result<u64, HttpResponse> {
    raw.trim()
        .parse()
        .map_err(|_| error(400, &format!("{name} must be a non-negative integer")))
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

fn context_not_found() -> HttpResponse {
    error(404, "context not found")
}

fn error(status: u16, message: &str) -> HttpResponse {
    HttpResponse::json(status, &json!({ "error": message }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn request(method: Method, path: &str, body: Option<Value>) -> HttpRequest {
        HttpRequest {
            method,
            url: url::Url::parse(&format!("http://memory{path}")).unwrap(),
            headers: Vec::new(),
            body: body.map(|value| Bytes::from(value.to_string())),
        }
    }

    fn json_body(response: &HttpResponse) -> Value {
        serde_json::from_slice(&response.body).unwrap()
    }

    fn create(server: &InMemoryContextServer) -> String {
        let response = server.handle(&request(Method::Post, "/contexts", None));
        assert_eq!(response.status, 201);
        json_body(&response)["id"].as_str().unwrap().to_string()
    }

    fn append(server: &InMemoryContextServer, id: &str, contents: &[&str]) -> Value {
        let messages: Vec<Value> = contents
            .iter()
            .map(|content| json!({"role": "user", "content": content}))
            .collect();
        let response = server.handle(&request(
            Method::Post,
            &format!("/contexts/{id}"),
            Some(json!({ "messages": messages })),
        ));
        assert_eq!(response.status, 200, "{:?}", json_body(&response));
        json_body(&response)
    }

    #[test]
    fn stale_precondition_is_rejected_with_current_version() {
        let server = InMemoryContextServer::new();
        let id = create(&server);
        append(&server, &id, &["one"]);
        append(&server, &id, &["two"]);

        let mut stale = request(
            Method::Post,
            &format!("/contexts/{id}"),
            Some(json!({"messages": [{"role": "user", "content": "three"}]})),
        );
        stale.headers.push(("If-Match".to_string(), "1".to_string()));
        let response = server.handle(&stale);

        assert_eq!(response.status, 409);
        assert_eq!(json_body(&response)["current_version"], json!(2));
        assert_eq!(server.version_of(&id), Some(2));
    }

    #[test]
    fn historical_reads_return_snapshots() {
        let server = InMemoryContextServer::new();
        let id = create(&server);
        append(&server, &id, &["one"]);
        append(&server, &id, &["two", "three"]);

        let response = server.handle(&request(
            Method::Get,
            &format!("/contexts/{id}?version=1&history=true"),
            None,
        ));
        let payload = json_body(&response);
        assert_eq!(payload["version"], json!(1));
        assert_eq!(payload["data"].as_array().unwrap().len(), 1);
        let versions = payload["versions"].as_array().unwrap();
        assert_eq!(versions.len(), 3);
        assert_eq!(versions[2]["operation"], json!("append"));
        assert_eq!(versions[2]["affected"].as_array().unwrap().len(), 2);

        let response = server.handle(&request(Method::Get, &format!("/contexts/{id}?at=2"), None));
        assert_eq!(json_body(&response)["version"], json!(2));

        let response = server.handle(&request(Method::Get, &format!("/contexts/{id}?version=9"), None));
        assert_eq!(response.status, 404);
    }

    #[test]
    fn truncate_retains_nothing_to_uncompress() {
        let server = InMemoryContextServer::new();
        let id = create(&server);
        append(&server, &id, &["a", "b", "c"]);

        let response = server.handle(&request(
            Method::Post,
            &format!("/contexts/{id}/compress"),
            Some(json!({"start": 0, "end": 2, "strategy": "truncate"})),
        ));
        let payload = json_body(&response);
        assert_eq!(payload["data"].as_array().unwrap().len(), 1);
        assert_eq!(payload["compression"]["compressed_messages"], json!(2));
        assert_eq!(payload["compression"]["compressed_size"], json!(0));

        let response = server.handle(&request(
            Method::Post,
            &format!("/contexts/{id}/uncompress"),
            Some(json!({})),
        ));
        assert_eq!(response.status, 400);
        assert_eq!(server.version_of(&id), Some(2));
    }

    #[test]
    fn summarize_keeps_originals_and_reports_sizes() {
        let server = InMemoryContextServer::new();
        let id = create(&server);
        append(&server, &id, &["first message", "second message", "third"]);

        let response = server.handle(&request(
            Method::Post,
            &format!("/contexts/{id}/compress"),
            Some(json!({"end": 2, "strategy": "summarize"})),
        ));
        let payload = json_body(&response);
        let data = payload["data"].as_array().unwrap();
        assert_eq!(data.len(), 2);
        assert_eq!(data[0]["role"], json!("system"));
        assert!(data[0]["content"].as_str().unwrap().starts_with("Summary of 2 messages."));
        assert_eq!(data[1]["index"], json!(1));
        assert_eq!(payload["compression"]["original_size"], json!(27));

        let response = server.handle(&request(
            Method::Post,
            &format!("/contexts/{id}/uncompress"),
            None,
        ));
        let data = json_body(&response)["data"].as_array().unwrap().clone();
        let contents: Vec<&str> = data.iter().map(|m| m["content"].as_str().unwrap()).collect();
        assert_eq!(contents, vec!["first message", "second message", "third"]);
    }

    #[test]
    fn update_is_all_or_nothing() {
        let server = InMemoryContextServer::new();
        let id = create(&server);
        append(&server, &id, &["a"]);

        let response = server.handle(&request(
            Method::Patch,
            &format!("/contexts/{id}"),
            Some(json!({"updates": [{"index": 0, "content": "edited"}, {"id": "missing"}]})),
        ));
        assert_eq!(response.status, 404);

        let response = server.handle(&request(Method::Get, &format!("/contexts/{id}"), None));
        assert_eq!(json_body(&response)["data"][0]["content"], json!("a"));
        assert_eq!(server.version_of(&id), Some(1));
    }

    #[test]
    fn delete_removes_context_and_reports_next_version() {
        let server = InMemoryContextServer::new();
        let id = create(&server);
        append(&server, &id, &["a", "b"]);

        let response = server.handle(&request(Method::Delete, &format!("/contexts/{id}"), None));
        let payload = json_body(&response);
        assert_eq!(payload["version"], json!(2));
        assert_eq!(payload["data"].as_array().unwrap().len(), 2);
        assert_eq!(server.context_count(), 0);

        let response = server.handle(&request(Method::Get, &format!("/contexts/{id}"), None));
        assert_eq!(response.status, 404);
    }

    #[test]
    fn caller_assigned_ids_are_unique_and_routes_are_checked() {
        let server = InMemoryContextServer::new();
        let body = Some(json!({"id": "team/alpha", "metadata": {"owner": "ops"}}));

        let response = server.handle(&request(Method::Post, "/contexts", body.clone()));
        assert_eq!(response.status, 201);
        let response = server.handle(&request(Method::Post, "/contexts", body));
        assert_eq!(response.status, 409);

        let response = server.handle(&request(Method::Get, "/contexts/team%2Falpha", None));
        assert_eq!(response.status, 200);

        let response = server.handle(&request(Method::Patch, "/contexts", None));
        assert_eq!(response.status, 405);
        let response = server.handle(&request(Method::Get, "/health", None));
        assert_eq!(response.status, 404);
    }

    #[test]
    fn plus_in_path_is_not_a_space() {
        let server = InMemoryContextServer::new();
        let body = Some(json!({"id": "c++"}));
        assert_eq!(server.handle(&request(Method::Post, "/contexts", body)).status, 201);

        let response = server.handle(&request(Method::Get, "/contexts/c++", None));
        assert_eq!(response.status, 200);
        let response = server.handle(&request(Method::Get, "/contexts/c%20%20", None));
        assert_eq!(response.status, 404);
    }
}
