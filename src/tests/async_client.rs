use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Barrier;
use tokio_test::{assert_err, assert_ok};

use super::memory_config;
use crate::adapter::out_adapters::InMemoryContextServer;
use crate::application::AsyncContextClient;
use crate::domain::{
    CompressOptions, CompressStrategy, CreateContextOptions, GetContextOptions, Message,
    MessagePatch, NewMessage, TransportError, UltraContextError, UncompressOptions,
    VersionTracker,
};
use crate::ports::in_ports::ContextPort;
use crate::ports::out_ports::{HttpRequest, HttpResponse, Transport};

/// Holds each request at the barrier until every party has sent one
struct GatedTransport {
    server: InMemoryContextServer,
    barrier: Barrier,
}

#[async_trait]
impl Transport for GatedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.barrier.wait().await;
        Ok(self.server.handle(&request))
    }
}

/// Delivers the request, then never returns the response
struct StallingTransport {
    server: InMemoryContextServer,
}

#[async_trait]
impl Transport for StallingTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.server.handle(&request);
        std::future::pending().await
    }
}

struct FailingTransport;

#[async_trait]
impl Transport for FailingTransport {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, TransportError> {
        Err("connection refused".into())
    }
}

fn ids_and_contents(messages: &[Message]) -> Vec<(String, String)> {
    messages
        .iter()
        .map(|message| (message.id.clone(), message.content.clone()))
        .collect()
}

#[tokio::test]
async fn concurrent_appends_resolve_through_conflict_and_retry() {
    let server = InMemoryContextServer::new();
    let client = AsyncContextClient::new(server.clone(), &memory_config());

    let created = client.create(CreateContextOptions::default()).await.unwrap();
    let id = created.id.as_str();
    assert_eq!(client.tracker().expected(id), None);

    let first = client.append(id, vec![NewMessage::user("m1")]).await.unwrap();
    assert_eq!(first.version, Some(1));
    assert_eq!(client.tracker().expected(id), Some(1));

    // Both appends read the tracker before either reaches the server.
    let racing = AsyncContextClient::with_tracker(
        GatedTransport {
            server: server.clone(),
            barrier: Barrier::new(2),
        },
        &memory_config(),
        client.tracker().clone(),
    );
    let (left, right) = futures::join!(
        racing.append(id, vec![NewMessage::user("m2")]),
        racing.append(id, vec![NewMessage::user("m3")]),
    );

    let (accepted, rejected) = match (left, right) {
        (Ok(accepted), Err(rejected)) | (Err(rejected), Ok(accepted)) => (accepted, rejected),
        other => panic!("expected exactly one conflict, got {other:?}"),
    };
    assert_eq!(accepted.version, Some(2));
    match &rejected {
        UltraContextError::Conflict(conflict) => {
            assert_eq!(conflict.expected_version, Some(1));
            assert_eq!(conflict.current_version, Some(2));
        }
        other => panic!("expected conflict, got {other:?}"),
    }
    assert_eq!(rejected.current_version(), Some(2));
    assert_eq!(client.tracker().expected(id), Some(2));

    let head = client.get(id, GetContextOptions::default()).await.unwrap();
    assert_eq!(head.version, Some(2));
    assert_eq!(client.tracker().expected(id), Some(2));

    let retried = client.append(id, vec![NewMessage::user("m3")]).await.unwrap();
    assert_eq!(retried.version, Some(3));
    assert_eq!(client.tracker().expected(id), Some(3));
    assert_eq!(server.version_of(id), Some(3));
}

#[tokio::test]
async fn stale_tracker_surfaces_conflict_without_advancing() {
    let server = InMemoryContextServer::new();
    let client = AsyncContextClient::new(server.clone(), &memory_config());
    let id = client.create(CreateContextOptions::default()).await.unwrap().id;

    for content in ["a", "b", "c", "d", "e"] {
        assert_ok!(client.append(&id, vec![NewMessage::user(content)]).await);
    }

    // Another writer's view: this client believes the context is at 3.
    let stale = AsyncContextClient::new(server.clone(), &memory_config());
    stale.tracker().observe(&id, 3);

    let error = assert_err!(stale.append(&id, vec![NewMessage::user("late")]).await);
    assert!(error.is_conflict());
    assert_eq!(error.current_version(), Some(5));
    assert_eq!(stale.tracker().expected(&id), Some(3));
    assert_eq!(server.version_of(&id), Some(5));
}

#[tokio::test]
async fn delete_forgets_version_and_next_append_is_unconditional() {
    let server = InMemoryContextServer::new();
    let client = AsyncContextClient::new(server.clone(), &memory_config());
    let options = CreateContextOptions {
        id: Some("scratch".to_string()),
        ..CreateContextOptions::default()
    };
    client.create(options.clone()).await.unwrap();
    client
        .append("scratch", vec![NewMessage::user("a"), NewMessage::user("b")])
        .await
        .unwrap();

    let deleted = client.delete("scratch").await.unwrap();
    assert_eq!(deleted.data.len(), 2);
    assert_eq!(deleted.version, Some(2));
    assert_eq!(client.tracker().expected("scratch"), None);

    // Recreated under the same id, the server starts over at version 0;
    // a stale precondition of 1 or 2 would be rejected.
    client.create(options).await.unwrap();
    let appended = client
        .append("scratch", vec![NewMessage::user("fresh")])
        .await
        .unwrap();
    assert_eq!(appended.version, Some(1));
    assert_eq!(appended.data[0].index, Some(0));
}

#[tokio::test]
async fn archive_round_trip_restores_messages() {
    let server = InMemoryContextServer::new();
    let client = AsyncContextClient::new(server, &memory_config());
    let id = client.create(CreateContextOptions::default()).await.unwrap().id;
    client
        .append(
            &id,
            vec![
                NewMessage::system("be brief"),
                NewMessage::user("hello"),
                NewMessage::assistant("hi"),
                NewMessage::user("bye"),
            ],
        )
        .await
        .unwrap();

    let before = client.get(&id, GetContextOptions::default()).await.unwrap();
    let start_version = before.version.unwrap();

    let compressed = client
        .compress(&id, CompressOptions::new(CompressStrategy::Archive).range(1, 3))
        .await
        .unwrap();
    assert_eq!(compressed.data.len(), 3);
    assert_eq!(compressed.compression.compressed_messages, 2);
    assert_eq!(compressed.compression.strategy, Some(CompressStrategy::Archive));
    assert_eq!(client.tracker().expected(&id), Some(start_version + 1));

    let restored = client
        .uncompress(&id, UncompressOptions::default())
        .await
        .unwrap();
    assert_eq!(restored.version, Some(start_version + 2));
    assert_eq!(ids_and_contents(&restored.data), ids_and_contents(&before.data));
    assert_eq!(client.tracker().expected(&id), Some(start_version + 2));
}

#[tokio::test]
async fn cancelled_call_leaves_tracker_untouched() {
    let server = InMemoryContextServer::new();
    let client = AsyncContextClient::new(server.clone(), &memory_config());
    let id = client.create(CreateContextOptions::default()).await.unwrap().id;
    client.append(&id, vec![NewMessage::user("one")]).await.unwrap();

    let stalling = AsyncContextClient::with_tracker(
        StallingTransport {
            server: server.clone(),
        },
        &memory_config(),
        client.tracker().clone(),
    );
    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        stalling.append(&id, vec![NewMessage::user("two")]),
    )
    .await;
    assert!(outcome.is_err());

    // The server applied the write; the client never saw it.
    assert_eq!(server.version_of(&id), Some(2));
    assert_eq!(client.tracker().expected(&id), Some(1));

    let error = assert_err!(client.append(&id, vec![NewMessage::user("three")]).await);
    assert_eq!(error.current_version(), Some(2));
}

#[tokio::test]
async fn historical_reads_do_not_move_tracker() {
    let server = InMemoryContextServer::new();
    let client = AsyncContextClient::new(server, &memory_config());
    let id = client.create(CreateContextOptions::default()).await.unwrap().id;
    client.append(&id, vec![NewMessage::user("one")]).await.unwrap();
    client.append(&id, vec![NewMessage::user("two")]).await.unwrap();
    client.tracker().reset(&id);

    let past = client
        .get(&id, GetContextOptions::at_version(1))
        .await
        .unwrap();
    assert_eq!(past.version, Some(1));
    assert_eq!(past.data.len(), 1);
    assert_eq!(client.tracker().expected(&id), None);

    let head = client
        .get(&id, GetContextOptions::with_history())
        .await
        .unwrap();
    assert_eq!(head.data.len(), 2);
    let operations: Vec<&str> = head
        .versions
        .iter()
        .map(|version| version.operation.as_str())
        .collect();
    assert_eq!(operations, vec!["create", "append", "append"]);
    assert_eq!(client.tracker().expected(&id), Some(2));
}

#[tokio::test]
async fn update_edits_in_place_and_advances() {
    let server = InMemoryContextServer::new();
    let client = AsyncContextClient::new(server, &memory_config());
    let id = client.create(CreateContextOptions::default()).await.unwrap().id;
    let appended = client
        .append(&id, vec![NewMessage::user("draft"), NewMessage::user("other")])
        .await
        .unwrap();
    let target = appended.data[0].id.clone();

    let updated = client
        .update(&id, vec![MessagePatch::by_id(target.clone()).content("final")])
        .await
        .unwrap();
    assert_eq!(updated.version, Some(2));
    assert_eq!(updated.data.len(), 1);
    assert_eq!(updated.data[0].id, target);
    assert_eq!(updated.data[0].content, "final");

    let updated = client
        .update(&id, vec![MessagePatch::by_index(1).role("assistant")])
        .await
        .unwrap();
    assert_eq!(updated.data[0].role, "assistant");
    assert_eq!(client.tracker().expected(&id), Some(3));
}

#[tokio::test]
async fn list_returns_contexts_in_creation_order() {
    let server = InMemoryContextServer::new();
    let client = AsyncContextClient::new(server, &memory_config());
    for id in ["first", "second"] {
        client
            .create(CreateContextOptions {
                id: Some(id.to_string()),
                ..CreateContextOptions::default()
            })
            .await
            .unwrap();
    }

    let listed = client.list().await.unwrap();
    let ids: Vec<&str> = listed.data.iter().map(|context| context.id.as_str()).collect();
    assert_eq!(ids, vec!["first", "second"]);
    assert!(listed.data[0].created_at_utc().is_some());
    assert!(client.tracker().is_empty());
}

#[tokio::test]
async fn transport_and_http_failures_are_distinguished() {
    let client = AsyncContextClient::new(FailingTransport, &memory_config());
    let error = assert_err!(client.list().await);
    assert!(matches!(error, UltraContextError::Transport(_)));

    let client = AsyncContextClient::new(InMemoryContextServer::new(), &memory_config());
    let error = assert_err!(client.get("missing", GetContextOptions::default()).await);
    assert_eq!(error.status(), Some(404));
    assert!(!error.is_conflict());

    let error = assert_err!(client.append("missing", Vec::new()).await);
    assert!(matches!(error, UltraContextError::Validation(_)));
}

#[tokio::test]
async fn clients_can_share_or_isolate_trackers() {
    let server = InMemoryContextServer::new();
    let shared = Arc::new(VersionTracker::new());
    let a = AsyncContextClient::with_tracker(server.clone(), &memory_config(), shared.clone());
    let b = AsyncContextClient::with_tracker(server.clone(), &memory_config(), shared.clone());
    let isolated = AsyncContextClient::new(server, &memory_config());

    let id = a.create(CreateContextOptions::default()).await.unwrap().id;
    a.append(&id, vec![NewMessage::user("x")]).await.unwrap();

    assert_eq!(b.tracker().expected(&id), Some(1));
    assert_eq!(isolated.tracker().expected(&id), None);
    assert!(Arc::ptr_eq(a.tracker(), &shared));
}

#[tokio::test]
async fn recreated_context_drops_version_tracked_for_its_id() {
    let server = InMemoryContextServer::new();
    let client = AsyncContextClient::new(server.clone(), &memory_config());
    client.tracker().observe("scratch", 2);

    let created = client
        .create(CreateContextOptions {
            id: Some("scratch".to_string()),
            ..CreateContextOptions::default()
        })
        .await
        .unwrap();
    assert_eq!(created.id, "scratch");
    assert_eq!(client.tracker().expected("scratch"), None);

    let appended = assert_ok!(
        client
            .append("scratch", vec![NewMessage::user("first")])
            .await
    );
    assert_eq!(appended.version, Some(1));
    assert_eq!(client.tracker().expected("scratch"), Some(1));
}

#[tokio::test]
async fn ids_with_reserved_characters_reach_the_same_context() {
    let server = InMemoryContextServer::new();
    let client = AsyncContextClient::new(server.clone(), &memory_config());

    for id in ["c++ notes", "50%/done?", "a+b"] {
        client
            .create(CreateContextOptions {
                id: Some(id.to_string()),
                ..CreateContextOptions::default()
            })
            .await
            .unwrap();
        let appended = client
            .append(id, vec![NewMessage::user(id)])
            .await
            .unwrap();
        assert_eq!(appended.version, Some(1));
        assert_eq!(server.version_of(id), Some(1));
    }
    assert_eq!(server.context_count(), 3);
}
