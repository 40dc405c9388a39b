//! End-to-end session tests against a fake dev server
//!
//! The fake server is an in-process axum app serving a page and a
//! change-notification stream. The "dev server process" is a long `sleep`
//! so the session has something real to start and interrupt.

#![cfg(unix)]

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use devprof::{
    BUILDING, BUILT, ChangeTrigger, Commit, MeasurementSession, NonceMutator, ProfileError,
    ProfileResult, SessionConfig, SessionMode,
};
use futures::{Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

const PAGE_BODY: &str = "<html><body>profiled page</body></html>";

// =============================================================================
// Fake dev server
// =============================================================================

struct FakeDevServer {
    base_url: String,
    events: broadcast::Sender<String>,
}

impl FakeDevServer {
    async fn start() -> Self {
        let (events, _) = broadcast::channel::<String>(256);
        let stream_events = events.clone();

        let router = Router::new()
            .route("/", get(|| async { PAGE_BODY }))
            .route(
                "/_next/webpack-hmr",
                get(move || {
                    let rx = stream_events.subscribe();
                    async move { Sse::new(relay(rx)).keep_alive(KeepAlive::default()) }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            events,
        }
    }

    fn emit(&self, data: &str) {
        let _ = self.events.send(data.to_string());
    }
}

fn relay(rx: broadcast::Receiver<String>) -> impl Stream<Item = Result<Event, Infallible>> {
    BroadcastStream::new(rx).filter_map(|msg| async move {
        msg.ok().map(|data| Ok(Event::default().data(data)))
    })
}

fn action(name: &str) -> String {
    format!(r#"{{"action":"{name}"}}"#)
}

/// Applies a real nonce change, then plays the server's rebuild notifications.
struct RebuildingTrigger {
    inner: NonceMutator,
    events: broadcast::Sender<String>,
}

#[async_trait]
impl ChangeTrigger for RebuildingTrigger {
    async fn prepare(&self, target: &Path) -> ProfileResult<Commit> {
        let write = self.inner.prepare(target).await?;
        let events = self.events.clone();

        Ok(Box::pin(async move {
            write.await?;
            tokio::spawn(async move {
                // Noise that must not complete the cycle.
                let _ = events.send("ping".to_string());
                let _ = events.send(action(BUILT));
                tokio::time::sleep(Duration::from_millis(5)).await;
                let _ = events.send(action(BUILDING));
                tokio::time::sleep(Duration::from_millis(10)).await;
                let _ = events.send(r#"{"action":"sync"}"#.to_string());
                let _ = events.send(action(BUILT));
            });
            Ok::<(), ProfileError>(())
        }))
    }
}

fn write_source(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("export const {} = 1;\n", name.replace('.', "_"))).unwrap();
    path
}

fn base_config(server: &FakeDevServer) -> devprof::SessionConfigBuilder {
    SessionConfig::builder()
        .base_url(&server.base_url)
        .command("sleep 30")
        .pause(Duration::from_millis(1))
        .startup_timeout(Some(Duration::from_secs(10)))
        .event_timeout(Some(Duration::from_secs(10)))
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn automatic_session_measures_every_dimension() {
    let server = FakeDevServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let targets = vec![
        write_source(dir.path(), "shallow.tsx"),
        write_source(dir.path(), "deep.tsx"),
    ];

    let config = base_config(&server)
        .page_load_iterations(2)
        .mode(SessionMode::Auto {
            targets: targets.clone(),
            iterations: 3,
        })
        .build()
        .unwrap();
    let trigger = RebuildingTrigger {
        inner: NonceMutator::new(),
        events: server.events.clone(),
    };

    let report = MeasurementSession::with_trigger(config, trigger)
        .run()
        .await
        .unwrap();

    assert_eq!(report.samples.len(), 6);
    let iterations: Vec<u32> = report.samples.iter().map(|s| s.iteration).collect();
    assert_eq!(iterations, [1, 2, 3, 1, 2, 3]);
    let dimensions: Vec<Option<u32>> = report.samples.iter().map(|s| s.dimension).collect();
    assert_eq!(
        dimensions,
        [Some(0), Some(0), Some(0), Some(1), Some(1), Some(1)]
    );
    for sample in &report.samples {
        assert!(sample.complete_elapsed_micros >= sample.notify_elapsed_micros);
        assert!(sample.notify_elapsed_micros > 0);
    }
    assert_eq!(report.samples[0].changed_file.as_deref(), Some(targets[0].as_path()));
    assert_eq!(report.samples[5].changed_file.as_deref(), Some(targets[1].as_path()));

    assert!(report.first_page_load_micros > 0);
    assert_eq!(report.page_loads.len(), 2);
    assert_eq!(report.page_loads[1].iteration, 2);
    assert_eq!(report.page_loads[0].response_length, PAGE_BODY.len());
    assert!(report.traces.is_none());

    for target in &targets {
        let content = std::fs::read_to_string(target).unwrap();
        assert_eq!(content.matches("/*** NONCE:").count(), 1);
    }
}

#[tokio::test]
async fn manual_session_times_from_the_build_notification() {
    let server = FakeDevServer::start().await;
    let config = base_config(&server)
        .mode(SessionMode::Manual { iterations: 2 })
        .capture_trace(true)
        .collector_addr("127.0.0.1:0")
        .build()
        .unwrap();

    // Stand-in for an operator saving files every so often.
    let events = server.events.clone();
    let operator = tokio::spawn(async move {
        for _ in 0..400 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let _ = events.send(action(BUILDING));
            tokio::time::sleep(Duration::from_millis(5)).await;
            let _ = events.send(action(BUILT));
        }
    });

    let report = MeasurementSession::new(config).run().await.unwrap();
    operator.abort();

    assert_eq!(report.samples.len(), 2);
    for (expected, sample) in (1..).zip(&report.samples) {
        assert_eq!(sample.iteration, expected);
        assert_eq!(sample.dimension, None);
        assert_eq!(sample.notify_elapsed_micros, 0);
        assert!(sample.complete_elapsed_micros > 0);
    }
    assert_eq!(report.traces, Some(vec![]));

    let lines = report.stat_lines();
    assert!(lines.iter().any(|l| l.starts_with("complete, mean: ")));
    assert!(!lines.iter().any(|l| l.starts_with("notify")));
}

#[tokio::test]
async fn session_fails_when_the_server_exits_before_answering() {
    let port = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port();

    let config = SessionConfig::builder()
        .base_url(format!("http://127.0.0.1:{port}"))
        .command("exit 3")
        .build()
        .unwrap();

    let err = tokio::time::timeout(Duration::from_secs(10), MeasurementSession::new(config).run())
        .await
        .expect("session hung")
        .unwrap_err();

    match err {
        ProfileError::ProcessExited { code, .. } => assert_eq!(code, Some(3)),
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn missing_event_stream_is_fatal() {
    let server = FakeDevServer::start().await;
    let config = base_config(&server)
        .event_url(format!("{}/no-such-stream", server.base_url))
        .mode(SessionMode::Manual { iterations: 1 })
        .build()
        .unwrap();

    let err = MeasurementSession::new(config).run().await.unwrap_err();
    assert!(matches!(err, ProfileError::StreamConnect { .. }));
}

#[tokio::test]
async fn silent_server_hits_the_rebuild_deadline() {
    let server = FakeDevServer::start().await;
    let dir = tempfile::tempdir().unwrap();
    let target = write_source(dir.path(), "index.tsx");

    let config = base_config(&server)
        .event_timeout(Some(Duration::from_millis(200)))
        .mode(SessionMode::Auto {
            targets: vec![target],
            iterations: 1,
        })
        .build()
        .unwrap();

    server.emit("ping");
    let err = MeasurementSession::new(config).run().await.unwrap_err();
    assert!(matches!(err, ProfileError::Timeout { .. }));
}
