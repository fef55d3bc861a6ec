use crate::web::api::{
    enroll_face, get_logs, get_status, health, list_faces, remove_face, video_feed, AppState,
};
use anyhow::Result;
use axum::{
    routing::{delete, get},
    Router,
};
use std::future::Future;
use std::net::{IpAddr, SocketAddr, TcpListener};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/status", get(get_status))
        .route("/logs", get(get_logs))
        .route("/faces", get(list_faces).post(enroll_face))
        .route("/faces/:name", delete(remove_face))
        .route("/video_feed", get(video_feed))
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind to `host:port`, moving up to the next free port if it is taken.
pub fn bind_with_fallback(host: IpAddr, port: u16) -> Result<TcpListener> {
    let mut current_port = port;
    loop {
        let addr = SocketAddr::new(host, current_port);
        match TcpListener::bind(addr) {
            Ok(listener) => {
                // Tokio requires a non-blocking socket.
                listener.set_nonblocking(true)?;
                info!("Successfully bound to {}", addr);
                return Ok(listener);
            }
            Err(e) => {
                warn!("Failed to bind to {}: {}. Trying next port...", addr, e);
                current_port = current_port.wrapping_add(1);
                if current_port == 0 || current_port == port {
                    return Err(anyhow::anyhow!("No available ports found"));
                }
            }
        }
    }
}

pub async fn run_server(
    host: IpAddr,
    port: u16,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = bind_with_fallback(host, port)?;
    let app = router(state);

    let tokio_listener = tokio::net::TcpListener::from_std(listener)?;
    info!(
        "GODS_EYE server started on http://{:?}",
        tokio_listener.local_addr()?
    );

    axum::serve(tokio_listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("GODS_EYE server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_log::EventLog;
    use crate::face_registry::{IdentityRegistry, DEFAULT_MATCH_THRESHOLD};
    use crate::pipeline::broadcaster::{Broadcaster, FramePacket};
    use crate::pipeline::identity::{IdentityOracle, ScriptedEmbedder};
    use crate::pipeline::types::{DetectionEvent, PipelineState};
    use axum::body::{to_bytes, Body, Bytes};
    use axum::http::{header, Request, StatusCode};
    use chrono::{TimeZone, Utc};
    use futures::StreamExt;
    use image::{ImageFormat, Rgb, RgbImage};
    use serde_json::Value;
    use std::io::Cursor;
    use tempfile::TempDir;
    use tower::ServiceExt;

    const FACE: [u8; 3] = [200, 150, 120];
    const BOUNDARY: &str = "XBOUNDARYX";

    struct Harness {
        _dir: TempDir,
        state: Arc<AppState>,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let oracle: Arc<dyn IdentityOracle> =
            Arc::new(ScriptedEmbedder::new().with_face(FACE, vec![1.0, 0.0, 0.0]));
        let registry = IdentityRegistry::open(
            dir.path().join("faces.json"),
            oracle,
            DEFAULT_MATCH_THRESHOLD,
        )
        .unwrap();
        let events = EventLog::open(dir.path().join("events.csv"), 100).unwrap();
        let state = Arc::new(AppState {
            pipeline: Arc::new(PipelineState::new()),
            broadcaster: Arc::new(Broadcaster::new(4, 80)),
            events: Arc::new(events),
            registry: Arc::new(registry),
            default_log_limit: 50,
        });
        Harness { _dir: dir, state }
    }

    fn png(color: [u8; 3]) -> Vec<u8> {
        let mut out = Cursor::new(Vec::new());
        RgbImage::from_pixel(8, 8, Rgb(color))
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    fn upload(file_name: &str, data: &[u8]) -> Request<Body> {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(data);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Request::post("/faces")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(state: &Arc<AppState>, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::get(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let h = harness();
        let (status, body) = send(&h.state, get("/")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["system"], "GODS_EYE");
        assert_eq!(body["status"], "ONLINE");
    }

    #[tokio::test]
    async fn test_status_reports_latest_snapshot() {
        let h = harness();
        h.state.pipeline.update(|s| {
            s.person_detected = true;
            s.frame_count = 5;
            s.detections_count = 1;
        });

        let (status, body) = send(&h.state, get("/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["data"]["person_detected"], true);
        assert_eq!(body["data"]["frame_count"], 5);
        assert_eq!(body["data"]["detections_count"], 1);
        assert_eq!(body["data"]["pipeline"], "starting");
    }

    #[tokio::test]
    async fn test_logs_respects_limit_and_default() {
        let h = harness();
        for second in 0..3 {
            h.state
                .events
                .append(&DetectionEvent {
                    timestamp: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, second).unwrap(),
                    num_persons: second + 1,
                    confidence: 0.9,
                })
                .unwrap();
        }

        let (_, body) = send(&h.state, get("/logs?limit=2")).await;
        assert_eq!(body["count"], 2);
        assert_eq!(body["logs"][0]["num_persons"], 2);
        assert_eq!(body["logs"][1]["num_persons"], 3);
        assert!(body["logs"][0]["confidence"].is_number());

        let (_, body) = send(&h.state, get("/logs")).await;
        assert_eq!(body["status"], "success");
        assert_eq!(body["count"], 3);
    }

    #[tokio::test]
    async fn test_enroll_list_and_remove() {
        let h = harness();
        let (status, body) = send(&h.state, upload("alice.png", &png(FACE))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["name"], "alice");

        let (_, body) = send(&h.state, get("/faces")).await;
        assert_eq!(body["faces"], serde_json::json!(["alice"]));

        let delete = Request::delete("/faces/alice").body(Body::empty()).unwrap();
        let (status, body) = send(&h.state, delete).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], true);

        let (_, body) = send(&h.state, get("/faces")).await;
        assert_eq!(body["faces"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn test_enroll_without_face_fails_and_leaves_registry_unchanged() {
        let h = harness();
        send(&h.state, upload("alice.png", &png(FACE))).await;

        let (status, body) = send(&h.state, upload("bob.png", &png([0, 0, 255]))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].is_string());

        let (_, body) = send(&h.state, get("/faces")).await;
        assert_eq!(body["faces"], serde_json::json!(["alice"]));
    }

    #[tokio::test]
    async fn test_enroll_rejects_bad_uploads() {
        let h = harness();
        let (status, _) = send(&h.state, upload("carol.png", b"not an image")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = send(&h.state, upload("../etc.png", &png(FACE))).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _) = send(&h.state, upload("bad$name.png", &png(FACE))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = send(&h.state, get("/faces")).await;
        assert_eq!(body["faces"], serde_json::json!(["etc"]));
    }

    #[tokio::test]
    async fn test_remove_absent_name_succeeds() {
        let h = harness();
        let delete = Request::delete("/faces/nobody").body(Body::empty()).unwrap();
        let (status, body) = send(&h.state, delete).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["removed"], false);
    }

    #[tokio::test]
    async fn test_cors_allows_any_origin() {
        let h = harness();
        let request = Request::get("/status")
            .header(header::ORIGIN, "http://dashboard.local")
            .body(Body::empty())
            .unwrap();
        let response = router(h.state.clone()).oneshot(request).await.unwrap();
        assert!(response
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
    }

    #[tokio::test]
    async fn test_video_feed_streams_multipart_parts() {
        let h = harness();
        let response = router(h.state.clone())
            .oneshot(get("/video_feed"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "multipart/x-mixed-replace; boundary=frame"
        );

        // The handler has subscribed by the time the response exists.
        for seq in 10..=12 {
            h.state.broadcaster.publish_packet(FramePacket {
                seq,
                jpeg: Bytes::from_static(b"jpeg"),
            });
        }
        h.state.broadcaster.close();

        let mut stream = response.into_body().into_data_stream();
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        let text = String::from_utf8(body).unwrap();
        assert_eq!(text.matches("--frame\r\n").count(), 3);
        let seqs: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("X-Sequence: "))
            .collect();
        assert_eq!(seqs, vec!["10", "11", "12"]);
    }
}
