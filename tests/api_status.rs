use anyhow::Result;
use chrono::Utc;
use serde_json::Value;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use watchpost::api::{ApiConfig, ApiHandle, ApiServer, ApiState};
use watchpost::encode::EncodedFrame;
use watchpost::{
    Category, CategoryClassifier, EvidenceStore, FrameBroadcaster, InMemoryEvidenceStore,
    StatusQuery,
};

fn read_response(stream: &mut TcpStream) -> Result<(String, String)> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let response = String::from_utf8_lossy(&raw).into_owned();
    let mut parts = response.splitn(2, "\r\n\r\n");
    let headers = parts.next().unwrap_or("").to_string();
    let body = parts.next().unwrap_or("").to_string();
    Ok((headers, body))
}

fn get(handle: &ApiHandle, path: &str) -> Result<(String, String)> {
    let mut stream = TcpStream::connect(handle.addr)?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n");
    stream.write_all(request.as_bytes())?;
    read_response(&mut stream)
}

struct TestApi {
    dir: tempfile::TempDir,
    store: Arc<InMemoryEvidenceStore>,
    api_handle: Option<ApiHandle>,
}

impl TestApi {
    fn new(broadcaster: Option<Arc<FrameBroadcaster>>) -> Result<Self> {
        let dir = tempdir()?;
        let store = Arc::new(InMemoryEvidenceStore::new());
        let classifier = CategoryClassifier::new(&[(
            "firearm".to_string(),
            vec!["gun".to_string(), "pistol".to_string()],
        )])?;
        let status = Arc::new(StatusQuery::new(
            Arc::clone(&store) as Arc<dyn EvidenceStore>,
            classifier,
            Duration::from_secs(30),
        ));
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            snapshot_root: dir.path().to_path_buf(),
            public_base_url: "http://cam.local:8080".to_string(),
        };
        let state = ApiState {
            store: Arc::clone(&store) as Arc<dyn EvidenceStore>,
            status,
            broadcaster,
        };
        let api_handle = ApiServer::new(api_config, state).spawn()?;
        Ok(Self {
            dir,
            store,
            api_handle: Some(api_handle),
        })
    }

    fn handle(&self) -> &ApiHandle {
        self.api_handle
            .as_ref()
            .expect("test API handle should be initialized")
    }

    fn record(&self, category: &str, age_secs: i64, snapshot: &str) -> Result<i64> {
        self.store.create(
            &Category::new(category),
            0.8,
            Utc::now() - chrono::Duration::seconds(age_secs),
            snapshot,
        )
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.api_handle.take() {
            handle.stop().expect("failed to stop API server");
        }
    }
}

#[test]
fn latest_status_is_idle_without_events() -> Result<()> {
    let api = TestApi::new(None)?;
    let (headers, body) = get(api.handle(), "/api/latest_status")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["status_level"], "IDLE");
    Ok(())
}

#[test]
fn recent_monitored_event_is_alert() -> Result<()> {
    let api = TestApi::new(None)?;
    api.record("firearm", 10, "firearm_1.jpg")?;
    let (headers, body) = get(api.handle(), "/api/latest_status")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["status_level"], "ALERT");
    assert!(value["message"].as_str().unwrap_or("").contains("FIREARM"));
    Ok(())
}

#[test]
fn stale_event_is_ok() -> Result<()> {
    let api = TestApi::new(None)?;
    api.record("firearm", 60, "firearm_2.jpg")?;
    let (_headers, body) = get(api.handle(), "/status")?;
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["level"], "OK");
    Ok(())
}

#[test]
fn events_carry_snapshot_urls_newest_first() -> Result<()> {
    let api = TestApi::new(None)?;
    api.record("firearm", 120, "firearm_old.jpg")?;
    api.record("firearm", 5, "firearm_new.jpg")?;

    let (headers, body) = get(api.handle(), "/events?limit=10")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_str(&body)?;
    let events = value.as_array().expect("event array");
    assert_eq!(events.len(), 2);
    assert_eq!(events[0]["snapshot_path"], "firearm_new.jpg");
    assert_eq!(
        events[0]["snapshot_url"],
        "http://cam.local:8080/snapshots/firearm_new.jpg"
    );
    assert_eq!(events[0]["review"], "new");

    let (headers, _body) = get(api.handle(), "/events?limit=abc")?;
    assert!(headers.contains("400 Bad Request"));
    Ok(())
}

#[test]
fn analytics_counts_by_day_and_category() -> Result<()> {
    let api = TestApi::new(None)?;
    api.record("firearm", 1, "a.jpg")?;
    api.record("firearm", 2, "b.jpg")?;
    let (headers, body) = get(api.handle(), "/analytics?days=7")?;
    assert!(headers.contains("200 OK"));
    let value: Value = serde_json::from_str(&body)?;
    assert_eq!(value["days"], 7);
    let total: u64 = value["counts"]
        .as_array()
        .expect("counts")
        .iter()
        .filter(|c| c["category"] == "firearm")
        .map(|c| c["count"].as_u64().unwrap_or(0))
        .sum();
    assert_eq!(total, 2);
    Ok(())
}

#[test]
fn snapshots_are_served_and_traversal_rejected() -> Result<()> {
    let api = TestApi::new(None)?;
    std::fs::write(api.dir.path().join("firearm_9.jpg"), b"\xFF\xD8jpeg\xFF\xD9")?;

    let (headers, _body) = get(api.handle(), "/snapshots/firearm_9.jpg")?;
    assert!(headers.contains("200 OK"));
    assert!(headers.contains("image/jpeg"));

    let (headers, _body) = get(api.handle(), "/snapshots/..%2F..%2Fetc%2Fpasswd")?;
    assert!(headers.contains("400 Bad Request"));
    let (headers, _body) = get(api.handle(), "/snapshots/../secret.jpg")?;
    assert!(headers.contains("400 Bad Request"));

    let (headers, _body) = get(api.handle(), "/snapshots/missing.jpg")?;
    assert!(headers.contains("404 Not Found"));
    Ok(())
}

#[test]
fn video_feed_is_unavailable_without_pipeline() -> Result<()> {
    let api = TestApi::new(None)?;
    let (headers, body) = get(api.handle(), "/video_feed")?;
    assert!(headers.contains("503 Service Unavailable"));
    assert!(body.contains(r#""error":"stream_unavailable""#));

    let (_headers, body) = get(api.handle(), "/health")?;
    assert!(body.contains(r#""pipeline":"unavailable""#));
    Ok(())
}

#[test]
fn non_get_requests_are_rejected() -> Result<()> {
    let api = TestApi::new(None)?;
    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.write_all(b"POST /events HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let (headers, _body) = read_response(&mut stream)?;
    assert!(headers.contains("405 Method Not Allowed"));
    Ok(())
}

#[test]
fn video_feed_streams_multipart_frames_until_closed() -> Result<()> {
    let broadcaster = Arc::new(FrameBroadcaster::new(4));
    let api = TestApi::new(Some(Arc::clone(&broadcaster)))?;

    let mut stream = TcpStream::connect(api.handle().addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    // The header is written only after the connection has subscribed.
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        let n = stream.read(&mut byte)?;
        assert_eq!(n, 1, "stream closed before headers were complete");
        head.push(byte[0]);
    }
    let head = String::from_utf8_lossy(&head).to_string();
    assert!(head.contains("200 OK"));
    assert!(head.contains("multipart/x-mixed-replace; boundary=frame"));

    broadcaster.publish(EncodedFrame {
        seq: 1,
        jpeg: vec![0xFF, 0xD8, 0x01, 0x02, 0xFF, 0xD9],
    });
    broadcaster.close();

    let mut rest = Vec::new();
    stream.read_to_end(&mut rest)?;
    let rest = String::from_utf8_lossy(&rest).to_string();
    assert!(rest.starts_with("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 6\r\n\r\n"));
    Ok(())
}
