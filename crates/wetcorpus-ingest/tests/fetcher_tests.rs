//! Integration tests for segment download and decompression

mod common;

use common::{wet_segment, wet_segment_raw};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use wetcorpus_ingest::progress::ProgressDisplay;
use wetcorpus_ingest::{CorpusError, FetchError, SegmentFetcher, SegmentId, SegmentPaths};
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

fn fetcher(dir: &TempDir) -> SegmentFetcher {
    SegmentFetcher::with_client(reqwest::Client::new(), dir.path(), ProgressDisplay::new(false))
}

#[tokio::test]
async fn test_fetch_decompresses_and_removes_archive() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/segments/a.warc.wet.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(wet_segment(&["hello", "world"])))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir);
    let paths = fetcher.paths_for(&SegmentId::from("segments/a.warc.wet.gz"));
    let url = format!("{}/segments/a.warc.wet.gz", server.uri());

    let fetched = fetcher
        .fetch(&url, &paths, &CancellationToken::new())
        .await
        .unwrap();

    let expected = wet_segment_raw(&["hello", "world"]);
    assert_eq!(fetched.path, paths.decompressed);
    assert_eq!(fetched.decompressed_bytes, expected.len() as u64);
    assert_eq!(std::fs::read(&paths.decompressed).unwrap(), expected);
    assert!(!paths.compressed.exists());
}

#[tokio::test]
async fn test_fetch_404_is_network_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir);
    let paths = fetcher.paths_for(&SegmentId::from("missing.warc.wet.gz"));
    let url = format!("{}/missing.warc.wet.gz", server.uri());

    let err: CorpusError = fetcher
        .fetch(&url, &paths, &CancellationToken::new())
        .await
        .unwrap_err()
        .into();

    match err {
        CorpusError::Network { status, reason, url: failed } => {
            assert_eq!(status, Some(404));
            assert_eq!(reason, "Not Found");
            assert_eq!(failed, url);
        },
        other => panic!("expected network error, got {other}"),
    }
    assert!(paths.leftovers().is_empty());
}

#[tokio::test]
async fn test_fetch_rate_limited_reports_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503).insert_header("Retry-After", "3"))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir);
    let paths = fetcher.paths_for(&SegmentId::from("busy.warc.wet.gz"));
    let url = format!("{}/busy.warc.wet.gz", server.uri());

    let err = fetcher
        .fetch(&url, &paths, &CancellationToken::new())
        .await
        .unwrap_err();

    match err {
        FetchError::RateLimited { status, retry_after, .. } => {
            assert_eq!(status, 503);
            assert_eq!(retry_after, Some(Duration::from_secs(3)));
        },
        other => panic!("expected rate limit, got {other}"),
    }
}

#[tokio::test]
async fn test_fetch_connection_refused_has_no_status() {
    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir);
    let paths = fetcher.paths_for(&SegmentId::from("x.warc.wet.gz"));

    // Port 9 (discard) is not served in test environments
    let err: CorpusError = fetcher
        .fetch("http://127.0.0.1:9/x.warc.wet.gz", &paths, &CancellationToken::new())
        .await
        .unwrap_err()
        .into();
    assert!(matches!(err, CorpusError::Network { status: None, .. }));
}

#[tokio::test]
async fn test_fetch_cancelled_before_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(wet_segment(&["never"])))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir);
    let paths = fetcher.paths_for(&SegmentId::from("a.warc.wet.gz"));
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err: CorpusError = fetcher
        .fetch(&format!("{}/a.warc.wet.gz", server.uri()), &paths, &cancel)
        .await
        .unwrap_err()
        .into();
    assert!(err.is_interrupted());
}

/// Serves response headers and `body` out of a larger declared length, then
/// stalls until `release` fires. `sent` fires once the bytes are written.
async fn stalling_server(body: &'static [u8]) -> (String, oneshot::Receiver<()>, oneshot::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (sent_tx, sent_rx) = oneshot::channel();
    let (release_tx, release_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut request = [0u8; 4096];
        let _ = socket.read(&mut request).await.unwrap();
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
            body.len() * 100
        );
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.write_all(body).await.unwrap();
        socket.flush().await.unwrap();
        let _ = sent_tx.send(());
        let _ = release_rx.await;
    });

    (format!("http://{}/slow.warc.wet.gz", addr), sent_rx, release_tx)
}

#[tokio::test]
async fn test_fetch_cancelled_mid_stream_keeps_partial_file() {
    const RECEIVED: &[u8] = b"\x1f\x8b partial gz";
    let (url, sent, release) = stalling_server(RECEIVED).await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir);
    let paths = fetcher.paths_for(&SegmentId::from("slow.warc.wet.gz"));
    let cancel = CancellationToken::new();

    let canceller = async {
        sent.await.unwrap();
        // Let the client drain the bytes already on the wire
        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(fetcher.fetch(&url, &paths, &cancel), canceller);

    let err: CorpusError = result.unwrap_err().into();
    match err {
        CorpusError::Interrupted { stage, partial } => {
            assert_eq!(stage, "download");
            assert_eq!(partial.as_deref(), Some(paths.compressed.as_path()));
        },
        other => panic!("expected interruption, got {other}"),
    }
    assert_eq!(std::fs::read(&paths.compressed).unwrap(), RECEIVED);
    assert!(!paths.decompressed.exists());

    let _ = release.send(());
}

#[tokio::test]
async fn test_corrupt_archive_leaves_compressed_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"definitely not gzip".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let fetcher = fetcher(&dir);
    let paths: SegmentPaths = fetcher.paths_for(&SegmentId::from("bad.warc.wet.gz"));

    let result = fetcher
        .fetch(&format!("{}/bad.warc.wet.gz", server.uri()), &paths, &CancellationToken::new())
        .await;
    assert!(result.is_err());
    assert!(paths.compressed.exists());

    paths.remove().unwrap();
    assert!(paths.leftovers().is_empty());
}
