//! Shared fixtures for integration tests

#![allow(dead_code)]

use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::Write;
use std::path::Path;
use wetcorpus_ingest::IngestConfig;

/// One WARC record with CRLF framing
pub fn wet_record(kind: &str, uri: Option<&str>, payload: &[u8]) -> Vec<u8> {
    let mut out = format!("WARC/1.0\r\nWARC-Type: {}\r\n", kind).into_bytes();
    if let Some(uri) = uri {
        out.extend_from_slice(format!("WARC-Target-URI: {}\r\n", uri).as_bytes());
    }
    out.extend_from_slice(
        format!(
            "Content-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
            payload.len()
        )
        .as_bytes(),
    );
    out.extend_from_slice(payload);
    out.extend_from_slice(b"\r\n\r\n");
    out
}

/// Gzip each record as its own member, like real WET files
pub fn gzip_members(members: &[Vec<u8>]) -> Vec<u8> {
    let mut out = Vec::new();
    for member in members {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(member).expect("gzip write");
        out.extend(encoder.finish().expect("gzip finish"));
    }
    out
}

/// A compressed segment: a warcinfo record followed by one conversion
/// record per text
pub fn wet_segment(texts: &[&str]) -> Vec<u8> {
    let mut members = vec![wet_record("warcinfo", None, b"isPartOf: CC-TEST")];
    for (i, text) in texts.iter().enumerate() {
        let uri = format!("https://site{}.example/", i);
        members.push(wet_record("conversion", Some(&uri), text.as_bytes()));
    }
    gzip_members(&members)
}

/// Raw (uncompressed) segment bytes for comparison
pub fn wet_segment_raw(texts: &[&str]) -> Vec<u8> {
    let mut raw = wet_record("warcinfo", None, b"isPartOf: CC-TEST");
    for (i, text) in texts.iter().enumerate() {
        let uri = format!("https://site{}.example/", i);
        raw.extend(wet_record("conversion", Some(&uri), text.as_bytes()));
    }
    raw
}

/// Test config: no request spacing, fast retries, isolated work dir
pub fn test_config(base_url: &str, work_dir: &Path) -> IngestConfig {
    IngestConfig::builder()
        .base_url(base_url)
        .crawl_id("CC-TEST")
        .unit_count(2)
        .target_size_mb(1)
        .inter_request_delay_ms(0)
        .retry_backoff_ms(10)
        .max_retries(2)
        .request_timeout_secs(10)
        .work_dir(work_dir)
        .build()
}

/// Files currently in a directory
pub fn dir_entries(dir: &Path) -> Vec<String> {
    match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect(),
        Err(_) => Vec::new(),
    }
}
