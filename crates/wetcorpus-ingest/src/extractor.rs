//! WARC/WET record extraction
//!
//! Iterates the records of one decompressed archive file in on-disk order.
//! Only what is needed to find record boundaries is read from the headers
//! (`Content-Length`), plus `WARC-Type` and `WARC-Target-URI` for logging and
//! record selection. Everything else in the header block is skipped.
//!
//! ```text
//! WARC/1.0\r\n
//! WARC-Type: conversion\r\n
//! Content-Length: 11\r\n
//! \r\n
//! hello world\r\n
//! \r\n
//! ```

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use tracing::trace;
use wetcorpus_common::{CorpusError, Result};

/// Longest header line accepted before the record is rejected as malformed
const MAX_HEADER_LINE: usize = 64 * 1024;

/// One archive entry: payload bytes plus minimal metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    /// Byte offset of the `WARC/` version line in the file
    pub offset: u64,
    /// Byte offset of the first payload byte in the file
    pub payload_offset: u64,
    /// `WARC-Type` header, e.g. `warcinfo` or `conversion`
    pub record_type: Option<String>,
    /// `WARC-Target-URI` header
    pub target_uri: Option<String>,
    pub payload: Vec<u8>,
}

impl RawRecord {
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Whether this is the file-level `warcinfo` record rather than captured text
    pub fn is_warcinfo(&self) -> bool {
        self.record_type
            .as_deref()
            .is_some_and(|t| t.eq_ignore_ascii_case("warcinfo"))
    }

    /// Decode the payload to text
    pub fn decode(&self, encoding: TextEncoding, policy: DecodeErrorPolicy) -> Result<String> {
        encoding.decode(&self.payload, policy, self.payload_offset)
    }
}

/// Character encoding used to decode record payloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TextEncoding {
    #[default]
    Utf8,
    /// ISO-8859-1; every byte maps to the code point of the same value
    Latin1,
    Ascii,
}

/// What to do with byte sequences that are invalid in the chosen encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DecodeErrorPolicy {
    /// Fail at the first invalid sequence
    Strict,
    /// Substitute U+FFFD
    Replace,
    /// Drop invalid bytes silently
    #[default]
    Ignore,
}

impl TextEncoding {
    pub fn name(self) -> &'static str {
        match self {
            TextEncoding::Utf8 => "utf-8",
            TextEncoding::Latin1 => "latin-1",
            TextEncoding::Ascii => "ascii",
        }
    }

    /// Decode `bytes`; `base_offset` is only used in error reports
    pub fn decode(self, bytes: &[u8], policy: DecodeErrorPolicy, base_offset: u64) -> Result<String> {
        match self {
            TextEncoding::Latin1 => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            TextEncoding::Ascii => {
                let mut text = String::with_capacity(bytes.len());
                for (i, &b) in bytes.iter().enumerate() {
                    if b.is_ascii() {
                        text.push(char::from(b));
                        continue;
                    }
                    match policy {
                        DecodeErrorPolicy::Strict => {
                            return Err(self.error(base_offset + i as u64, format!("byte 0x{:02x} is not ASCII", b)))
                        },
                        DecodeErrorPolicy::Replace => text.push(char::REPLACEMENT_CHARACTER),
                        DecodeErrorPolicy::Ignore => {},
                    }
                }
                Ok(text)
            },
            TextEncoding::Utf8 => match policy {
                DecodeErrorPolicy::Strict => std::str::from_utf8(bytes)
                    .map(str::to_owned)
                    .map_err(|e| {
                        self.error(
                            base_offset + e.valid_up_to() as u64,
                            "invalid utf-8 sequence".to_string(),
                        )
                    }),
                DecodeErrorPolicy::Replace | DecodeErrorPolicy::Ignore => {
                    let mut text = String::with_capacity(bytes.len());
                    for chunk in bytes.utf8_chunks() {
                        text.push_str(chunk.valid());
                        if !chunk.invalid().is_empty() && policy == DecodeErrorPolicy::Replace {
                            text.push(char::REPLACEMENT_CHARACTER);
                        }
                    }
                    Ok(text)
                },
            },
        }
    }

    fn error(self, offset: u64, detail: String) -> CorpusError {
        CorpusError::Decode {
            offset,
            encoding: self.name().to_string(),
            detail,
        }
    }
}

impl std::str::FromStr for TextEncoding {
    type Err = CorpusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "utf-8" | "utf8" => Ok(TextEncoding::Utf8),
            "latin-1" | "latin1" | "iso-8859-1" => Ok(TextEncoding::Latin1),
            "ascii" | "us-ascii" => Ok(TextEncoding::Ascii),
            other => Err(CorpusError::config(format!("Unsupported encoding: {}", other))),
        }
    }
}

impl std::str::FromStr for DecodeErrorPolicy {
    type Err = CorpusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(DecodeErrorPolicy::Strict),
            "replace" => Ok(DecodeErrorPolicy::Replace),
            "ignore" => Ok(DecodeErrorPolicy::Ignore),
            other => Err(CorpusError::config(format!(
                "Unsupported decode policy: {} (expected strict, replace or ignore)",
                other
            ))),
        }
    }
}

/// Lazy, single-pass iterator over the records of a WARC stream
pub struct WarcReader<R> {
    reader: R,
    offset: u64,
    line: Vec<u8>,
    finished: bool,
}

impl WarcReader<BufReader<File>> {
    /// Open a decompressed archive file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        Ok(Self::new(BufReader::with_capacity(256 * 1024, file)))
    }
}

impl<R: BufRead> WarcReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            offset: 0,
            line: Vec::new(),
            finished: false,
        }
    }

    /// Read one line into `self.line` (terminator stripped). `Ok(false)` at EOF.
    fn read_line(&mut self) -> Result<bool> {
        self.line.clear();
        let read = (&mut self.reader)
            .take(MAX_HEADER_LINE as u64 + 1)
            .read_until(b'\n', &mut self.line)?;
        if read == 0 {
            return Ok(false);
        }
        self.offset += read as u64;
        if self.line.last() != Some(&b'\n') && read > MAX_HEADER_LINE {
            return Err(CorpusError::parse(format!(
                "header line at byte {} exceeds {} bytes",
                self.offset - read as u64,
                MAX_HEADER_LINE
            )));
        }
        while matches!(self.line.last(), Some(b'\n') | Some(b'\r')) {
            self.line.pop();
        }
        Ok(true)
    }

    fn read_record(&mut self) -> Result<Option<RawRecord>> {
        // Skip blank separator lines left over from the previous record
        let start = loop {
            let start = self.offset;
            if !self.read_line()? {
                return Ok(None);
            }
            if !self.line.is_empty() {
                break start;
            }
        };

        if !self.line.starts_with(b"WARC/") {
            return Err(CorpusError::parse(format!(
                "expected WARC version line at byte {}, found {:?}",
                start,
                String::from_utf8_lossy(&self.line[..self.line.len().min(32)])
            )));
        }

        let mut content_length = None;
        let mut record_type = None;
        let mut target_uri = None;

        loop {
            if !self.read_line()? {
                return Err(CorpusError::parse(format!(
                    "unexpected end of file in headers of record at byte {}",
                    start
                )));
            }
            if self.line.is_empty() {
                break;
            }
            let Some(colon) = self.line.iter().position(|&b| b == b':') else {
                continue;
            };
            let name = String::from_utf8_lossy(&self.line[..colon]);
            let value = String::from_utf8_lossy(&self.line[colon + 1..]).trim().to_string();
            if name.eq_ignore_ascii_case("Content-Length") {
                let length = value.parse::<u64>().map_err(|_| {
                    CorpusError::parse(format!(
                        "invalid Content-Length '{}' in record at byte {}",
                        value, start
                    ))
                })?;
                content_length = Some(length);
            } else if name.eq_ignore_ascii_case("WARC-Type") {
                record_type = Some(value);
            } else if name.eq_ignore_ascii_case("WARC-Target-URI") {
                target_uri = Some(value);
            }
        }

        let length = content_length.ok_or_else(|| {
            CorpusError::parse(format!("record at byte {} has no Content-Length", start))
        })?;

        let payload_offset = self.offset;
        let mut payload = Vec::new();
        let read = (&mut self.reader).take(length).read_to_end(&mut payload)?;
        self.offset += read as u64;
        if (read as u64) < length {
            return Err(CorpusError::parse(format!(
                "record at byte {} truncated: expected {} payload bytes, got {}",
                start, length, read
            )));
        }

        trace!(offset = start, length, record_type = ?record_type, "Read WARC record");

        Ok(Some(RawRecord {
            offset: start,
            payload_offset,
            record_type,
            target_uri,
            payload,
        }))
    }
}

impl<R: BufRead> Iterator for WarcReader<R> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            },
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            },
        }
    }
}
