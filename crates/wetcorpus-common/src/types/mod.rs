//! Common types used across wetcorpus

use serde::{Deserialize, Serialize};

/// Identifier of one remotely hosted compressed archive segment.
///
/// Usually a path relative to the archive base URL, e.g.
/// `crawl-data/CC-MAIN-2023-23/segments/1685224643388.45/wet/CC-MAIN-20230527223515-20230528013515-00000.warc.wet.gz`,
/// but absolute `http(s)://` URLs are accepted as well.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(String);

impl SegmentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the identifier is already a full URL
    pub fn is_absolute(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }

    /// Resolve the download URL against an archive base URL
    pub fn url(&self, base_url: &str) -> String {
        if self.is_absolute() {
            self.0.clone()
        } else {
            format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                self.0.trim_start_matches('/')
            )
        }
    }

    /// File name without directories and compression/container extensions,
    /// suitable as a prefix for working files
    pub fn file_stem(&self) -> &str {
        let name = self.0.rsplit('/').next().unwrap_or(&self.0);
        let name = name.split('?').next().unwrap_or(name);
        [".warc.wet.gz", ".warc.gz", ".wet.gz", ".gz"]
            .iter()
            .find_map(|ext| name.strip_suffix(ext))
            .unwrap_or(name)
    }
}

impl std::fmt::Display for SegmentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SegmentId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for SegmentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Aggregated text output of a cleaning step or of a whole batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Corpus {
    /// One concatenated string
    Text(String),
    /// Ordered lines (produced when line splitting is enabled)
    Lines(Vec<String>),
}

impl Default for Corpus {
    fn default() -> Self {
        Corpus::Text(String::new())
    }
}

impl Corpus {
    /// Size of the text content in bytes (line separators not counted)
    pub fn len_bytes(&self) -> usize {
        match self {
            Corpus::Text(text) => text.len(),
            Corpus::Lines(lines) => lines.iter().map(String::len).sum(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Corpus::Text(text) => text.is_empty(),
            Corpus::Lines(lines) => lines.is_empty(),
        }
    }

    pub fn is_lines(&self) -> bool {
        matches!(self, Corpus::Lines(_))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Corpus::Text(text) => Some(text),
            Corpus::Lines(_) => None,
        }
    }

    pub fn as_lines(&self) -> Option<&[String]> {
        match self {
            Corpus::Text(_) => None,
            Corpus::Lines(lines) => Some(lines),
        }
    }

    /// Render as a single string, joining lines with `\n`
    pub fn into_text(self) -> String {
        match self {
            Corpus::Text(text) => text,
            Corpus::Lines(lines) => lines.join("\n"),
        }
    }
}

/// Append-only ordered buffer that collects cleaned outputs and joins them once.
///
/// In text mode parts are concatenated without separators; in line mode every
/// part is one line.
#[derive(Debug, Clone, Default)]
pub struct CorpusBuffer {
    split_lines: bool,
    parts: Vec<String>,
    bytes: usize,
}

impl CorpusBuffer {
    pub fn new(split_lines: bool) -> Self {
        Self {
            split_lines,
            parts: Vec::new(),
            bytes: 0,
        }
    }

    /// Append a cleaned output
    pub fn push(&mut self, corpus: Corpus) {
        match corpus {
            Corpus::Text(text) => self.push_part(text),
            Corpus::Lines(lines) if self.split_lines => {
                for line in lines {
                    self.push_part(line);
                }
            },
            Corpus::Lines(lines) => self.push_part(lines.join("\n")),
        }
    }

    fn push_part(&mut self, part: String) {
        if self.split_lines || !part.is_empty() {
            self.bytes += part.len();
            self.parts.push(part);
        }
    }

    /// Accumulated size in bytes
    pub fn len_bytes(&self) -> usize {
        self.bytes
    }

    /// Number of parts appended so far
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Prune the tail so the buffer holds at most `limit` bytes.
    ///
    /// Whole trailing parts are dropped first. In text mode the last remaining
    /// part is then cut at the nearest char boundary; in line mode only whole
    /// lines are removed. Returns the number of bytes pruned.
    pub fn truncate_to(&mut self, limit: usize) -> usize {
        let before = self.bytes;
        while self.bytes > limit {
            let Some(last) = self.parts.last_mut() else {
                break;
            };
            let excess = self.bytes - limit;
            if self.split_lines || last.len() <= excess {
                self.bytes -= last.len();
                self.parts.pop();
            } else {
                let mut cut = last.len() - excess;
                while !last.is_char_boundary(cut) {
                    cut -= 1;
                }
                self.bytes -= last.len() - cut;
                last.truncate(cut);
            }
        }
        before - self.bytes
    }

    /// Join/collect the buffered parts
    pub fn finish(self) -> Corpus {
        if self.split_lines {
            Corpus::Lines(self.parts)
        } else {
            Corpus::Text(self.parts.concat())
        }
    }
}
