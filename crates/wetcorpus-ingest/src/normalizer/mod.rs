//! Text cleaning pipeline
//!
//! Stages always run in the same order:
//!
//! 1. HTML tag stripping (`<.*?>`, single line, entities untouched)
//! 2. Character-class filtering against the retained set
//! 3. Optional custom stage
//! 4. Optional line splitting followed by the line filter
//!
//! [`TextNormalizer::process`] drives the pipeline over every record of one
//! decompressed segment file.

pub mod stages;

pub use stages::{CustomStage, DropBlankLines, LineFilter, StageOptions};

use crate::config::CleaningSettings;
use crate::extractor::{DecodeErrorPolicy, TextEncoding, WarcReader};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wetcorpus_common::{Corpus, CorpusBuffer, CorpusError, Result};

const HTML_TAG_PATTERN: &str = "<.*?>";

/// What an interrupted run hands back
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InterruptPolicy {
    /// Fail the whole operation
    Abort,
    /// Return what was accumulated so far, flagged as interrupted
    #[default]
    KeepPartial,
}

impl std::str::FromStr for InterruptPolicy {
    type Err = CorpusError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('_', "-").as_str() {
            "abort" => Ok(InterruptPolicy::Abort),
            "keep-partial" | "partial" => Ok(InterruptPolicy::KeepPartial),
            other => Err(CorpusError::config(format!(
                "Invalid interrupt policy: {}. Must be 'abort' or 'keep-partial'",
                other
            ))),
        }
    }
}

/// Full cleaning configuration including hooks
#[derive(Clone)]
pub struct CleaningConfig {
    pub remove_html: bool,
    pub strip_non_language_chars: bool,
    pub split_lines: bool,
    pub retained_chars: String,
    pub custom_stage: Option<Arc<dyn CustomStage>>,
    pub line_filter: Arc<dyn LineFilter>,
    pub stage_options: StageOptions,
}

impl Default for CleaningConfig {
    fn default() -> Self {
        Self::from(&CleaningSettings::default())
    }
}

impl From<&CleaningSettings> for CleaningConfig {
    fn from(settings: &CleaningSettings) -> Self {
        Self {
            remove_html: settings.remove_html,
            strip_non_language_chars: settings.strip_non_language_chars,
            split_lines: settings.split_lines,
            retained_chars: settings.retained_chars.clone(),
            custom_stage: None,
            line_filter: Arc::new(DropBlankLines),
            stage_options: StageOptions::new(),
        }
    }
}

impl std::fmt::Debug for CleaningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleaningConfig")
            .field("remove_html", &self.remove_html)
            .field("strip_non_language_chars", &self.strip_non_language_chars)
            .field("split_lines", &self.split_lines)
            .field("retained_chars", &self.retained_chars)
            .field("custom_stage", &self.custom_stage.is_some())
            .field("stage_options", &self.stage_options)
            .finish_non_exhaustive()
    }
}

impl CleaningConfig {
    pub fn with_custom_stage(mut self, stage: impl CustomStage + 'static) -> Self {
        self.custom_stage = Some(Arc::new(stage));
        self
    }

    pub fn with_line_filter(mut self, filter: impl LineFilter + 'static) -> Self {
        self.line_filter = Arc::new(filter);
        self
    }

    pub fn with_stage_options(mut self, options: StageOptions) -> Self {
        self.stage_options = options;
        self
    }
}

/// Per-file settings for [`TextNormalizer::process`]
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    pub encoding: TextEncoding,
    pub decode_policy: DecodeErrorPolicy,
    pub interrupt_policy: InterruptPolicy,
    pub include_warcinfo: bool,
    /// Merged over the configured stage options
    pub stage_options: StageOptions,
}

/// Cleaned output of one segment file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedSegment {
    pub corpus: Corpus,
    /// Records fed through the pipeline
    pub records: usize,
    /// Set when cancellation cut the file short
    pub interrupted: bool,
}

/// Compiled, stateless cleaning pipeline
#[derive(Debug, Clone)]
pub struct TextNormalizer {
    config: CleaningConfig,
    html_tags: Regex,
    excluded_chars: Regex,
}

impl TextNormalizer {
    pub fn new(config: CleaningConfig) -> Result<Self> {
        let html_tags = Regex::new(HTML_TAG_PATTERN)
            .map_err(|e| CorpusError::config(format!("Invalid HTML pattern: {}", e)))?;

        if config.strip_non_language_chars && config.retained_chars.is_empty() {
            return Err(CorpusError::config("Retained character set cannot be empty"));
        }
        // `\n` must survive filtering so lines can still be split afterwards
        let pattern = if config.split_lines {
            format!("[^{}\\n]", config.retained_chars)
        } else {
            format!("[^{}]", config.retained_chars)
        };
        let excluded_chars = Regex::new(&pattern).map_err(|e| {
            CorpusError::config(format!(
                "Invalid retained character set '{}': {}",
                config.retained_chars, e
            ))
        })?;

        Ok(Self {
            config,
            html_tags,
            excluded_chars,
        })
    }

    pub fn config(&self) -> &CleaningConfig {
        &self.config
    }

    pub fn split_lines(&self) -> bool {
        self.config.split_lines
    }

    /// Remove `<...>` tags; never spans a newline
    pub fn strip_html(&self, text: &str) -> String {
        self.html_tags.replace_all(text, "").into_owned()
    }

    /// Delete every character outside the retained set
    pub fn filter_chars(&self, text: &str) -> String {
        self.excluded_chars.replace_all(text, "").into_owned()
    }

    /// Run the enabled stages over one decoded record
    pub fn clean(&self, text: String) -> Corpus {
        self.clean_with(text, &self.config.stage_options)
    }

    fn clean_with(&self, mut text: String, options: &StageOptions) -> Corpus {
        if self.config.remove_html {
            text = self.strip_html(&text);
        }
        if self.config.strip_non_language_chars {
            text = self.filter_chars(&text);
        }

        let corpus = match &self.config.custom_stage {
            Some(stage) => stage.apply(text, options),
            None => Corpus::Text(text),
        };

        if !self.config.split_lines {
            return corpus;
        }

        let lines = match corpus {
            Corpus::Text(text) => text.split('\n').map(str::to_owned).collect(),
            Corpus::Lines(lines) => lines,
        };
        Corpus::Lines(
            lines
                .into_iter()
                .filter_map(|line| self.config.line_filter.filter(line))
                .collect(),
        )
    }

    /// Extract, decode and clean every record of a decompressed segment file.
    ///
    /// Blocking; run it on a blocking thread from async code.
    pub fn process(
        &self,
        path: &Path,
        options: &ProcessOptions,
        cancel: &CancellationToken,
    ) -> Result<ProcessedSegment> {
        let mut stage_options = self.config.stage_options.clone();
        stage_options.extend(options.stage_options.clone());

        let mut buffer = CorpusBuffer::new(self.config.split_lines);
        let mut records = 0usize;
        let mut skipped = 0usize;

        for record in WarcReader::open(path)? {
            if cancel.is_cancelled() {
                return match options.interrupt_policy {
                    InterruptPolicy::KeepPartial => {
                        info!(
                            path = %path.display(),
                            records,
                            bytes = buffer.len_bytes(),
                            "Extraction interrupted, keeping partial output"
                        );
                        Ok(ProcessedSegment {
                            corpus: buffer.finish(),
                            records,
                            interrupted: true,
                        })
                    },
                    InterruptPolicy::Abort => Err(CorpusError::interrupted("extract", None)),
                };
            }

            let record = record?;
            if record.is_warcinfo() && !options.include_warcinfo {
                skipped += 1;
                continue;
            }

            let text = record.decode(options.encoding, options.decode_policy)?;
            buffer.push(self.clean_with(text, &stage_options));
            records += 1;
        }

        debug!(
            path = %path.display(),
            records,
            skipped,
            bytes = buffer.len_bytes(),
            "Processed segment file"
        );

        Ok(ProcessedSegment {
            corpus: buffer.finish(),
            records,
            interrupted: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    const SAMPLE: &str = "<p>Hello World! 123</p>\n<b>foo</b>";

    fn normalizer(split_lines: bool) -> TextNormalizer {
        TextNormalizer::new(CleaningConfig {
            split_lines,
            ..CleaningConfig::default()
        })
        .unwrap()
    }

    fn write_wet(dir: &Path, payloads: &[(&str, &[u8])]) -> std::path::PathBuf {
        let mut data = Vec::new();
        for (kind, payload) in payloads {
            data.extend_from_slice(
                format!(
                    "WARC/1.0\r\nWARC-Type: {}\r\nContent-Length: {}\r\n\r\n",
                    kind,
                    payload.len()
                )
                .as_bytes(),
            );
            data.extend_from_slice(payload);
            data.extend_from_slice(b"\r\n\r\n");
        }
        let path = dir.join("sample.warc.wet");
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn test_clean_text_mode() {
        assert_eq!(
            normalizer(false).clean(SAMPLE.to_string()),
            Corpus::Text("Hello World 123foo".to_string())
        );
    }

    #[test]
    fn test_clean_line_mode() {
        assert_eq!(
            normalizer(true).clean(SAMPLE.to_string()),
            Corpus::Lines(vec!["Hello World 123".to_string(), "foo".to_string()])
        );
    }

    #[test]
    fn test_split_matches_manual_split() {
        let text = "alpha\n\n  \nbeta gamma\n\n";
        let expected: Vec<String> = text
            .split('\n')
            .filter(|l| !l.trim().is_empty())
            .map(str::to_owned)
            .collect();
        assert_eq!(normalizer(true).clean(text.to_string()), Corpus::Lines(expected));
    }

    #[test]
    fn test_html_does_not_span_lines() {
        let n = normalizer(false);
        assert_eq!(n.strip_html("a <b\nc> d"), "a <b\nc> d");
        assert_eq!(n.strip_html("x&amp;<i>y</i>"), "x&amp;y");
    }

    #[test]
    fn test_disabled_stages_pass_through() {
        let n = TextNormalizer::new(CleaningConfig {
            remove_html: false,
            strip_non_language_chars: false,
            ..CleaningConfig::default()
        })
        .unwrap();
        assert_eq!(n.clean(SAMPLE.to_string()), Corpus::Text(SAMPLE.to_string()));
    }

    #[test]
    fn test_custom_retained_chars() {
        let n = TextNormalizer::new(CleaningConfig {
            retained_chars: "a-z".to_string(),
            ..CleaningConfig::default()
        })
        .unwrap();
        assert_eq!(n.filter_chars("Abc 12 déf"), "bcdf");
    }

    #[test]
    fn test_invalid_retained_chars_is_config_error() {
        let err = TextNormalizer::new(CleaningConfig {
            retained_chars: "z-a".to_string(),
            ..CleaningConfig::default()
        })
        .unwrap_err();
        assert!(matches!(err, CorpusError::Config(_)));
    }

    #[test]
    fn test_custom_stage_receives_options() {
        let mut options = StageOptions::new();
        options.insert("suffix".to_string(), Value::from("!"));

        let config = CleaningConfig::default()
            .with_custom_stage(|text: String, options: &StageOptions| {
                let suffix = stages::option_str(options, "suffix").unwrap_or_default();
                Corpus::Text(format!("{}{}", text.to_uppercase(), suffix))
            })
            .with_stage_options(options);
        let n = TextNormalizer::new(config).unwrap();
        assert_eq!(n.clean("<i>ab</i> c".to_string()), Corpus::Text("AB C!".to_string()));
    }

    #[test]
    fn test_custom_stage_lines_still_filtered() {
        let config = CleaningConfig {
            split_lines: true,
            ..CleaningConfig::default()
        }
        .with_custom_stage(|text: String, _: &StageOptions| {
            Corpus::Lines(vec![text, "   ".to_string(), "a\nb".to_string()])
        });
        let n = TextNormalizer::new(config).unwrap();
        // Lines from the custom stage are not split again
        assert_eq!(
            n.clean("x".to_string()),
            Corpus::Lines(vec!["x".to_string(), "a\nb".to_string()])
        );
    }

    #[test]
    fn test_custom_line_filter() {
        let config = CleaningConfig {
            split_lines: true,
            ..CleaningConfig::default()
        }
        .with_line_filter(|line: String| (line.len() > 3).then(|| line.to_lowercase()));
        let n = TextNormalizer::new(config).unwrap();
        assert_eq!(
            n.clean("Hi\nHello\nBye\nGoodbye".to_string()),
            Corpus::Lines(vec!["hello".to_string(), "goodbye".to_string()])
        );
    }

    #[test]
    fn test_process_skips_warcinfo() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wet(
            dir.path(),
            &[
                ("warcinfo", b"software: crawler".as_slice()),
                ("conversion", b"<p>first</p>".as_slice()),
                ("conversion", b"second\nline".as_slice()),
            ],
        );

        let result = normalizer(true)
            .process(&path, &ProcessOptions::default(), &CancellationToken::new())
            .unwrap();
        assert_eq!(result.records, 2);
        assert!(!result.interrupted);
        assert_eq!(
            result.corpus,
            Corpus::Lines(vec!["first".to_string(), "second".to_string(), "line".to_string()])
        );

        let with_info = ProcessOptions {
            include_warcinfo: true,
            ..ProcessOptions::default()
        };
        let result = normalizer(false)
            .process(&path, &with_info, &CancellationToken::new())
            .unwrap();
        assert_eq!(result.records, 3);
        assert_eq!(result.corpus, Corpus::Text("software crawlerfirstsecondline".to_string()));
    }

    #[test]
    fn test_process_strict_decode_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wet(dir.path(), &[("conversion", b"bad \xff byte".as_slice())]);
        let options = ProcessOptions {
            decode_policy: DecodeErrorPolicy::Strict,
            ..ProcessOptions::default()
        };
        let err = normalizer(false)
            .process(&path, &options, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, CorpusError::Decode { .. }));
    }

    #[test]
    fn test_process_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wet(dir.path(), &[("conversion", b"text".as_slice())]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let partial = normalizer(false)
            .process(&path, &ProcessOptions::default(), &cancel)
            .unwrap();
        assert!(partial.interrupted);
        assert_eq!(partial.records, 0);

        let abort = ProcessOptions {
            interrupt_policy: InterruptPolicy::Abort,
            ..ProcessOptions::default()
        };
        let err = normalizer(false).process(&path, &abort, &cancel).unwrap_err();
        assert!(err.is_interrupted());
    }

    /// Normalizer whose custom stage fires `cancel` on the first record it sees
    fn cancelling_normalizer(cancel: &CancellationToken) -> TextNormalizer {
        let cancel = cancel.clone();
        TextNormalizer::new(CleaningConfig::default().with_custom_stage(
            move |text: String, _: &StageOptions| {
                cancel.cancel();
                Corpus::Text(text)
            },
        ))
        .unwrap()
    }

    #[test]
    fn test_process_interrupted_mid_file_keeps_cleaned_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_wet(
            dir.path(),
            &[
                ("warcinfo", b"software: crawler".as_slice()),
                ("conversion", b"<p>first</p>".as_slice()),
                ("conversion", b"second".as_slice()),
                ("conversion", b"third".as_slice()),
            ],
        );

        let cancel = CancellationToken::new();
        let partial = cancelling_normalizer(&cancel)
            .process(&path, &ProcessOptions::default(), &cancel)
            .unwrap();
        assert!(partial.interrupted);
        assert_eq!(partial.records, 1);
        assert_eq!(partial.corpus, Corpus::Text("first".to_string()));

        let abort = ProcessOptions {
            interrupt_policy: InterruptPolicy::Abort,
            ..ProcessOptions::default()
        };
        let cancel = CancellationToken::new();
        let err = cancelling_normalizer(&cancel)
            .process(&path, &abort, &cancel)
            .unwrap_err();
        assert!(err.is_interrupted());
    }

    #[test]
    fn test_interrupt_policy_parsing() {
        assert_eq!("keep_partial".parse::<InterruptPolicy>().unwrap(), InterruptPolicy::KeepPartial);
        assert_eq!("ABORT".parse::<InterruptPolicy>().unwrap(), InterruptPolicy::Abort);
        assert!("ignore".parse::<InterruptPolicy>().is_err());
    }

    proptest::proptest! {
        #[test]
        fn prop_strip_html_idempotent(text in "[a-z<>/ \n]{0,40}") {
            let n = normalizer(false);
            let once = n.strip_html(&text);
            proptest::prop_assert_eq!(n.strip_html(&once), once);
        }

        #[test]
        fn prop_filter_chars_idempotent(text in "\\PC{0,40}", split in proptest::bool::ANY) {
            let n = normalizer(split);
            let once = n.filter_chars(&text);
            proptest::prop_assert_eq!(n.filter_chars(&once), once.clone());
            proptest::prop_assert!(once.chars().all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '_' || (split && c == '\n')));
        }
    }
}
