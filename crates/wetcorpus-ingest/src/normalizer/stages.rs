//! Pluggable cleaning stages
//!
//! Both hooks are plain traits with blanket impls for closures, so callers can
//! pass either a named type or a `|text, options| ...` function.

use serde_json::{Map, Value};
use wetcorpus_common::Corpus;

/// Keyword options forwarded unchanged from the batch call to the hooks
pub type StageOptions = Map<String, Value>;

/// Caller-supplied transformation run after character filtering
pub trait CustomStage: Send + Sync {
    fn apply(&self, text: String, options: &StageOptions) -> Corpus;
}

impl<F> CustomStage for F
where
    F: Fn(String, &StageOptions) -> Corpus + Send + Sync,
{
    fn apply(&self, text: String, options: &StageOptions) -> Corpus {
        self(text, options)
    }
}

/// Decides which lines survive line splitting (and may rewrite them)
pub trait LineFilter: Send + Sync {
    fn filter(&self, line: String) -> Option<String>;
}

impl<F> LineFilter for F
where
    F: Fn(String) -> Option<String> + Send + Sync,
{
    fn filter(&self, line: String) -> Option<String> {
        self(line)
    }
}

/// Default filter: drops empty and whitespace-only lines
#[derive(Debug, Clone, Copy, Default)]
pub struct DropBlankLines;

impl LineFilter for DropBlankLines {
    fn filter(&self, line: String) -> Option<String> {
        if line.trim().is_empty() {
            None
        } else {
            Some(line)
        }
    }
}

/// Read a string option, e.g. a language tag handed to a custom stage
pub fn option_str<'a>(options: &'a StageOptions, key: &str) -> Option<&'a str> {
    options.get(key).and_then(Value::as_str)
}
