//! Directive decomposition.
//!
//! A [`Decomposer`] turns a directive into sub-task specifications. The
//! bundled [`KeywordDecomposer`] does this without any model: it splits the
//! text into sequential stages and parallel parts and routes each part to a
//! capability by keyword.

use crate::core::{Capability, Decomposition, Directive, SubTaskSpec};
use crate::error::{Error, Result};
use async_trait::async_trait;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

/// Stage separators: the word "then" or a line break.
static STAGE_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bthen\b|\r?\n").expect("static regex is valid"));

/// Parallel part separator.
static PART_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*;\s*").expect("static regex is valid"));

/// Keyword routing table, checked in order. The first hit wins.
const ROUTES: &[(&[&str], &str)] = &[
    (&["code", "program", "develop", "build"], Capability::CODING),
    (&["design", "ui", "visual", "interface"], Capability::DESIGN),
    (&["research", "analyze", "study", "investigate"], Capability::RESEARCH),
    (&["write", "document", "text", "content"], Capability::WRITING),
    (&["format", "process", "convert"], Capability::DATA_PROCESSING),
    (&["communicate", "send", "notify"], Capability::COMMUNICATION),
];

/// Produces the sub-task graph for a directive.
///
/// Any error returned is recorded on the task as a decomposition failure.
#[async_trait]
pub trait Decomposer: Send + Sync {
    async fn decompose(&self, directive: &Directive) -> Result<Decomposition>;
}

#[async_trait]
impl<F> Decomposer for F
where
    F: Fn(&Directive) -> Result<Decomposition> + Send + Sync,
{
    async fn decompose(&self, directive: &Directive) -> Result<Decomposition> {
        self(directive)
    }
}

/// Rule-based decomposer.
///
/// `"research the market; sketch a logo then write the report"` becomes
/// two parallel sub-tasks (`s1` research, `s2` design) followed by `s3`
/// (writing) which depends on both.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeywordDecomposer;

impl KeywordDecomposer {
    pub fn new() -> Self {
        Self
    }

    /// Capability for a piece of text, using the keyword routing table.
    pub fn route(text: &str) -> Capability {
        let lower = text.to_lowercase();
        let tag = ROUTES
            .iter()
            .find(|(keywords, _)| keywords.iter().any(|k| lower.contains(k)))
            .map(|(_, tag)| *tag)
            .unwrap_or(Capability::DATA_PROCESSING);
        Capability::from(tag)
    }

    fn stages(text: &str) -> Vec<Vec<String>> {
        STAGE_SPLIT
            .split(text)
            .map(|stage| {
                PART_SPLIT
                    .split(stage)
                    .map(clean)
                    .filter(|part| !part.is_empty())
                    .collect::<Vec<_>>()
            })
            .filter(|parts| !parts.is_empty())
            .collect()
    }
}

#[async_trait]
impl Decomposer for KeywordDecomposer {
    async fn decompose(&self, directive: &Directive) -> Result<Decomposition> {
        let stages = Self::stages(&directive.text);
        if stages.is_empty() {
            return Err(Error::DecompositionFailed(
                "directive contains no actionable text".to_string(),
            ));
        }

        let mut decomposition = Decomposition::default();
        let mut previous: Vec<String> = Vec::new();
        let mut next_id = 1;
        for parts in stages {
            let mut current = Vec::with_capacity(parts.len());
            for part in parts {
                let id = format!("s{}", next_id);
                next_id += 1;
                let spec = SubTaskSpec::new(id.as_str(), &part)
                    .depends_on(previous.iter().map(String::as_str))
                    .capability(Self::route(&part));
                decomposition = decomposition.with(spec);
                current.push(id);
            }
            previous = current;
        }

        debug!(sub_tasks = decomposition.len(), "directive decomposed");
        Ok(decomposition)
    }
}

fn clean(part: &str) -> String {
    part.trim_matches(|c: char| c.is_whitespace() || matches!(c, ',' | '.'))
        .trim_start_matches("and ")
        .trim()
        .to_string()
}
