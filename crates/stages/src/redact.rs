//! PII redaction with typed placeholder tokens (`[EMAIL]`, `[PHONE]`, ...).

use std::collections::BTreeMap;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::StageError;
use crate::stage::{Stage, StageData, StageKind};

/// One redaction pattern, as it appears in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedactionRule {
    /// Counter key; the placeholder is `[KIND]` in upper case.
    pub kind: String,
    pub pattern: String,
}

impl RedactionRule {
    pub fn new(kind: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            pattern: pattern.into(),
        }
    }

    /// Default rule set. Order matters: longer digit runs are matched before
    /// the shorter shapes they contain.
    pub fn builtin() -> Vec<RedactionRule> {
        vec![
            Self::new("email", r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b"),
            Self::new("credit_card", r"\b\d{4}[- ]\d{4}[- ]\d{4}[- ]\d{4}\b"),
            Self::new("ssn", r"\b\d{3}-\d{2}-\d{4}\b"),
            Self::new("phone", r"\b\d{3}[-.]\d{3}[-.]\d{4}\b"),
            Self::new("ip_address", r"\b\d{1,3}\.\d{1,3}\.\d{1,3}\.\d{1,3}\b"),
            Self::new("iban", r"\b[A-Z]{2}\d{2}[A-Z0-9]{10,30}\b"),
            Self::new("credit_card", r"\b\d{13,16}\b"),
        ]
    }
}

#[derive(Debug, Clone)]
struct CompiledRule {
    kind: String,
    placeholder: String,
    regex: Regex,
}

/// Compiled redaction rules.
#[derive(Debug, Clone)]
pub struct Redactor {
    rules: Vec<CompiledRule>,
}

impl Redactor {
    pub fn new(rules: &[RedactionRule]) -> Result<Self, regex::Error> {
        let rules = rules
            .iter()
            .map(|rule| {
                Ok(CompiledRule {
                    kind: rule.kind.clone(),
                    placeholder: format!("[{}]", rule.kind.to_uppercase()),
                    regex: Regex::new(&rule.pattern)?,
                })
            })
            .collect::<Result<Vec<_>, regex::Error>>()?;
        Ok(Self { rules })
    }

    pub fn builtin() -> Result<Self, regex::Error> {
        Self::new(&RedactionRule::builtin())
    }

    /// Configured rules, or the built-in set when none are configured.
    pub fn from_config(rules: &[RedactionRule]) -> Result<Self, regex::Error> {
        if rules.is_empty() {
            Self::builtin()
        } else {
            Self::new(rules)
        }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Redact `text`, adding per-kind match counts to `counts`.
    pub fn redact_into(&self, text: &str, counts: &mut BTreeMap<String, usize>) -> String {
        let mut out = text.to_string();
        for rule in &self.rules {
            let hits = rule.regex.find_iter(&out).count();
            if hits == 0 {
                continue;
            }
            *counts.entry(rule.kind.clone()).or_default() += hits;
            out = rule
                .regex
                .replace_all(&out, rule.placeholder.as_str())
                .into_owned();
        }
        out
    }

    pub fn redact_text(&self, text: &str) -> (String, BTreeMap<String, usize>) {
        let mut counts = BTreeMap::new();
        let out = self.redact_into(text, &mut counts);
        (out, counts)
    }
}

/// Redacts the title and every message body of the record in place.
#[derive(Debug, Clone)]
pub struct RedactStage {
    redactor: Redactor,
}

impl RedactStage {
    pub fn new(redactor: Redactor) -> Self {
        Self { redactor }
    }
}

#[async_trait]
impl Stage for RedactStage {
    fn kind(&self) -> StageKind {
        StageKind::Redact
    }

    async fn transform(&self, mut input: StageData) -> Result<StageData, StageError> {
        let mut counts = std::mem::take(&mut input.redactions);
        input.record.title = self.redactor.redact_into(&input.record.title, &mut counts);
        for message in &mut input.record.messages {
            message.content = self.redactor.redact_into(&message.content, &mut counts);
        }
        if !counts.is_empty() {
            tracing::debug!(
                hash = %input.hash.short(),
                total = counts.values().sum::<usize>(),
                "redacted pii"
            );
        }
        input.redactions = counts;
        Ok(input)
    }
}
