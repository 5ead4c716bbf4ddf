//! Subject validation and wildcard matching.
//!
//! Subjects are dot-delimited tokens. In subscription patterns `*` matches exactly one token and
//! `>` matches one or more trailing tokens and may only appear last.

use crate::error::{NatsError, Result};

fn has_whitespace(s: &str) -> bool {
    s.bytes().any(|b| b.is_ascii_whitespace())
}

/// Validates a publish subject: no wildcards allowed.
pub fn validate_subject(subject: &str) -> Result<()> {
    validate_tokens(subject, false)
}

/// Validates a subscription pattern.
pub fn validate_pattern(pattern: &str) -> Result<()> {
    validate_tokens(pattern, true)
}

/// Validates a queue-group name: non-empty and free of whitespace.
pub fn validate_queue(queue: &str) -> Result<()> {
    if queue.is_empty() || has_whitespace(queue) {
        return Err(NatsError::InvalidSubject(queue.to_string()));
    }
    Ok(())
}

fn validate_tokens(subject: &str, allow_wildcards: bool) -> Result<()> {
    let invalid = || NatsError::InvalidSubject(subject.to_string());
    if subject.is_empty() || has_whitespace(subject) {
        return Err(invalid());
    }
    let mut tokens = subject.split('.').peekable();
    while let Some(token) = tokens.next() {
        if token.is_empty() {
            return Err(invalid());
        }
        let wildcard = token == "*" || token == ">";
        if wildcard && !allow_wildcards {
            return Err(invalid());
        }
        if token == ">" && tokens.peek().is_some() {
            return Err(invalid());
        }
    }
    Ok(())
}

/// Returns true when `subject` is matched by `pattern`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pat = pattern.split('.');
    let mut sub = subject.split('.');
    loop {
        match (pat.next(), sub.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}
