//! Scans failed log entries, attaches preceding context, and maps error
//! substrings to canned remediation suggestions. Repeated patterns escalate
//! to a "try a different approach" recommendation.

use super::{Entry, Logger, QueryFilter};
use std::collections::HashMap;

const REPEAT_THRESHOLD: usize = 3;

#[derive(Debug, Clone)]
pub struct FailureAnalysis {
    pub entry: Entry,
    pub context: Vec<Entry>,
    pub suggestions: Vec<String>,
    pub pattern_count: usize,
}

pub struct FailureAnalyzer {
    context_size: usize,
}

impl FailureAnalyzer {
    pub fn new(context_size: usize) -> Self {
        Self { context_size }
    }

    /// Scans `logger`'s full retained history for failures, attaching up to
    /// `context_size` previous entries to each and classifying the failure
    /// message against known substrings.
    pub fn analyze(&self, logger: &Logger) -> Vec<FailureAnalysis> {
        let all = logger.query(QueryFilter::default());
        let failures = logger.query(QueryFilter { failures_only: true, ..Default::default() });

        let mut pattern_counts: HashMap<&'static str, usize> = HashMap::new();
        for f in &failures {
            let pattern = classify_pattern(&f.message);
            *pattern_counts.entry(pattern).or_insert(0) += 1;
        }

        failures
            .into_iter()
            .map(|failure| {
                let idx = all.iter().position(|e| same_entry(e, &failure)).unwrap_or(0);
                let start = idx.saturating_sub(self.context_size);
                let context = all[start..idx].to_vec();
                let pattern = classify_pattern(&failure.message);
                let count = *pattern_counts.get(pattern).unwrap_or(&0);
                let mut suggestions = suggestions_for(pattern);
                if count >= REPEAT_THRESHOLD {
                    suggestions.push("this approach has failed repeatedly; try a different approach".to_string());
                }
                FailureAnalysis { entry: failure, context, suggestions, pattern_count: count }
            })
            .collect()
    }
}

fn same_entry(a: &Entry, b: &Entry) -> bool {
    a.timestamp_ms == b.timestamp_ms && a.entry_type == b.entry_type && a.message == b.message
}

fn classify_pattern(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        "timeout"
    } else if lower.contains("dns") || lower.contains("name resolution") {
        "dns"
    } else if lower.contains("ssl") || lower.contains("tls") || lower.contains("certificate") {
        "ssl"
    } else if lower.contains("permission denied") || lower.contains("eacces") {
        "permission"
    } else if lower.contains("no space left") || lower.contains("disk full") {
        "disk"
    } else if lower.contains("no such file") || lower.contains("not found") {
        "not_found"
    } else {
        "unknown"
    }
}

fn suggestions_for(pattern: &str) -> Vec<String> {
    match pattern {
        "timeout" => vec!["retry with a longer timeout".to_string()],
        "dns" => vec!["check network connectivity and DNS configuration".to_string()],
        "ssl" => vec!["verify certificates or try an alternate mirror".to_string()],
        "permission" => vec!["check file/directory permissions".to_string()],
        "disk" => vec!["free disk space before retrying".to_string()],
        "not_found" => vec!["verify the path exists before accessing it".to_string()],
        _ => vec!["inspect the tool's stderr for details".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::{Level, Logger};

    #[test]
    fn attaches_context_and_classifies_timeout() {
        let logger = Logger::new(100, Level::Full);
        logger.log(crate::logger::Entry::new(Level::Tool, "bash", "starting", true));
        logger.log(crate::logger::Entry::new(Level::Tool, "bash", "connection timed out", false));

        let analyzer = FailureAnalyzer::new(5);
        let analyses = analyzer.analyze(&logger);
        assert_eq!(analyses.len(), 1);
        assert_eq!(analyses[0].context.len(), 1);
        assert!(analyses[0].suggestions.iter().any(|s| s.contains("timeout")));
    }

    #[test]
    fn repeated_pattern_triggers_try_different_approach() {
        let logger = Logger::new(100, Level::Full);
        for _ in 0..3 {
            logger.log(crate::logger::Entry::new(Level::Tool, "bash", "permission denied", false));
        }
        let analyzer = FailureAnalyzer::new(2);
        let analyses = analyzer.analyze(&logger);
        assert!(analyses
            .iter()
            .all(|a| a.suggestions.iter().any(|s| s.contains("try a different approach"))));
    }
}
