//! Plan-approval trigger detection.
//!
//! The loop asks a [`PlanDetector`] whether the text accumulated so far in a
//! turn announces a plan awaiting approval. Detection never truncates the
//! stream; the turn drains to its natural end first.

/// Decides when a turn's text is a plan that needs human approval.
pub trait PlanDetector: Send + Sync {
    /// `text` is everything streamed so far in the current turn.
    fn detect(&self, text: &str) -> bool;

    /// The plan as shown to the approver.
    fn extract_plan(&self, text: &str) -> String {
        text.trim().to_string()
    }
}

/// Triggers on a fixed marker string, e.g. `[PLAN_READY]`.
#[derive(Debug, Clone)]
pub struct SentinelDetector {
    marker: String,
}

impl SentinelDetector {
    pub fn new(marker: impl Into<String>) -> Self {
        Self { marker: marker.into() }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }
}

impl Default for SentinelDetector {
    fn default() -> Self {
        Self::new("[PLAN_READY]")
    }
}

impl PlanDetector for SentinelDetector {
    fn detect(&self, text: &str) -> bool {
        !self.marker.is_empty() && text.contains(&self.marker)
    }

    /// The marker itself is stripped from the plan.
    fn extract_plan(&self, text: &str) -> String {
        text.replace(&self.marker, "").trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_marker_split_across_deltas() {
        let detector = SentinelDetector::default();
        let mut text = String::from("1. Search\n2. Summarise\n[PLAN_");
        assert!(!detector.detect(&text));
        text.push_str("READY]");
        assert!(detector.detect(&text));
        assert_eq!(detector.extract_plan(&text), "1. Search\n2. Summarise");
    }

    #[test]
    fn empty_marker_never_triggers() {
        assert!(!SentinelDetector::new("").detect("anything"));
    }
}
