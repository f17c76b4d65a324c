use std::sync::Arc;

use serde_json::Value;
use tracing::debug;

use refinery_core::config::{PolicyConfig, PolicyKind};
use refinery_core::types::StageValue;

/// Decides, from the evaluate stage's output, whether another refinement
/// pass is needed. Must be pure: the same evaluation always yields the same
/// answer.
pub trait RefinementPolicy: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn should_refine(&self, evaluation: &StageValue) -> bool;
}

/// Build the configured policy.
pub fn from_config(config: &PolicyConfig) -> Arc<dyn RefinementPolicy> {
    let markers = MarkerPolicy::new(config.markers.clone());
    match config.kind {
        PolicyKind::Marker => Arc::new(markers),
        PolicyKind::Structured => Arc::new(StructuredPolicy::new(markers)),
    }
}

/// Case-insensitive substring match on the rendered evaluation.
///
/// This is the naive baseline: "no issues found" matches the
/// `issues found` marker. `StructuredPolicy` reads markers with
/// `affirms` instead.
#[derive(Debug, Clone)]
pub struct MarkerPolicy {
    markers: Vec<String>,
}

impl MarkerPolicy {
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers: markers.into_iter().map(|m| m.to_lowercase()).collect(),
        }
    }
}

impl Default for MarkerPolicy {
    fn default() -> Self {
        Self::new(PolicyConfig::default().markers)
    }
}

impl RefinementPolicy for MarkerPolicy {
    fn name(&self) -> &str {
        "marker"
    }

    fn should_refine(&self, evaluation: &StageValue) -> bool {
        let text = render(evaluation);
        self.markers.iter().any(|m| text.contains(m.as_str()))
    }
}

impl MarkerPolicy {
    /// Whether some marker appears as whole words and is not negated by
    /// the word before it ("no issues found", "0 issues found").
    pub fn affirms(&self, evaluation: &StageValue) -> bool {
        let text = render(evaluation);
        self.markers.iter().any(|m| affirmed(&text, m))
    }
}

/// Words that cancel a marker when they directly precede it.
const NEGATIONS: &[&str] = &["no", "0", "zero", "not", "never", "without", "none"];

fn render(evaluation: &StageValue) -> String {
    match evaluation {
        Value::String(s) => s.to_lowercase(),
        other => other.to_string().to_lowercase(),
    }
}

fn affirmed(text: &str, marker: &str) -> bool {
    if marker.is_empty() {
        return false;
    }
    text.match_indices(marker).any(|(idx, _)| {
        let before = &text[..idx];
        let after = &text[idx + marker.len()..];
        let whole_words = !before.chars().next_back().is_some_and(char::is_alphanumeric)
            && !after.chars().next().is_some_and(char::is_alphanumeric);
        let negated = before
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .next_back()
            .is_some_and(|w| NEGATIONS.contains(&w));
        whole_words && !negated
    })
}

/// Reads a verdict out of a structured evaluation record.
///
/// Text evaluations are parsed as JSON when they contain a record (bare or
/// fenced); anything else falls back to negation-aware marker matching.
#[derive(Debug, Clone, Default)]
pub struct StructuredPolicy {
    fallback: MarkerPolicy,
}

impl StructuredPolicy {
    pub fn new(fallback: MarkerPolicy) -> Self {
        Self { fallback }
    }

    fn verdict(record: &serde_json::Map<String, Value>) -> Option<bool> {
        let mut recognized = false;
        let mut refine = false;

        if let Some(v) = record.get("needs_refinement").and_then(Value::as_bool) {
            recognized = true;
            refine |= v;
        }
        for key in ["passed", "success"] {
            if let Some(v) = record.get(key).and_then(Value::as_bool) {
                recognized = true;
                refine |= !v;
            }
        }
        if let Some(v) = record.get("verdict").and_then(Value::as_str) {
            recognized = true;
            let v = v.trim().to_lowercase();
            refine |= v == "retry" || v == "refine";
        }
        if let Some(issues) = record.get("issues").and_then(Value::as_array) {
            recognized = true;
            refine |= !issues.is_empty();
        }

        recognized.then_some(refine)
    }
}

impl RefinementPolicy for StructuredPolicy {
    fn name(&self) -> &str {
        "structured"
    }

    fn should_refine(&self, evaluation: &StageValue) -> bool {
        let parsed;
        let record = match evaluation {
            Value::Object(map) => Some(map),
            Value::String(text) => {
                parsed = serde_json::from_str::<Value>(extract_json(text)).ok();
                parsed.as_ref().and_then(Value::as_object)
            }
            _ => None,
        };

        if let Some(verdict) = record.and_then(Self::verdict) {
            return verdict;
        }
        debug!("Evaluation is not structured, falling back to markers");
        self.fallback.affirms(evaluation)
    }
}

/// Extract JSON from text that may wrap it in markdown code fences.
///
/// Without fences, takes the span from the first `{` to the last `}`. Text
/// like `"} then {"` has no such span and is returned trimmed, so the
/// caller's parse fails and the evaluation counts as unstructured.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let after = &trimmed[start + 7..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            return &trimmed[start..=end];
        }
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_marker_case_insensitive() {
        let policy = MarkerPolicy::default();
        assert!(policy.should_refine(&json!("Verdict: NEEDS REFINEMENT")));
        assert!(policy.should_refine(&json!("3 issues found in parser")));
        assert!(!policy.should_refine(&json!("All tests pass")));
    }

    #[test]
    fn test_marker_baseline_ignores_negation() {
        assert!(MarkerPolicy::default().should_refine(&json!("no issues found")));
    }

    #[test]
    fn test_affirms_skips_negated_markers() {
        let policy = MarkerPolicy::default();
        assert!(!policy.affirms(&json!("All good, no issues found.")));
        assert!(!policy.affirms(&json!("0 issues found")));
        assert!(!policy.affirms(&json!("Does not needs refinement")));
        assert!(policy.affirms(&json!("3 issues found in parser")));
        assert!(policy.affirms(&json!("issues found")));
        assert!(policy.affirms(&json!("Lint: no warnings. Tests: issues found")));
    }

    #[test]
    fn test_affirms_needs_whole_words() {
        let policy = MarkerPolicy::new(vec!["fail".into()]);
        assert!(!policy.affirms(&json!("no failures, nothing failed")));
        assert!(policy.affirms(&json!("build: fail")));
    }

    #[test]
    fn test_marker_on_record() {
        let policy = MarkerPolicy::new(vec!["Flaky".into()]);
        assert!(policy.should_refine(&json!({"notes": "flaky test"})));
    }

    #[test]
    fn test_structured_fields() {
        let policy = StructuredPolicy::default();
        assert!(policy.should_refine(&json!({"needs_refinement": true})));
        assert!(!policy.should_refine(&json!({"needs_refinement": false})));
        assert!(policy.should_refine(&json!({"passed": false})));
        assert!(policy.should_refine(&json!({"success": false})));
        assert!(!policy.should_refine(&json!({"success": true})));
        assert!(policy.should_refine(&json!({"verdict": "Retry"})));
        assert!(policy.should_refine(&json!({"verdict": "refine"})));
        assert!(!policy.should_refine(&json!({"verdict": "accept"})));
        assert!(policy.should_refine(&json!({"issues": ["off by one"]})));
        assert!(!policy.should_refine(&json!({"issues": []})));
    }

    #[test]
    fn test_structured_avoids_marker_false_positive() {
        let policy = StructuredPolicy::default();
        let eval = json!({"passed": true, "summary": "no issues found"});
        assert!(!policy.should_refine(&eval));
    }

    #[test]
    fn test_structured_parses_text() {
        let policy = StructuredPolicy::default();
        let fenced = "Review done.\n```json\n{\"passed\": false}\n```";
        assert!(policy.should_refine(&json!(fenced)));
        assert!(!policy.should_refine(&json!(r#"{"passed": true}"#)));
    }

    #[test]
    fn test_structured_falls_back_to_markers() {
        let policy = StructuredPolicy::default();
        assert!(policy.should_refine(&json!("needs refinement: negative input")));
        assert!(!policy.should_refine(&json!("looks good")));
        assert!(!policy.should_refine(&json!({"score": 0.9})));
    }

    #[test]
    fn test_structured_reads_clean_text_report() {
        let policy = StructuredPolicy::default();
        assert!(!policy.should_refine(&json!("no issues found")));
        assert!(!policy.should_refine(&json!("All good, no issues found.")));
        assert!(policy.should_refine(&json!("issues found")));
    }

    #[test]
    fn test_from_config() {
        let mut config = PolicyConfig::default();
        assert_eq!(from_config(&config).name(), "structured");
        config.kind = PolicyKind::Marker;
        assert_eq!(from_config(&config).name(), "marker");
    }

    #[test]
    fn test_extract_json() {
        assert_eq!(extract_json(r#"x {"a": 1} y"#), r#"{"a": 1}"#);
        assert_eq!(extract_json("```\n{}\n```"), "{}");
        assert_eq!(extract_json("plain"), "plain");
        assert_eq!(extract_json(" } then { "), "} then {");
    }
}
