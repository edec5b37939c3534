//! Issue rules evaluated by the quality gate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{IssueSeverity, QualityIssue};
use crate::core::{QualityContext, StageName, StageOutput};

/// Bounds on one stage measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityRule {
    /// Stage whose output is measured.
    pub stage: StageName,
    /// Measurement key, e.g. `wordCount`.
    pub metric: String,
    /// Inclusive lower bound.
    #[serde(default)]
    pub min: Option<f64>,
    /// Inclusive upper bound.
    #[serde(default)]
    pub max: Option<f64>,
    /// Severity of a violation.
    pub severity: IssueSeverity,
}

impl QualityRule {
    /// Creates a rule with no bounds.
    #[must_use]
    pub fn new(stage: StageName, metric: impl Into<String>, severity: IssueSeverity) -> Self {
        Self {
            stage,
            metric: metric.into(),
            min: None,
            max: None,
            severity,
        }
    }

    /// Sets the lower bound.
    #[must_use]
    pub fn with_min(mut self, min: f64) -> Self {
        self.min = Some(min);
        self
    }

    /// Sets the upper bound.
    #[must_use]
    pub fn with_max(mut self, max: f64) -> Self {
        self.max = Some(max);
        self
    }

    fn check(&self, value: f64) -> Option<QualityIssue> {
        let (code, message) = match (self.min, self.max) {
            (Some(min), _) if value < min => (
                "METRIC_BELOW_MIN",
                format!("{} {} {value} below minimum {min}", self.stage, self.metric),
            ),
            (_, Some(max)) if value > max => (
                "METRIC_ABOVE_MAX",
                format!("{} {} {value} above maximum {max}", self.stage, self.metric),
            ),
            _ => return None,
        };
        Some(QualityIssue {
            severity: self.severity,
            stage: Some(self.stage.as_str().to_string()),
            code: code.to_string(),
            message,
        })
    }
}

/// Quality gate configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QualityGateConfig {
    /// Measurement rules.
    #[serde(default = "default_rules")]
    pub rules: Vec<QualityRule>,
    /// Stages whose fallback usage is a major issue.
    #[serde(default)]
    pub major_fallback_stages: Vec<StageName>,
    /// Stages whose degradation is a major issue.
    #[serde(default = "default_major_degraded_stages")]
    pub major_degraded_stages: Vec<StageName>,
    /// Stage the pipeline halts before on `HUMAN_REVIEW`.
    #[serde(default = "default_pause_before_stage")]
    pub pause_before_stage: StageName,
}

fn default_rules() -> Vec<QualityRule> {
    vec![
        QualityRule::new(StageName::ScriptGen, "wordCount", IssueSeverity::Minor)
            .with_min(1200.0)
            .with_max(1800.0),
        QualityRule::new(StageName::Tts, "silencePct", IssueSeverity::Major).with_max(5.0),
        QualityRule::new(StageName::VisualGen, "fallbackPct", IssueSeverity::Major).with_max(30.0),
        QualityRule::new(StageName::Render, "frameDrops", IssueSeverity::Major).with_max(0.0),
        QualityRule::new(StageName::Thumbnail, "variantsGenerated", IssueSeverity::Minor).with_min(3.0),
    ]
}

fn default_major_degraded_stages() -> Vec<StageName> {
    vec![StageName::ScriptGen, StageName::Tts, StageName::Render]
}

fn default_pause_before_stage() -> StageName {
    StageName::Youtube
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
            major_fallback_stages: Vec::new(),
            major_degraded_stages: default_major_degraded_stages(),
            pause_before_stage: default_pause_before_stage(),
        }
    }
}

impl QualityGateConfig {
    /// Replaces the measurement rules.
    #[must_use]
    pub fn with_rules(mut self, rules: Vec<QualityRule>) -> Self {
        self.rules = rules;
        self
    }

    /// Sets the stages whose fallback usage is major.
    #[must_use]
    pub fn with_major_fallback_stages(mut self, stages: Vec<StageName>) -> Self {
        self.major_fallback_stages = stages;
        self
    }

    /// Sets the stages whose degradation is major.
    #[must_use]
    pub fn with_major_degraded_stages(mut self, stages: Vec<StageName>) -> Self {
        self.major_degraded_stages = stages;
        self
    }
}

fn entry_stage(entry: &str) -> Option<StageName> {
    entry.split_once(':').and_then(|(stage, _)| stage.parse().ok())
}

/// Computes the issues for a set of stage outputs and a quality context.
#[must_use]
pub fn evaluate_issues(
    config: &QualityGateConfig,
    stage_outputs: &BTreeMap<StageName, StageOutput>,
    quality_context: &QualityContext,
) -> Vec<QualityIssue> {
    let mut issues = Vec::new();

    for rule in &config.rules {
        let value = stage_outputs
            .get(&rule.stage)
            .and_then(|output| output.quality.as_ref())
            .and_then(|quality| quality.get(&rule.metric));
        if let Some(issue) = value.and_then(|v| rule.check(v)) {
            issues.push(issue);
        }
    }

    for entry in &quality_context.fallbacks_used {
        let stage = entry_stage(entry);
        let message = format!("Fallback provider used: {entry}");
        let stage_label = stage.map(|s| s.as_str().to_string());
        if stage.is_some_and(|s| config.major_fallback_stages.contains(&s)) {
            issues.push(QualityIssue::major(stage_label, "FALLBACK_USED", message));
        } else {
            issues.push(QualityIssue::minor(stage_label, "FALLBACK_USED", message));
        }
    }

    for degraded in &quality_context.degraded_stages {
        let stage = degraded.parse::<StageName>().ok();
        let message = format!("Stage {degraded} completed in degraded mode");
        if stage.is_some_and(|s| config.major_degraded_stages.contains(&s)) {
            issues.push(QualityIssue::major(Some(degraded.clone()), "STAGE_DEGRADED", message));
        } else {
            issues.push(QualityIssue::minor(Some(degraded.clone()), "STAGE_DEGRADED", message));
        }
    }

    for flag in &quality_context.flags {
        let stage = entry_stage(flag).map(|s| s.as_str().to_string());
        issues.push(QualityIssue::minor(stage, "FLAGGED", format!("Flag raised: {flag}")));
    }

    issues
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::QualityMetrics;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn output(stage: StageName, key: &str, value: f64) -> StageOutput {
        StageOutput::ok(json!({}), "p").with_quality(QualityMetrics::new(stage.as_str()).with(key, value))
    }

    #[test]
    fn test_clean_run_has_no_issues() {
        let mut outputs = BTreeMap::new();
        outputs.insert(StageName::ScriptGen, output(StageName::ScriptGen, "wordCount", 1500.0));
        outputs.insert(StageName::Render, output(StageName::Render, "frameDrops", 0.0));
        let issues = evaluate_issues(&QualityGateConfig::default(), &outputs, &QualityContext::new());
        assert!(issues.is_empty());
    }

    #[test]
    fn test_metric_rules() {
        let mut outputs = BTreeMap::new();
        outputs.insert(StageName::ScriptGen, output(StageName::ScriptGen, "wordCount", 900.0));
        outputs.insert(StageName::Tts, output(StageName::Tts, "silencePct", 7.5));
        outputs.insert(StageName::Thumbnail, output(StageName::Thumbnail, "variantsGenerated", 3.0));

        let issues = evaluate_issues(&QualityGateConfig::default(), &outputs, &QualityContext::new());
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].code, "METRIC_BELOW_MIN");
        assert_eq!(issues[0].severity, IssueSeverity::Minor);
        assert_eq!(issues[1].code, "METRIC_ABOVE_MAX");
        assert_eq!(issues[1].severity, IssueSeverity::Major);
        assert_eq!(issues[1].stage.as_deref(), Some("tts"));
    }

    #[test]
    fn test_context_rules() {
        let mut ctx = QualityContext::new();
        ctx.record_fallback(StageName::Tts, "chirp3-hd");
        ctx.record_degraded(StageName::VisualGen);
        ctx.record_degraded(StageName::Render);
        ctx.add_flag("script-gen:long intro");

        let issues = evaluate_issues(&QualityGateConfig::default(), &BTreeMap::new(), &ctx);
        let severities: Vec<_> = issues.iter().map(|i| (i.code.as_str(), i.severity)).collect();
        assert_eq!(
            severities,
            vec![
                ("FALLBACK_USED", IssueSeverity::Minor),
                ("STAGE_DEGRADED", IssueSeverity::Minor),
                ("STAGE_DEGRADED", IssueSeverity::Major),
                ("FLAGGED", IssueSeverity::Minor),
            ]
        );
    }

    #[test]
    fn test_major_fallback_stages() {
        let mut ctx = QualityContext::new();
        ctx.record_fallback(StageName::Tts, "chirp3-hd");
        let config = QualityGateConfig::default().with_major_fallback_stages(vec![StageName::Tts]);
        let issues = evaluate_issues(&config, &BTreeMap::new(), &ctx);
        assert!(issues[0].is_major());
    }

    #[test]
    fn test_config_defaults_from_empty_json() {
        let config: QualityGateConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, QualityGateConfig::default());
        assert_eq!(config.rules.len(), 5);
        assert_eq!(config.pause_before_stage, StageName::Youtube);
    }
}
