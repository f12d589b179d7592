// Turning provider text into an AnalysisRecord

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::models::{AnalysisRecord, PsychologyInsights, RiskAssessment};

pub const DEFAULT_SCORE: u8 = 50;
pub const DEGRADED_SUMMARY_CHARS: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("reply contains no JSON object")]
    NoJson,

    #[error("reply JSON does not match the analysis shape: {0}")]
    Json(#[from] serde_json::Error),

    #[error("reply has neither a summary nor a score")]
    Empty,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawAnalysis {
    summary: Option<String>,
    score: Option<f64>,
    confidence: Option<f64>,
    strengths: Vec<String>,
    weaknesses: Vec<String>,
    recommendations: Vec<String>,
    #[serde(alias = "risk_assessment")]
    risk_assessment: Option<RawRisk>,
    #[serde(alias = "psychology_insights")]
    psychology_insights: Option<RawPsychology>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawRisk {
    level: Option<String>,
    factors: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct RawPsychology {
    #[serde(alias = "emotional_state")]
    emotional_state: Option<String>,
    biases: Vec<String>,
    suggestions: Vec<String>,
}

/// Slice out the outermost JSON object, tolerating code fences and prose
/// around it.
fn extract_json(raw: &str) -> Option<&str> {
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| &raw[start..=end])
}

fn clamp_score(value: Option<f64>) -> u8 {
    value
        .filter(|v| v.is_finite())
        .map(|v| v.round().clamp(0.0, 100.0) as u8)
        .unwrap_or(DEFAULT_SCORE)
}

pub fn parse_reply(
    raw: &str,
    model: &str,
    version: &str,
    generated_at: DateTime<Utc>,
) -> Result<AnalysisRecord, ParseError> {
    let json = extract_json(raw).ok_or(ParseError::NoJson)?;
    let parsed: RawAnalysis = serde_json::from_str(json)?;

    let summary = parsed.summary.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());
    if summary.is_none() && parsed.score.is_none() {
        return Err(ParseError::Empty);
    }

    let risk = parsed.risk_assessment.unwrap_or_default();
    let psychology = parsed.psychology_insights.unwrap_or_default();

    Ok(AnalysisRecord {
        summary: summary.unwrap_or_default(),
        score: clamp_score(parsed.score),
        confidence: clamp_score(parsed.confidence),
        strengths: parsed.strengths,
        weaknesses: parsed.weaknesses,
        recommendations: parsed.recommendations,
        risk_assessment: RiskAssessment {
            level: risk.level.unwrap_or_else(|| "medium".to_string()),
            factors: risk.factors,
        },
        psychology_insights: PsychologyInsights {
            emotional_state: psychology.emotional_state.unwrap_or_default(),
            biases: psychology.biases,
            suggestions: psychology.suggestions,
        },
        generated_at,
        model: model.to_string(),
        version: version.to_string(),
        degraded: false,
        raw_response: Some(raw.to_string()),
    })
}

/// Fallback record for a reply that could not be parsed: neutral scores and
/// the raw text as the summary.
pub fn degraded_record(raw: &str, model: &str, version: &str, generated_at: DateTime<Utc>) -> AnalysisRecord {
    AnalysisRecord {
        summary: raw.trim().chars().take(DEGRADED_SUMMARY_CHARS).collect(),
        score: DEFAULT_SCORE,
        confidence: DEFAULT_SCORE,
        strengths: Vec::new(),
        weaknesses: Vec::new(),
        recommendations: Vec::new(),
        risk_assessment: RiskAssessment {
            level: "unknown".to_string(),
            factors: Vec::new(),
        },
        psychology_insights: PsychologyInsights::default(),
        generated_at,
        model: model.to_string(),
        version: version.to_string(),
        degraded: true,
        raw_response: Some(raw.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_fenced_camel_case_reply() {
        let raw = r#"Here you go:
```json
{"summary":"Disciplined exit","score":80,"confidence":65,"strengths":["patience"],
 "riskAssessment":{"level":"low","factors":["small size"]},
 "psychologyInsights":{"emotionalState":"calm","biases":[],"suggestions":["journal more"]}}
```"#;
        let now = Utc::now();
        let record = parse_reply(raw, "gpt-4o-mini", "1", now).unwrap();

        assert_eq!(record.summary, "Disciplined exit");
        assert_eq!(record.score, 80);
        assert_eq!(record.confidence, 65);
        assert_eq!(record.strengths, vec!["patience"]);
        assert_eq!(record.risk_assessment.level, "low");
        assert_eq!(record.psychology_insights.emotional_state, "calm");
        assert!(!record.degraded);
        assert_eq!(record.raw_response.as_deref(), Some(raw));
    }

    #[test]
    fn test_accepts_snake_case_and_clamps_scores() {
        let raw = r#"{"summary":"Overtraded","score":140,"confidence":-3,"risk_assessment":{"level":"high"}}"#;
        let record = parse_reply(raw, "m", "1", Utc::now()).unwrap();

        assert_eq!(record.score, 100);
        assert_eq!(record.confidence, 0);
        assert_eq!(record.risk_assessment.level, "high");
    }

    #[test]
    fn test_missing_confidence_defaults_to_fifty() {
        let record = parse_reply(r#"{"score":72.6}"#, "m", "1", Utc::now()).unwrap();
        assert_eq!(record.score, 73);
        assert_eq!(record.confidence, 50);
        assert_eq!(record.summary, "");
    }

    #[test]
    fn test_rejects_non_json_and_empty_objects() {
        assert!(matches!(parse_reply("no json here", "m", "1", Utc::now()), Err(ParseError::NoJson)));
        assert!(matches!(parse_reply("{}", "m", "1", Utc::now()), Err(ParseError::Empty)));
        assert!(matches!(parse_reply(r#"{"score":"high"}"#, "m", "1", Utc::now()), Err(ParseError::Json(_))));
    }

    #[test]
    fn test_degraded_record_truncates_summary() {
        let raw = "x".repeat(1200);
        let record = degraded_record(&raw, "m", "1", Utc::now());

        assert_eq!(record.score, 50);
        assert_eq!(record.confidence, 50);
        assert_eq!(record.summary.chars().count(), 500);
        assert!(record.degraded);
        assert_eq!(record.raw_response.map(|r| r.len()), Some(1200));
    }
}
