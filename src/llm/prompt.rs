// Prompt construction for trade and insight analyses

use crate::models::{compute_pnl, compute_status, Subject, SubjectContext, Trade, TradeStatus};
use crate::queue::jobs::JobKind;
use crate::types::LLMMessage;

const SYSTEM_PROMPT: &str = r#"You are a trading coach reviewing a trader's journal.
Respond with a single JSON object and nothing else, using these fields:
{
  "summary": string,
  "score": integer 0-100,
  "confidence": integer 0-100,
  "strengths": [string],
  "weaknesses": [string],
  "recommendations": [string],
  "riskAssessment": { "level": "low" | "medium" | "high", "factors": [string] },
  "psychologyInsights": { "emotionalState": string, "biases": [string], "suggestions": [string] }
}"#;

/// Most recent trades included in an insight prompt.
const MAX_INSIGHT_TRADES: usize = 100;

pub fn build_messages(subject: &Subject) -> Vec<LLMMessage> {
    let body = match &subject.context {
        SubjectContext::Trade(trade) => format!("Analyze this trade.\n\n{}", describe_trade(trade)),
        SubjectContext::Owner { trades } => {
            let scope = match subject.key.kind {
                JobKind::WeeklyInsight => "the past week",
                _ => "their full history",
            };
            let mut body = format!(
                "Give an overall assessment of this trader's behaviour over {} ({} trades).\n",
                scope,
                trades.len()
            );
            let skip = trades.len().saturating_sub(MAX_INSIGHT_TRADES);
            for trade in trades.iter().skip(skip) {
                body.push('\n');
                body.push_str(&describe_trade(trade));
            }
            body
        }
    };

    vec![LLMMessage::system(SYSTEM_PROMPT), LLMMessage::user(body)]
}

fn describe_trade(trade: &Trade) -> String {
    let side = match trade.side {
        crate::models::TradeSide::Long => "long",
        crate::models::TradeSide::Short => "short",
    };
    let mut line = format!(
        "- {} {} x{} @ {} opened {}",
        trade.symbol,
        side,
        trade.quantity,
        trade.entry_price,
        trade.created_at.format("%Y-%m-%d %H:%M")
    );

    match compute_status(trade) {
        TradeStatus::Open => line.push_str(", still open"),
        TradeStatus::Closed => {
            if let Some(exit) = trade.exit_price {
                line.push_str(&format!(", closed @ {}", exit));
            }
            if let Some(pnl) = compute_pnl(trade) {
                line.push_str(&format!(", net P&L {:.2} after {:.2} fees", pnl, trade.fees));
            }
        }
    }

    if let Some(notes) = trade.notes.as_deref().filter(|n| !n.trim().is_empty()) {
        line.push_str(&format!("\n  notes: {}", notes.trim()));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{SubjectKey, TradeSide};
    use chrono::Utc;

    fn trade(exit: Option<f64>) -> Trade {
        Trade {
            id: "t1".to_string(),
            owner_id: "u1".to_string(),
            symbol: "NQ".to_string(),
            side: TradeSide::Short,
            entry_price: 200.0,
            exit_price: exit,
            quantity: 2.0,
            fees: 1.5,
            notes: Some("chased the breakdown".to_string()),
            created_at: Utc::now(),
            closed_at: None,
        }
    }

    fn subject(kind: JobKind, context: SubjectContext) -> Subject {
        Subject {
            key: SubjectKey::new(kind, "x"),
            owner_id: "u1".to_string(),
            analysis_status: None,
            analysis_error: None,
            analysis_updated_at: None,
            analysis: None,
            context,
        }
    }

    #[test]
    fn test_trade_prompt_includes_pnl_and_notes() {
        let messages = build_messages(&subject(JobKind::TradeAnalysis, SubjectContext::Trade(trade(Some(190.0)))));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");
        assert!(messages[1].content.contains("net P&L 18.50"));
        assert!(messages[1].content.contains("chased the breakdown"));
    }

    #[test]
    fn test_weekly_prompt_mentions_scope() {
        let messages = build_messages(&subject(
            JobKind::WeeklyInsight,
            SubjectContext::Owner { trades: vec![trade(None)] },
        ));
        assert!(messages[1].content.contains("the past week (1 trades)"));
        assert!(messages[1].content.contains("still open"));
    }
}
