// =============================================================================
// Checklist synthesizer — collapses a round's messages into executable items
// =============================================================================
//
// Runs once, after the final round. Proposal lines follow the grammar the
// oracle emits ("BUY ENRG amount=200.00 alloc=25.0%"); anything unparseable
// is treated as commentary and skipped. Final-round proposals are
// consolidated by (action, symbol): amounts sum, confidences average,
// allocations sum (capped at 100). Earlier-round insights are appended to
// the consolidated reasoning with a visible `[round N]` marker.
//
// Output items always satisfy: symbol is allowed, amount <= available
// balance for BUY (a running budget across items), amount > 0 unless HOLD.
// =============================================================================

use tracing::{debug, warn};

use crate::model::discussion::CONSENSUS_SOURCE;
use crate::model::{ChecklistItem, Discussion, Message, Sector};
use crate::types::ActionType;

/// A proposal line decoded into its executable parts.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedProposal {
    pub action: ActionType,
    pub symbol: String,
    pub amount: f64,
    pub allocation_percent: f64,
}

/// Parse a proposal line. Returns `None` for commentary/observations.
pub fn parse_proposal(text: &str) -> Option<ParsedProposal> {
    let mut tokens = text.split_whitespace();
    let action = ActionType::parse(tokens.next()?)?;
    let symbol = tokens.next()?.to_uppercase();
    if symbol.contains('=') {
        return None;
    }

    let mut amount = None;
    let mut allocation = None;
    for token in tokens {
        if let Some(v) = token.strip_prefix("amount=") {
            amount = v.parse::<f64>().ok();
        } else if let Some(v) = token.strip_prefix("alloc=") {
            allocation = v.trim_end_matches('%').parse::<f64>().ok();
        }
    }

    let amount = amount?;
    if amount < 0.0 || !amount.is_finite() {
        return None;
    }
    Some(ParsedProposal {
        action,
        symbol,
        amount,
        allocation_percent: allocation.unwrap_or(0.0).clamp(0.0, 100.0),
    })
}

struct ProposalGroup {
    action: ActionType,
    symbol: String,
    amount: f64,
    allocation_percent: f64,
    confidences: Vec<f64>,
    agent_ids: Vec<String>,
    reasonings: Vec<String>,
}

/// Synthesize the checklist for a discussion's final round.
pub fn synthesize(discussion: &Discussion, sector: &Sector) -> Vec<ChecklistItem> {
    let final_round = discussion.current_round;
    let mut groups: Vec<ProposalGroup> = Vec::new();

    for message in discussion
        .messages
        .iter()
        .filter(|m| m.round == final_round && !m.observation)
    {
        let Some(parsed) = parse_proposal(&message.proposal) else {
            debug!(message = %message.id, "unparseable proposal skipped");
            continue;
        };

        match groups
            .iter_mut()
            .find(|g| g.action == parsed.action && g.symbol == parsed.symbol)
        {
            Some(group) => {
                group.amount += parsed.amount;
                group.allocation_percent =
                    (group.allocation_percent + parsed.allocation_percent).min(100.0);
                group.confidences.push(message.confidence * 100.0);
                group.agent_ids.push(message.agent_id.clone());
                group.reasonings.push(message.reasoning.clone());
            }
            None => groups.push(ProposalGroup {
                action: parsed.action,
                symbol: parsed.symbol,
                amount: parsed.amount,
                allocation_percent: parsed.allocation_percent,
                confidences: vec![message.confidence * 100.0],
                agent_ids: vec![message.agent_id.clone()],
                reasonings: vec![message.reasoning.clone()],
            }),
        }
    }

    // Earlier-round insights ride along on every item, marked by round.
    let insights: Vec<String> = discussion
        .messages
        .iter()
        .filter(|m| m.round < final_round && !m.observation && !m.reasoning.is_empty())
        .map(|m| format!("[round {}] {}", m.round, m.reasoning))
        .collect();

    let mut remaining_balance = sector.balance;
    let mut items = Vec::new();

    for group in groups {
        if !sector.allows_symbol(&group.symbol) {
            warn!(symbol = %group.symbol, sector = %sector.id, "proposal dropped: symbol not allowed");
            continue;
        }

        let mut amount = group.amount;
        if group.action == ActionType::Buy {
            if remaining_balance <= 0.0 {
                warn!(symbol = %group.symbol, "buy dropped: no balance left");
                continue;
            }
            amount = amount.min(remaining_balance);
            remaining_balance -= amount;
        }
        if group.action == ActionType::Hold {
            amount = 0.0;
        } else if amount <= 0.0 {
            debug!(symbol = %group.symbol, action = %group.action, "zero-amount proposal dropped");
            continue;
        }

        let confidence =
            group.confidences.iter().sum::<f64>() / group.confidences.len().max(1) as f64;
        let source = if group.agent_ids.len() == 1 {
            group.agent_ids[0].clone()
        } else {
            CONSENSUS_SOURCE.to_string()
        };

        let mut reasoning = group.reasonings.join(" | ");
        for insight in &insights {
            reasoning.push_str("\n");
            reasoning.push_str(insight);
        }
        if reasoning.is_empty() {
            reasoning = format!("{} {} consolidated from round {final_round}", group.action, group.symbol);
        }

        items.push(ChecklistItem::new(
            source,
            final_round,
            group.action,
            group.symbol,
            amount,
            group.allocation_percent,
            confidence,
            reasoning,
        ));
    }

    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::format_proposal_line;
    use crate::types::SystemMode;

    fn sector(balance: f64) -> Sector {
        Sector::new(
            "Energy",
            "ENRG",
            balance,
            100.0,
            0.02,
            40,
            0.0,
            vec!["ENRG".into(), "SOLR".into()],
            SystemMode::Simulation,
        )
    }

    fn discussion_with(messages: Vec<Message>, round: u32) -> Discussion {
        let mut d = Discussion::new("s1", vec!["a1".into(), "a2".into()], 2);
        d.current_round = round;
        d.messages = messages;
        d
    }

    #[test]
    fn parser_inverts_the_oracle_format() {
        let line = format_proposal_line(ActionType::Buy, "enrg", 200.0, 25.0);
        let parsed = parse_proposal(&line).unwrap();
        assert_eq!(parsed.action, ActionType::Buy);
        assert_eq!(parsed.symbol, "ENRG");
        assert!((parsed.amount - 200.0).abs() < 1e-9);
        assert!((parsed.allocation_percent - 25.0).abs() < 1e-9);
    }

    #[test]
    fn parser_rejects_commentary() {
        assert!(parse_proposal("observing ENRG").is_none());
        assert!(parse_proposal("").is_none());
        assert!(parse_proposal("BUY amount=5").is_none());
        assert!(parse_proposal("SHORT ENRG amount=5.0 alloc=1%").is_none());
    }

    #[test]
    fn same_action_proposals_consolidate() {
        let d = discussion_with(
            vec![
                Message::new("a1", 2, "momentum", "BUY ENRG amount=200.00 alloc=20.0%", 0.8, false),
                Message::new("a2", 2, "breakout", "BUY ENRG amount=100.00 alloc=10.0%", 0.6, false),
            ],
            2,
        );
        let items = synthesize(&d, &sector(1000.0));
        assert_eq!(items.len(), 1);
        let item = &items[0];
        assert_eq!(item.action_type, ActionType::Buy);
        assert!((item.amount - 300.0).abs() < 1e-9);
        assert!((item.confidence - 70.0).abs() < 1e-9);
        assert!((item.allocation_percent - 30.0).abs() < 1e-9);
        assert_eq!(item.source_agent_id, CONSENSUS_SOURCE);
        assert!(item.reasoning.contains("momentum"));
        assert!(item.reasoning.contains("breakout"));
    }

    #[test]
    fn single_contributor_keeps_its_agent_id() {
        let d = discussion_with(
            vec![Message::new("a1", 2, "solo", "SELL ENRG amount=50.00 alloc=5.0%", 0.7, false)],
            2,
        );
        let mut s = sector(1000.0);
        s.apply_buy("ENRG", 100.0).unwrap();
        let items = synthesize(&d, &s);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].source_agent_id, "a1");
    }

    #[test]
    fn observations_and_disallowed_symbols_are_skipped() {
        let d = discussion_with(
            vec![
                Message::new("a1", 2, "watching", "observing ENRG", 0.4, true),
                Message::new("a2", 2, "oil play", "BUY OILX amount=100.00 alloc=10.0%", 0.9, false),
            ],
            2,
        );
        let items = synthesize(&d, &sector(1000.0));
        assert!(items.is_empty());
    }

    #[test]
    fn buy_amounts_are_clamped_to_available_balance() {
        let d = discussion_with(
            vec![
                Message::new("a1", 2, "big", "BUY ENRG amount=800.00 alloc=40.0%", 0.8, false),
                Message::new("a2", 2, "also", "BUY SOLR amount=500.00 alloc=30.0%", 0.7, false),
            ],
            2,
        );
        let items = synthesize(&d, &sector(1000.0));
        assert_eq!(items.len(), 2);
        assert!((items[0].amount - 800.0).abs() < 1e-9);
        // Second buy only gets what is left of the budget.
        assert!((items[1].amount - 200.0).abs() < 1e-9);
    }

    #[test]
    fn hold_items_carry_zero_amount() {
        let d = discussion_with(
            vec![Message::new("a1", 1, "flat", "HOLD ENRG amount=0.00 alloc=10.0%", 0.7, false)],
            1,
        );
        let items = synthesize(&d, &sector(1000.0));
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].action_type, ActionType::Hold);
        assert_eq!(items[0].amount, 0.0);
    }

    #[test]
    fn earlier_round_insights_carry_a_marker() {
        let d = discussion_with(
            vec![
                Message::new("a1", 1, "early read on supply", "BUY ENRG amount=100.00 alloc=10.0%", 0.7, false),
                Message::new("a1", 2, "confirmed", "BUY ENRG amount=150.00 alloc=15.0%", 0.8, false),
            ],
            2,
        );
        let items = synthesize(&d, &sector(1000.0));
        assert_eq!(items.len(), 1);
        assert!((items[0].amount - 150.0).abs() < 1e-9);
        assert!(items[0].reasoning.contains("[round 1] early read on supply"));
    }

    #[test]
    fn empty_final_round_synthesizes_nothing() {
        let d = discussion_with(vec![], 2);
        assert!(synthesize(&d, &sector(1000.0)).is_empty());
    }
}
