// =============================================================================
// Proposal oracle — the seam between deliberation and language-model I/O
// =============================================================================
//
// The core only ever sees `{reasoning, proposal, confidence}`. Two
// implementations:
//
//   - DeterministicOracle: pure function of its inputs; the default path and
//     the test double. Emits proposal lines the checklist synthesizer can
//     parse.
//   - HttpOracle: POSTs the deliberation context to an external endpoint
//     (selected via USE_LLM); any failure surfaces as OracleFailure and the
//     caller falls back.
//
// Contract: an agent below the confidence gate yields an observation-only
// message with confidence = agent.confidence / 100, and the core never
// creates a checklist item from it.
// =============================================================================

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::confidence::CONFIDENCE_GATE;
use crate::error::{CoreError, CoreResult};
use crate::market_data::MarketSnapshot;
use crate::model::{Agent, ChecklistItem, Message, Sector};
use crate::types::ActionType;

/// What an oracle returns for one agent in one round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub reasoning: String,
    pub proposal: String,
    /// In [0, 1].
    pub confidence: f64,
    /// Observation-only: never synthesized into a checklist item.
    #[serde(default)]
    pub observation: bool,
}

/// Previously rejected items handed back to the agent when revising.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RevisionContext {
    pub rejected: Vec<ChecklistItem>,
}

#[async_trait]
pub trait ProposalOracle: Send + Sync {
    async fn propose(
        &self,
        agent: &Agent,
        sector: &Sector,
        market: &MarketSnapshot,
        prior_messages: &[Message],
        revision: Option<&RevisionContext>,
    ) -> CoreResult<Proposal>;
}

// ---------------------------------------------------------------------------
// Deterministic oracle
// ---------------------------------------------------------------------------

/// Trend magnitude (percent) below which the oracle prefers to hold.
const TREND_DEADBAND_PCT: f64 = 0.5;

#[derive(Debug, Default)]
pub struct DeterministicOracle;

impl DeterministicOracle {
    /// Allocation percent for an agent: confidence scaled by risk appetite,
    /// kept inside [5, 40].
    fn allocation_percent(agent: &Agent) -> f64 {
        let appetite = 0.25 + agent.personality.risk_tolerance * 0.25;
        (agent.confidence * appetite).clamp(5.0, 40.0)
    }

    fn choose_action(agent: &Agent, sector: &Sector, market: &MarketSnapshot) -> ActionType {
        let held = sector
            .holdings
            .get(&sector.symbol)
            .copied()
            .unwrap_or(0.0);
        if market.trend_percent > TREND_DEADBAND_PCT {
            ActionType::Buy
        } else if market.trend_percent < -TREND_DEADBAND_PCT && held > 0.0 {
            ActionType::Sell
        } else if held > 0.0 && agent.personality.risk_tolerance < 0.3 {
            ActionType::Rebalance
        } else {
            ActionType::Hold
        }
    }
}

/// Render the parseable proposal line. The synthesizer's parser is the
/// inverse of this format.
pub fn format_proposal_line(
    action: ActionType,
    symbol: &str,
    amount: f64,
    allocation_percent: f64,
) -> String {
    format!(
        "{} {} amount={:.2} alloc={:.1}%",
        action.as_str(),
        symbol.to_uppercase(),
        amount,
        allocation_percent
    )
}

#[async_trait]
impl ProposalOracle for DeterministicOracle {
    async fn propose(
        &self,
        agent: &Agent,
        sector: &Sector,
        market: &MarketSnapshot,
        prior_messages: &[Message],
        revision: Option<&RevisionContext>,
    ) -> CoreResult<Proposal> {
        // Below the gate: observe only.
        if agent.confidence < CONFIDENCE_GATE {
            return Ok(Proposal {
                reasoning: format!(
                    "{} is watching {}: confidence {:.1} is below the action gate.",
                    agent.name, sector.symbol, agent.confidence
                ),
                proposal: format!("observing {}", sector.symbol),
                confidence: (agent.confidence / 100.0).clamp(0.0, 1.0),
                observation: true,
            });
        }

        let action = Self::choose_action(agent, sector, market);
        let allocation = Self::allocation_percent(agent);
        let amount = match action {
            ActionType::Buy => sector.balance * allocation / 100.0,
            ActionType::Sell => {
                let held = sector
                    .holdings
                    .get(&sector.symbol)
                    .copied()
                    .unwrap_or(0.0);
                held.min(sector.position) * allocation / 100.0
            }
            ActionType::Rebalance => sector.position * allocation / 100.0,
            ActionType::Hold => 0.0,
        };

        let mut reasoning = format!(
            "{} ({}) reads trend {:+.2}% on {} with volatility {:.3}; proposing {}.",
            agent.name,
            agent.role,
            market.trend_percent,
            sector.symbol,
            market.volatility,
            action
        );
        if let Some(ctx) = revision {
            if let Some(last) = ctx.rejected.last() {
                reasoning.push_str(&format!(
                    " Adjusting after rejection of item {} ({}).",
                    last.id,
                    last.rejection_reason
                        .as_ref()
                        .map(|r| r.reason.as_str())
                        .unwrap_or("no reason recorded")
                ));
            }
        }
        if !prior_messages.is_empty() {
            reasoning.push_str(&format!(
                " Weighed {} prior messages this round.",
                prior_messages.len()
            ));
        }

        Ok(Proposal {
            reasoning,
            proposal: format_proposal_line(action, &sector.symbol, amount, allocation),
            confidence: (agent.confidence / 100.0).clamp(0.0, 1.0),
            observation: false,
        })
    }
}

// ---------------------------------------------------------------------------
// HTTP oracle
// ---------------------------------------------------------------------------

/// Oracle that defers to an external model endpoint. Selected when USE_LLM
/// is set; every failure maps to `OracleFailure` so the deliberation layer
/// can fall back deterministically.
pub struct HttpOracle {
    endpoint: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OracleRequest<'a> {
    agent_id: &'a str,
    agent_name: &'a str,
    role: &'a str,
    confidence: f64,
    sector_id: &'a str,
    symbol: &'a str,
    balance: f64,
    trend_percent: f64,
    volatility: f64,
    prior_messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    revision: Option<&'a RevisionContext>,
}

#[derive(Deserialize)]
struct OracleResponse {
    reasoning: String,
    proposal: String,
    confidence: f64,
}

impl HttpOracle {
    pub fn new(endpoint: impl Into<String>, timeout: std::time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("failed to build reqwest client");
        Self {
            endpoint: endpoint.into(),
            client,
        }
    }
}

#[async_trait]
impl ProposalOracle for HttpOracle {
    async fn propose(
        &self,
        agent: &Agent,
        sector: &Sector,
        market: &MarketSnapshot,
        prior_messages: &[Message],
        revision: Option<&RevisionContext>,
    ) -> CoreResult<Proposal> {
        // The gate contract holds regardless of backend.
        if agent.confidence < CONFIDENCE_GATE {
            return DeterministicOracle
                .propose(agent, sector, market, prior_messages, revision)
                .await;
        }

        let request = OracleRequest {
            agent_id: &agent.id,
            agent_name: &agent.name,
            role: agent.role.as_str(),
            confidence: agent.confidence,
            sector_id: &sector.id,
            symbol: &sector.symbol,
            balance: sector.balance,
            trend_percent: market.trend_percent,
            volatility: market.volatility,
            prior_messages,
            revision,
        };

        debug!(agent = %agent.id, endpoint = %self.endpoint, "oracle request");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| CoreError::OracleFailure(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(CoreError::OracleFailure(format!(
                "endpoint returned {}",
                response.status()
            )));
        }

        let body: OracleResponse = response
            .json()
            .await
            .map_err(|e| CoreError::OracleFailure(format!("bad response body: {e}")))?;

        if !(0.0..=1.0).contains(&body.confidence) {
            return Err(CoreError::OracleFailure(format!(
                "confidence {} outside [0, 1]",
                body.confidence
            )));
        }

        Ok(Proposal {
            reasoning: body.reasoning,
            proposal: body.proposal,
            confidence: body.confidence,
            observation: false,
        })
    }
}
