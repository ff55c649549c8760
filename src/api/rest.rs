// =============================================================================
// REST API endpoints — Axum 0.7
// =============================================================================
//
// All endpoints live under `/api/v1/`. Error mapping:
//   400  validation failures
//   404  missing entities
//   409  invariant violations (duplicate active discussion, sector/agent
//        limits, insufficient balance/position, symbol not allowed)
//   500  everything else
//
// CORS is configured permissively for development.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{Json, Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, patch, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::error::CoreError;
use crate::model::{Agent, Discussion, ExecutionLog, Personality, Sector, UserAccount};
use crate::orchestrator::SystemOrchestrator;
use crate::storage::collections;
use crate::types::{AgentRole, SystemMode};

// =============================================================================
// Router construction
// =============================================================================

/// Build the full REST API router with CORS middleware and shared state.
pub fn router(orch: Arc<SystemOrchestrator>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Health & dashboard ──────────────────────────────────────
        .route("/api/v1/health", get(health))
        .route("/api/v1/state", get(full_state))
        // ── Sectors ─────────────────────────────────────────────────
        .route("/api/v1/sectors", get(list_sectors).post(create_sector))
        .route(
            "/api/v1/sectors/:id",
            get(get_sector).patch(update_sector).delete(delete_sector),
        )
        .route("/api/v1/sectors/:id/deposit", post(deposit))
        .route("/api/v1/sectors/:id/withdraw", post(withdraw))
        .route("/api/v1/sectors/:id/confidence-tick", patch(confidence_tick))
        .route("/api/v1/sectors/:id/message-manager", post(message_manager))
        // ── Agents ──────────────────────────────────────────────────
        .route("/api/v1/agents", get(list_agents).post(create_agent))
        .route(
            "/api/v1/agents/:id",
            get(get_agent).patch(update_agent).delete(delete_agent),
        )
        // ── Discussions & logs ──────────────────────────────────────
        .route("/api/v1/discussions", get(list_discussions))
        .route("/api/v1/discussions/:id", get(get_discussion))
        .route("/api/v1/executionLogs", get(list_execution_logs))
        // ── Control ─────────────────────────────────────────────────
        .route("/api/v1/control/mode", post(set_mode))
        // ── Middleware & state ──────────────────────────────────────
        .layer(cors)
        .with_state(orch)
}

// =============================================================================
// Error mapping
// =============================================================================

pub struct ApiError(CoreError);

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            CoreError::Validation(_) => StatusCode::BAD_REQUEST,
            CoreError::NotFound(_) => StatusCode::NOT_FOUND,
            e if e.is_invariant_violation() => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// Health & dashboard
// =============================================================================

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    state_version: u64,
    server_time: i64,
}

async fn health(State(orch): State<Arc<SystemOrchestrator>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        state_version: orch.state.current_state_version(),
        server_time: Utc::now().timestamp_millis(),
    })
}

async fn full_state(State(orch): State<Arc<SystemOrchestrator>>) -> ApiResult<impl IntoResponse> {
    let snapshot = orch.state.build_snapshot().await?;
    Ok(Json(snapshot))
}

// =============================================================================
// Sectors
// =============================================================================

async fn list_sectors(State(orch): State<Arc<SystemOrchestrator>>) -> ApiResult<impl IntoResponse> {
    let sectors: Vec<Sector> = orch.state.store.read(collections::SECTORS).await?;
    Ok(Json(sectors))
}

async fn get_sector(
    State(orch): State<Arc<SystemOrchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = id.to_lowercase();
    let sector = find_sector(&orch, &id).await?;
    Ok(Json(sector))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSectorRequest {
    name: String,
    symbol: String,
    #[serde(default)]
    initial_balance: f64,
    #[serde(default = "default_initial_price")]
    initial_price: f64,
    #[serde(default)]
    volatility: f64,
    #[serde(default = "default_risk_score")]
    risk_score: u32,
    #[serde(default)]
    trend_factor: f64,
    #[serde(default)]
    allowed_symbols: Vec<String>,
}

fn default_initial_price() -> f64 {
    100.0
}

fn default_risk_score() -> u32 {
    50
}

async fn create_sector(
    State(orch): State<Arc<SystemOrchestrator>>,
    Json(req): Json<CreateSectorRequest>,
) -> ApiResult<impl IntoResponse> {
    if req.name.trim().is_empty() || req.symbol.trim().is_empty() {
        return Err(CoreError::Validation("name and symbol are required".into()).into());
    }
    if req.initial_price <= 0.0 || req.initial_balance < 0.0 {
        return Err(CoreError::Validation(
            "initial price must be positive and balance non-negative".into(),
        )
        .into());
    }

    let (max_sectors, max_total_agents, mode) = {
        let cfg = orch.state.runtime_config.read();
        (cfg.max_sectors, cfg.max_total_agents, cfg.mode)
    };

    let sectors: Vec<Sector> = orch.state.store.read(collections::SECTORS).await?;
    if sectors.len() >= max_sectors {
        return Err(CoreError::SectorLimit { limit: max_sectors }.into());
    }
    let agents: Vec<Agent> = orch.state.store.read(collections::AGENTS).await?;
    if agents.len() >= max_total_agents {
        return Err(CoreError::AgentLimit {
            limit: max_total_agents,
        }
        .into());
    }

    // Sector funding comes out of the user account.
    let amount = req.initial_balance;
    orch.state
        .store
        .update::<UserAccount, _, _>(collections::USER_ACCOUNT, move |accounts| {
            let acct = accounts
                .first_mut()
                .ok_or_else(|| CoreError::NotFound("user account".into()))?;
            if acct.balance < amount {
                return Err(CoreError::InsufficientBalance {
                    need: amount,
                    available: acct.balance,
                });
            }
            acct.balance -= amount;
            acct.updated_at = Utc::now();
            Ok(())
        })
        .await?;

    let mut sector = Sector::new(
        req.name.trim(),
        req.symbol.trim(),
        req.initial_balance,
        req.initial_price,
        req.volatility,
        req.risk_score,
        req.trend_factor,
        req.allowed_symbols,
        mode,
    );

    // Every sector is born with its manager.
    let manager = Agent::new(
        sector.id.clone(),
        format!("{} manager", sector.name),
        AgentRole::Manager,
        Personality::default(),
    );
    sector.agent_ids.push(manager.id.clone());

    let s = sector.clone();
    orch.state
        .store
        .update::<Sector, _, _>(collections::SECTORS, move |v| {
            v.push(s.clone());
            Ok(())
        })
        .await?;
    let m = manager.clone();
    orch.state
        .store
        .update::<Agent, _, _>(collections::AGENTS, move |v| {
            v.push(m.clone());
            Ok(())
        })
        .await?;

    orch.start_sector(&sector.id);
    orch.state.increment_version();
    info!(sector = %sector.id, name = %sector.name, "sector created");

    Ok((StatusCode::CREATED, Json(sector)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSectorRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    volatility: Option<f64>,
    #[serde(default)]
    risk_score: Option<u32>,
    #[serde(default)]
    trend_factor: Option<f64>,
    #[serde(default)]
    allowed_symbols: Option<Vec<String>>,
}

async fn update_sector(
    State(orch): State<Arc<SystemOrchestrator>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateSectorRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = id.to_lowercase();
    if let Some(v) = req.volatility {
        if !(0.0..=1.0).contains(&v) {
            return Err(CoreError::Validation(format!("volatility {v} outside [0, 1]")).into());
        }
    }
    if let Some(t) = req.trend_factor {
        if !(-1.0..=1.0).contains(&t) {
            return Err(CoreError::Validation(format!("trend factor {t} outside [-1, 1]")).into());
        }
    }
    if let Some(r) = req.risk_score {
        if r > 100 {
            return Err(CoreError::Validation(format!("risk score {r} outside [0, 100]")).into());
        }
    }

    let sid = id.clone();
    let sector = orch
        .state
        .store
        .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
            let s = sectors
                .iter_mut()
                .find(|s| s.id == sid)
                .ok_or_else(|| CoreError::NotFound(format!("sector {sid}")))?;
            if let Some(name) = &req.name {
                if name.trim().is_empty() {
                    return Err(CoreError::Validation("name must not be empty".into()));
                }
                s.name = name.trim().to_string();
            }
            if let Some(v) = req.volatility {
                s.volatility = v;
            }
            if let Some(r) = req.risk_score {
                s.risk_score = r;
            }
            if let Some(t) = req.trend_factor {
                s.trend_factor = t;
            }
            if let Some(symbols) = &req.allowed_symbols {
                let mut allowed: Vec<String> =
                    symbols.iter().map(|x| x.to_uppercase()).collect();
                if !allowed.contains(&s.symbol) {
                    allowed.push(s.symbol.clone());
                }
                s.allowed_symbols = allowed;
            }
            s.updated_at = Utc::now();
            Ok(s.clone())
        })
        .await?;

    orch.state.increment_version();
    Ok(Json(sector))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteSectorRequest {
    confirm_name: String,
}

async fn delete_sector(
    State(orch): State<Arc<SystemOrchestrator>>,
    Path(id): Path<String>,
    Json(req): Json<DeleteSectorRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = id.to_lowercase();
    let refund = orch.handle_sector_delete(&id, &req.confirm_name).await?;
    Ok(Json(serde_json::json!({ "deleted": id, "refunded": refund })))
}

// =============================================================================
// Deposits & withdrawals
// =============================================================================

#[derive(Deserialize)]
struct DepositRequest {
    amount: f64,
}

async fn deposit(
    State(orch): State<Arc<SystemOrchestrator>>,
    Path(id): Path<String>,
    Json(req): Json<DepositRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = id.to_lowercase();
    if req.amount <= 0.0 || !req.amount.is_finite() {
        return Err(CoreError::Validation(format!("invalid deposit amount {}", req.amount)).into());
    }
    find_sector(&orch, &id).await?;

    let amount = req.amount;
    orch.state
        .store
        .update::<UserAccount, _, _>(collections::USER_ACCOUNT, move |accounts| {
            let acct = accounts
                .first_mut()
                .ok_or_else(|| CoreError::NotFound("user account".into()))?;
            if acct.balance < amount {
                return Err(CoreError::InsufficientBalance {
                    need: amount,
                    available: acct.balance,
                });
            }
            acct.balance -= amount;
            acct.updated_at = Utc::now();
            Ok(())
        })
        .await?;

    let moves_price = orch.state.runtime_config.read().deposit_moves_price;
    let sid = id.clone();
    let sector = orch
        .state
        .store
        .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
            let s = sectors
                .iter_mut()
                .find(|s| s.id == sid)
                .ok_or_else(|| CoreError::NotFound(format!("sector {sid}")))?;
            let now = Utc::now();
            s.balance += amount;
            if moves_price {
                // Deposits credit the price as well; withdrawals never do.
                let next = s.current_price + amount;
                s.set_price(next, now);
            } else {
                s.updated_at = now;
            }
            Ok(s.clone())
        })
        .await?;

    orch.state.increment_version();
    info!(sector = %id, amount, "deposit applied");
    Ok(Json(sector))
}

/// Withdraw a fixed amount or everything.
#[derive(Deserialize)]
#[serde(untagged)]
enum WithdrawAmount {
    Amount(f64),
    All(String),
}

#[derive(Deserialize)]
struct WithdrawRequest {
    amount: WithdrawAmount,
}

async fn withdraw(
    State(orch): State<Arc<SystemOrchestrator>>,
    Path(id): Path<String>,
    Json(req): Json<WithdrawRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = id.to_lowercase();

    let all = match &req.amount {
        WithdrawAmount::All(s) if s.eq_ignore_ascii_case("all") => true,
        WithdrawAmount::All(other) => {
            return Err(
                CoreError::Validation(format!("invalid withdraw amount '{other}'")).into(),
            )
        }
        WithdrawAmount::Amount(a) if *a <= 0.0 || !a.is_finite() => {
            return Err(CoreError::Validation(format!("invalid withdraw amount {a}")).into())
        }
        WithdrawAmount::Amount(_) => false,
    };

    let sid = id.clone();
    let requested = match req.amount {
        WithdrawAmount::Amount(a) => a,
        WithdrawAmount::All(_) => 0.0,
    };
    let withdrawn = orch
        .state
        .store
        .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
            let s = sectors
                .iter_mut()
                .find(|s| s.id == sid)
                .ok_or_else(|| CoreError::NotFound(format!("sector {sid}")))?;
            let amount = if all { s.balance } else { requested };
            if amount > s.balance {
                return Err(CoreError::InsufficientBalance {
                    need: amount,
                    available: s.balance,
                });
            }
            // Withdrawals debit the balance only; the price never moves.
            s.balance -= amount;
            s.updated_at = Utc::now();
            Ok(amount)
        })
        .await?;

    orch.state
        .store
        .update::<UserAccount, _, _>(collections::USER_ACCOUNT, move |accounts| {
            match accounts.first_mut() {
                Some(acct) => {
                    acct.balance += withdrawn;
                    acct.updated_at = Utc::now();
                }
                None => accounts.push(UserAccount::new(withdrawn)),
            }
            Ok(())
        })
        .await?;

    orch.state.increment_version();
    info!(sector = %id, withdrawn, "withdrawal applied");
    Ok(Json(serde_json::json!({ "withdrawn": withdrawn })))
}

// =============================================================================
// Confidence tick & manager memos
// =============================================================================

async fn confidence_tick(
    State(orch): State<Arc<SystemOrchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = id.to_lowercase();
    let report = orch.tick_once(&id).await?;
    orch.state.increment_version();
    Ok(Json(report))
}

#[derive(Deserialize)]
struct MessageManagerRequest {
    message: String,
}

async fn message_manager(
    State(orch): State<Arc<SystemOrchestrator>>,
    Path(id): Path<String>,
    Json(req): Json<MessageManagerRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = id.to_lowercase();
    if req.message.trim().is_empty() {
        return Err(CoreError::Validation("message must not be empty".into()).into());
    }
    find_sector(&orch, &id).await?;

    let sid = id.clone();
    let memo = req.message.trim().to_string();
    let manager = orch
        .state
        .store
        .update::<Agent, _, _>(collections::AGENTS, move |agents| {
            let manager = agents
                .iter_mut()
                .find(|a| a.sector_id == sid && a.is_manager())
                .ok_or_else(|| CoreError::NotFound(format!("manager for sector {sid}")))?;
            manager.remember(memo.clone());
            Ok(manager.clone())
        })
        .await?;

    orch.state.increment_version();
    Ok(Json(serde_json::json!({
        "managerId": manager.id,
        "memoryLen": manager.memory.len(),
    })))
}

// =============================================================================
// Agents
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SectorQuery {
    sector_id: Option<String>,
}

async fn list_agents(
    State(orch): State<Arc<SystemOrchestrator>>,
    Query(q): Query<SectorQuery>,
) -> ApiResult<impl IntoResponse> {
    let agents: Vec<Agent> = orch.state.store.read(collections::AGENTS).await?;
    let filtered: Vec<Agent> = match q.sector_id {
        Some(sid) => {
            let sid = sid.to_lowercase();
            agents.into_iter().filter(|a| a.sector_id == sid).collect()
        }
        None => agents,
    };
    Ok(Json(filtered))
}

async fn get_agent(
    State(orch): State<Arc<SystemOrchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = id.to_lowercase();
    let agent = orch
        .state
        .store
        .read::<Agent>(collections::AGENTS)
        .await?
        .into_iter()
        .find(|a| a.id == id)
        .ok_or_else(|| CoreError::NotFound(format!("agent {id}")))?;
    Ok(Json(agent))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAgentRequest {
    sector_id: String,
    name: String,
    role: String,
    #[serde(default)]
    risk_tolerance: Option<f64>,
    #[serde(default)]
    decision_style: Option<crate::model::agent::DecisionStyle>,
}

async fn create_agent(
    State(orch): State<Arc<SystemOrchestrator>>,
    Json(req): Json<CreateAgentRequest>,
) -> ApiResult<impl IntoResponse> {
    let role = AgentRole::parse(&req.role)
        .ok_or_else(|| CoreError::Validation(format!("unknown role '{}'", req.role)))?;
    if role.is_manager() {
        return Err(CoreError::Validation(
            "managers are created with their sector".into(),
        )
        .into());
    }
    if req.name.trim().is_empty() {
        return Err(CoreError::Validation("agent name is required".into()).into());
    }

    let sector_id = req.sector_id.to_lowercase();
    find_sector(&orch, &sector_id).await?;

    let (per_sector_limit, total_limit) = {
        let cfg = orch.state.runtime_config.read();
        (cfg.max_agents_per_sector, cfg.max_total_agents)
    };

    let agents: Vec<Agent> = orch.state.store.read(collections::AGENTS).await?;
    if agents.len() >= total_limit {
        return Err(CoreError::AgentLimit { limit: total_limit }.into());
    }
    if agents.iter().filter(|a| a.sector_id == sector_id).count() >= per_sector_limit {
        return Err(CoreError::AgentLimit {
            limit: per_sector_limit,
        }
        .into());
    }

    let mut personality = Personality::default();
    if let Some(rt) = req.risk_tolerance {
        if !(0.0..=1.0).contains(&rt) {
            return Err(
                CoreError::Validation(format!("risk tolerance {rt} outside [0, 1]")).into(),
            );
        }
        personality.risk_tolerance = rt;
    }
    if let Some(style) = req.decision_style {
        personality.decision_style = style;
    }

    let agent = Agent::new(sector_id.clone(), req.name.trim(), role, personality);

    let a = agent.clone();
    orch.state
        .store
        .update::<Agent, _, _>(collections::AGENTS, move |v| {
            v.push(a.clone());
            Ok(())
        })
        .await?;
    let aid = agent.id.clone();
    let sid = sector_id.clone();
    orch.state
        .store
        .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
            if let Some(s) = sectors.iter_mut().find(|s| s.id == sid) {
                s.agent_ids.push(aid.clone());
                s.updated_at = Utc::now();
            }
            Ok(())
        })
        .await?;

    orch.state.increment_version();
    info!(agent = %agent.id, sector = %sector_id, role = %agent.role, "agent created");
    Ok((StatusCode::CREATED, Json(agent)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateAgentRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    morale: Option<u32>,
    #[serde(default)]
    risk_tolerance: Option<f64>,
    #[serde(default)]
    decision_style: Option<crate::model::agent::DecisionStyle>,
}

async fn update_agent(
    State(orch): State<Arc<SystemOrchestrator>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateAgentRequest>,
) -> ApiResult<impl IntoResponse> {
    let id = id.to_lowercase();
    if let Some(m) = req.morale {
        if m > 100 {
            return Err(CoreError::Validation(format!("morale {m} outside [0, 100]")).into());
        }
    }
    if let Some(rt) = req.risk_tolerance {
        if !(0.0..=1.0).contains(&rt) {
            return Err(
                CoreError::Validation(format!("risk tolerance {rt} outside [0, 1]")).into(),
            );
        }
    }

    let aid = id.clone();
    let agent = orch
        .state
        .store
        .update::<Agent, _, _>(collections::AGENTS, move |agents| {
            let a = agents
                .iter_mut()
                .find(|a| a.id == aid)
                .ok_or_else(|| CoreError::NotFound(format!("agent {aid}")))?;
            if let Some(name) = &req.name {
                if name.trim().is_empty() {
                    return Err(CoreError::Validation("name must not be empty".into()));
                }
                a.name = name.trim().to_string();
            }
            if let Some(m) = req.morale {
                a.morale = m;
            }
            if let Some(rt) = req.risk_tolerance {
                a.personality.risk_tolerance = rt;
            }
            if let Some(style) = req.decision_style {
                a.personality.decision_style = style;
            }
            a.updated_at = Utc::now();
            Ok(a.clone())
        })
        .await?;

    orch.state.increment_version();
    Ok(Json(agent))
}

async fn delete_agent(
    State(orch): State<Arc<SystemOrchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = id.to_lowercase();
    let aid = id.clone();
    let agent = orch
        .state
        .store
        .update::<Agent, _, _>(collections::AGENTS, move |agents| {
            let idx = agents
                .iter()
                .position(|a| a.id == aid)
                .ok_or_else(|| CoreError::NotFound(format!("agent {aid}")))?;
            if agents[idx].is_manager() {
                return Err(CoreError::Validation(
                    "the manager is deleted with its sector".into(),
                ));
            }
            Ok(agents.remove(idx))
        })
        .await?;

    let sid = agent.sector_id.clone();
    let aid = agent.id.clone();
    orch.state
        .store
        .update::<Sector, _, _>(collections::SECTORS, move |sectors| {
            if let Some(s) = sectors.iter_mut().find(|s| s.id == sid) {
                s.agent_ids.retain(|x| x != &aid);
                s.updated_at = Utc::now();
            }
            Ok(())
        })
        .await?;

    orch.state.increment_version();
    Ok(Json(serde_json::json!({ "deleted": agent.id })))
}

// =============================================================================
// Discussions & execution logs
// =============================================================================

async fn list_discussions(
    State(orch): State<Arc<SystemOrchestrator>>,
    Query(q): Query<SectorQuery>,
) -> ApiResult<impl IntoResponse> {
    let discussions: Vec<Discussion> = orch.state.store.read(collections::DISCUSSIONS).await?;
    let filtered: Vec<Discussion> = match q.sector_id {
        Some(sid) => {
            let sid = sid.to_lowercase();
            discussions
                .into_iter()
                .filter(|d| d.sector_id == sid)
                .collect()
        }
        None => discussions,
    };
    Ok(Json(filtered))
}

async fn get_discussion(
    State(orch): State<Arc<SystemOrchestrator>>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id = id.to_lowercase();
    let discussion = orch
        .state
        .store
        .read::<Discussion>(collections::DISCUSSIONS)
        .await?
        .into_iter()
        .find(|d| d.id == id)
        .ok_or_else(|| CoreError::NotFound(format!("discussion {id}")))?;
    Ok(Json(discussion))
}

async fn list_execution_logs(
    State(orch): State<Arc<SystemOrchestrator>>,
    Query(q): Query<SectorQuery>,
) -> ApiResult<impl IntoResponse> {
    let logs: Vec<ExecutionLog> = orch.state.store.read(collections::EXECUTION_LOGS).await?;
    let filtered: Vec<ExecutionLog> = match q.sector_id {
        Some(sid) => {
            let sid = sid.to_lowercase();
            logs.into_iter().filter(|l| l.sector_id == sid).collect()
        }
        None => logs,
    };
    Ok(Json(filtered))
}

// =============================================================================
// Control
// =============================================================================

#[derive(Deserialize)]
struct SetModeRequest {
    mode: SystemMode,
}

async fn set_mode(
    State(orch): State<Arc<SystemOrchestrator>>,
    Json(req): Json<SetModeRequest>,
) -> ApiResult<impl IntoResponse> {
    orch.set_mode(req.mode).await?;
    Ok(Json(serde_json::json!({ "mode": req.mode })))
}

// =============================================================================
// Helpers
// =============================================================================

async fn find_sector(orch: &Arc<SystemOrchestrator>, id: &str) -> Result<Sector, CoreError> {
    orch.state
        .store
        .read::<Sector>(collections::SECTORS)
        .await?
        .into_iter()
        .find(|s| s.id == id)
        .ok_or_else(|| CoreError::NotFound(format!("sector {id}")))
}
