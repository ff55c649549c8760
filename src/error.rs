// =============================================================================
// Domain error type for the Concord sector engine
// =============================================================================
//
// Error kinds map onto the HTTP surface as follows (the mapping itself lives
// in the API layer):
//   Validation           -> 400
//   NotFound             -> 404
//   DuplicateActive, SectorLimit, AgentLimit, InsufficientBalance,
//   InsufficientPosition, SymbolNotAllowed -> 409
//   everything else      -> 500
// =============================================================================

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate active discussion for sector {sector_id}")]
    DuplicateActive { sector_id: String },

    #[error("sector limit reached: {limit}")]
    SectorLimit { limit: usize },

    #[error("agent limit reached: {limit}")]
    AgentLimit { limit: usize },

    #[error("insufficient balance: need {need:.2}, available {available:.2}")]
    InsufficientBalance { need: f64, available: f64 },

    #[error("insufficient position: need {need:.2}, available {available:.2}")]
    InsufficientPosition { need: f64, available: f64 },

    #[error("symbol not allowed: {symbol}")]
    SymbolNotAllowed { symbol: String },

    #[error("oracle failure: {0}")]
    OracleFailure(String),

    #[error("storage conflict on collection '{collection}'")]
    StorageConflict { collection: String },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("discussion stalled: {0}")]
    Stalled(String),

    #[error("shutdown in progress")]
    Shutdown,
}

impl CoreError {
    /// True for the 409-class errors: a state invariant blocked the request.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateActive { .. }
                | Self::SectorLimit { .. }
                | Self::AgentLimit { .. }
                | Self::InsufficientBalance { .. }
                | Self::InsufficientPosition { .. }
                | Self::SymbolNotAllowed { .. }
        )
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
