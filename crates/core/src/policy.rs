//! Tier and credit policy tables.
//!
//! Tier controls how many sequential passes a generation runs; the generation
//! mode a tier maps to controls how many credits a session costs. Both are
//! plain lookup tables. The atomic charge itself lives in the store layer.

use serde::{Deserialize, Serialize};

use crate::error::GenerationErrorCode;

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Account subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    Free,
    Refined,
    Enhanced,
    Ultimate,
    /// Pre-migration tier, treated like `Refined`.
    Pro,
}

impl Tier {
    /// String representation for database storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "FREE",
            Tier::Refined => "REFINED",
            Tier::Enhanced => "ENHANCED",
            Tier::Ultimate => "ULTIMATE",
            Tier::Pro => "PRO",
        }
    }

    /// Parse the stored form, defaulting to `Free` for unknown values.
    pub fn from_str_or_free(s: &str) -> Self {
        match s.to_ascii_uppercase().as_str() {
            "REFINED" => Tier::Refined,
            "ENHANCED" => Tier::Enhanced,
            "ULTIMATE" => Tier::Ultimate,
            "PRO" => Tier::Pro,
            _ => Tier::Free,
        }
    }
}

/// Number of sequential generation passes for a tier.
pub fn passes_for(tier: Tier) -> u32 {
    match tier {
        Tier::Free => 0,
        Tier::Refined => 1,
        Tier::Enhanced => 2,
        Tier::Ultimate => 3,
        Tier::Pro => 1,
    }
}

// ---------------------------------------------------------------------------
// Generation mode
// ---------------------------------------------------------------------------

/// Generation mode under the unified credit model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GenerationMode {
    Refined,
    Enhanced,
    Ultimate,
}

impl GenerationMode {
    pub fn as_str(self) -> &'static str {
        match self {
            GenerationMode::Refined => "REFINED",
            GenerationMode::Enhanced => "ENHANCED",
            GenerationMode::Ultimate => "ULTIMATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "REFINED" => Some(GenerationMode::Refined),
            "ENHANCED" => Some(GenerationMode::Enhanced),
            "ULTIMATE" => Some(GenerationMode::Ultimate),
            _ => None,
        }
    }
}

/// Credit cost of one generation session in the given mode.
pub fn cost_for(mode: GenerationMode) -> i32 {
    match mode {
        GenerationMode::Refined => 1,
        GenerationMode::Enhanced => 2,
        GenerationMode::Ultimate => 4,
    }
}

/// The generation mode a tier is entitled to. `Free` has none.
pub fn mode_for(tier: Tier) -> Option<GenerationMode> {
    match tier {
        Tier::Free => None,
        Tier::Refined | Tier::Pro => Some(GenerationMode::Refined),
        Tier::Enhanced => Some(GenerationMode::Enhanced),
        Tier::Ultimate => Some(GenerationMode::Ultimate),
    }
}

/// Everything the orchestrator needs to know about a tier, resolved up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GenerationPlan {
    pub tier: Tier,
    pub mode: GenerationMode,
    pub passes: u32,
    pub cost: i32,
}

/// Resolve the plan for a tier, or `UPGRADE_REQUIRED` if it has no passes.
pub fn plan_for(tier: Tier) -> Result<GenerationPlan, GenerationErrorCode> {
    let mode = mode_for(tier).ok_or(GenerationErrorCode::UpgradeRequired)?;
    let passes = passes_for(tier);
    if passes == 0 {
        return Err(GenerationErrorCode::UpgradeRequired);
    }
    Ok(GenerationPlan {
        tier,
        mode,
        passes,
        cost: cost_for(mode),
    })
}

// ---------------------------------------------------------------------------
// Ledger reasons
// ---------------------------------------------------------------------------

/// Reason code recorded on every credit ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerReason {
    GenerationCharge,
    GenerationRefund,
    Grant,
}

impl LedgerReason {
    pub fn as_str(self) -> &'static str {
        match self {
            LedgerReason::GenerationCharge => "generation_charge",
            LedgerReason::GenerationRefund => "generation_refund",
            LedgerReason::Grant => "grant",
        }
    }
}
