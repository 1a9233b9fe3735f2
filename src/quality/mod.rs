// Translation quality scoring and the bounded retry/fallback gate

pub mod gate;
pub mod prompt;
pub mod scorer;

pub use gate::{GateConfig, GateDecision, GateReport, GateState, QualityGate, RegionGateOutcome, RetryBudget};
pub use prompt::PromptTemplate;
pub use scorer::{QualityScorer, QualitySignals, ScorerConfig};
