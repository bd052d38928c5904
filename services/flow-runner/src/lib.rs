//! Flow Runner Library
//!
//! Live trading engine: composite signal scoring, adaptive component
//! weights, a risk gate chain, idempotent order execution and broker
//! reconciliation, driven by a supervised decision loop.

pub mod broker;
pub mod cache;
pub mod config;
pub mod executor;
pub mod exits;
pub mod expectancy;
pub mod gates;
pub mod http_broker;
pub mod intent;
pub mod learner;
pub mod market;
pub mod paper;
pub mod portfolio;
pub mod ratelimit;
pub mod reconciler;
pub mod regime;
pub mod retry;
pub mod risk;
pub mod runner;
pub mod scoring;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod types;

// Re-export main types for convenience
pub use broker::{Account, Broker, BrokerError, BrokerPosition, OrderAck, OrderRequest, Quote};
pub use cache::{FileSignalCache, MarketSignals, MemorySignalCache, SignalCache};
pub use config::{BrokerCredentials, Settings, TradingMode};
pub use executor::{ExecutionEngine, ExecutionError, Permits};
pub use exits::{ExitDecision, ExitManager, ExitTrigger};
pub use gates::{GateVerdict, RiskGateChain};
pub use http_broker::HttpBroker;
pub use intent::{IntentRegistry, IntentState, OrderIntent};
pub use learner::{AdaptiveWeightLearner, WeightModel};
pub use paper::PaperBroker;
pub use reconciler::{PositionReconciler, ReconciliationReport, ReconciliationState};
pub use regime::{RegimeClassifier, RegimeReading};
pub use runner::{CycleReport, Heartbeat, TradingRunner};
pub use scoring::CompositeScorer;
pub use state::StateManager;
pub use supervisor::{supervise, SupervisorError};
pub use types::{
    Candidate, CompositeScore, Direction, Position, Regime, Side, SignalComponent,
    SignalSnapshot, TradeOutcome,
};
