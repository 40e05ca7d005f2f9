pub mod backoff;
pub mod config;
pub mod config_loader;
pub mod events;
pub mod position;
pub mod position_sizing;
pub mod traits;

pub use backoff::{Backoff, BackoffError};
pub use config::{
    AdmissionConfig, AppConfig, AuditorConfig, BackoffConfig, ConfidenceSizingConfig, EnginesConfig,
    LedgerConfig, LiquidityPolicy, PersistenceConfig, PriorityFeeConfig, SimulatorConfig,
    SlippageControllerConfig, SlippageModelConfig, SlippageTier, WatcherConfig,
};
pub use config_loader::ConfigLoader;
pub use events::{ExecutionMode, Rejection, ShadowAudit, Signal, TradeAction, TradeResult};
pub use position::{EngineAccount, EngineStats, LedgerSnapshot, Position, WatcherRecord};
pub use position_sizing::size_for_confidence;
pub use traits::{
    AssetSafety, LiquiditySource, NotificationPriority, Notifier, Persistence, PredictiveFilter,
    PriceReference, ReferencePrice, SafetyVerdict, SwapBackend, SwapReceipt, SwapRequest,
};
