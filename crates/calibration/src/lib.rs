//! Shadow auditing and adaptive execution calibration.
//!
//! - [`ShadowAuditor`] pairs paper and live fills and keeps a bounded drift history.
//! - [`SlippageController`] and [`PriorityFeeController`] turn that history
//!   into a slippage tolerance and a priority tip.
//! - [`AdaptiveCalibrationLoop`] drives both controllers after each trade.

pub mod auditor;
pub mod calibration_loop;
pub mod priority_fee;
pub mod slippage;

pub use auditor::{AuditStats, ShadowAuditor};
pub use calibration_loop::{
    AdaptiveCalibrationLoop, CalibrationOutcome, CalibrationSnapshot, CalibrationStatus, DriftSource,
};
pub use priority_fee::{CongestionLevel, PriorityFeeController, PriorityFeeStatus};
pub use slippage::{CalibrationAction, SlippageController, SlippageGauge, SlippageStatus};
