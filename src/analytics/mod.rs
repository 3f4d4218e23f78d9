//! Workflow analytics: stage distribution, deadlines, dwell times and
//! publishing throughput.

pub mod analysis;
pub mod bottleneck;
pub mod dwell;
pub mod reports;
pub mod types;

pub use analysis::WorkflowAnalyzer;
pub use reports::format_report;
pub use types::*;
