//! The request fulfillment engine: token accounting, account selection,
//! tool-call correlation, and the staged pipeline that adapts both upstream
//! transports onto one client contract.

pub mod fingerprint;
pub mod pipeline;
pub mod select;
pub mod services;
pub mod stopseq;
pub mod tokens;
pub mod tracker;

pub use pipeline::{Pipeline, PipelineOutput};
pub use select::{AccountSelector, RouteDecision, Transport};
pub use services::Services;
pub use tokens::TokenCounter;
pub use tracker::ToolCallTracker;
