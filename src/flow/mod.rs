pub mod api;
pub mod classifier;
pub mod config;
pub mod engine;
pub mod session_log;
pub mod timer;

pub use api::{CampaignClient, CampaignConfig};
pub use classifier::{ResponseClassifier, ResponseKind};
pub use config::{Action, ActionType, FlowConfig, FlowNode, NodeType};
pub use engine::{EngineOptions, FlowEngine, FlowSession};
pub use session_log::SessionLogger;
pub use timer::GlobalTimer;
