pub mod audio;
pub mod config;
pub mod flow;
pub mod metrics;
pub mod patterns;
pub mod protocol;
pub mod server;
pub mod transcribe;

pub use audio::{AudioCache, Player};
pub use config::AppConfig;
pub use flow::{
    CampaignClient, CampaignConfig, FlowConfig, FlowEngine, FlowSession, GlobalTimer,
    ResponseClassifier, SessionLogger,
};
pub use patterns::PatternMatcher;
pub use protocol::{Frame, FrameKind, ProtocolError};
pub use server::Server;
pub use transcribe::{Transcriber, TranscriptionResult};
