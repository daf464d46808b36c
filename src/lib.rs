//! errp-flux - Closed-loop biosignal adaptation engine
//!
//! Flux turns a continuous multichannel stream into adaptive decisions through
//! a closed loop: windowing → feature extraction → (external) classification →
//! error-signal detection → reward → contextual bandit update → intervention.
//!
//! ## Modules
//!
//! - **Segmentation and features**: fixed-length windows, band-power features
//! - **Archive**: the EBS binary session archive (header + raw f32 windows)
//! - **Feedback**: error-signal detector, LinUCB bandit and the orchestrator
//! - **Transport**: in-process named streams and the async session loop

pub mod archive;
pub mod bandit;
pub mod config;
pub mod detector;
pub mod error;
pub mod features;
pub mod linalg;
pub mod pipeline;
pub mod preprocess;
pub mod reward;
pub mod segmenter;
pub mod session;
pub mod synth;
pub mod transport;
pub mod types;

pub use archive::{ArchiveHeader, ArchiveReader, ArchiveWriter};
pub use bandit::LinUcbBandit;
pub use config::SessionConfig;
pub use detector::{ErrorScorer, ErrorSignalDetector, TemplateScorer};
pub use error::ComputeError;
pub use features::FeatureExtractor;
pub use pipeline::{replay_archive, FeedbackEvent, FeedbackOrchestrator, SessionSummary};
pub use reward::RewardMapping;
pub use segmenter::Segmenter;
pub use session::{run_session, SessionStreams};
pub use transport::StreamHub;

/// Flux version recorded in archives and reports
pub const ERRP_FLUX_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name for archives and stream metadata
pub const PRODUCER_NAME: &str = "errp-flux";
