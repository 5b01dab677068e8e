//! dqstudio-engine: the components that talk to the outside world.
//!
//! - [`gateway`] -- read-only queries and catalog browsing ([`TabularQueryGateway`])
//! - [`jobs`] -- fire-and-poll generation and validation jobs ([`JobOrchestrator`])
//! - [`ledger`] -- append-only rule-set versions ([`RuleVersionLedger`])
//! - [`relay`] -- AI summaries that degrade instead of failing ([`AnalysisRelay`])
//! - [`studio`] -- request-level flows over all of the above ([`RuleStudio`])
//!
//! Remote collaborators sit behind traits ([`gateway::TabularEngine`],
//! [`jobs::JobPlatform`], [`relay::SummaryEndpoint`]); the bundled
//! implementations speak the workspace REST APIs over `ureq`.

mod http;

pub mod gateway;
pub mod jobs;
pub mod ledger;
pub mod relay;
pub mod studio;

pub use gateway::TabularQueryGateway;
pub use http::{HttpClient, HttpError};
pub use jobs::JobOrchestrator;
pub use ledger::RuleVersionLedger;
pub use relay::{AiSummary, AnalysisRelay, RelayOutcome};
pub use studio::{open_ledger_storage, ConfirmRequest, Confirmation, RuleStudio};
