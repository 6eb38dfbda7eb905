//! Streaming client for the multi-agent novel-writing backend.
//!
//! A planner, a writer and a reviewer each produce text over a streamed
//! exchange. This crate decodes the stream, folds it into a shared message
//! ledger, and runs one generation slot per agent with prerequisites,
//! cancellation and a completion hook for persistence.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use novel_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let controller = GenerationController::builder(Arc::new(HttpTransport::from_env()?)).build();
//!
//! let outcome = controller
//!     .start(GenerationRequest::new(AgentRole::Planner, "demo").topic("A story about rain"))?
//!     .finish()
//!     .await?;
//!
//! println!("{}", outcome.artifact.unwrap_or_default());
//! # Ok(())
//! # }
//! ```

/// Client configuration loaded from the environment.
pub mod config;
/// Generation slots, exchange handles and cancellation.
pub mod controller;
/// Public error types.
pub mod errors;
/// Classification of decoded payloads into agent events.
pub mod event;
/// Byte stream to frame reassembly.
pub mod frame;
/// Completion hook and store-backed persistence.
pub mod hook;
/// Ordered message ledger.
pub mod ledger;
/// Agent roles, granularities and designated fields.
pub mod model;
/// Tracing subscriber setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Generation requests and their wire form.
pub mod request;
/// Project store collaborator.
pub mod store;
/// Streaming transport contract and HTTP implementation.
pub mod transport;

pub use config::ClientConfig;
pub use controller::{
    AbortHandle, ControllerBuilder, ExchangeEvent, ExchangeHandle, ExchangeOutcome,
    GenerationController, SlotState,
};
pub use errors::{ClientError, ExchangeError, MalformedFrame, StartError, StoreError};
pub use event::{AgentEvent, StructuredResult, classify};
pub use frame::{Frame, FrameDecoder};
pub use hook::{CompletionHook, PersistTarget, StorePersistence};
pub use ledger::{Ledger, LedgerDelta, Message};
pub use model::{AgentRole, Author, FieldMap, Granularity};
pub use observability::init_observability;
pub use request::{ExchangeRequest, GenerationRequest};
pub use store::{Chapter, HttpProjectStore, Project, ProjectStore, Section, SectionUpdate, TitleKind};
pub use transport::{ByteStream, ExchangeTransport, HttpTransport};
