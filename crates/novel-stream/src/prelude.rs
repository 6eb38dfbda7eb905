//! Common imports for typical client usage.
pub use crate::{
    AbortHandle, AgentRole, ClientConfig, ClientError, CompletionHook, ExchangeEvent,
    ExchangeHandle, ExchangeOutcome, GenerationController, GenerationRequest, Granularity,
    HttpProjectStore, HttpTransport, LedgerDelta, PersistTarget, ProjectStore, SlotState,
    StorePersistence,
};
