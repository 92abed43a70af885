//! Recording sessions across the fleet

pub mod actor;
pub mod state;

pub use actor::{NodeOutcome, SessionHandle, StopPlan};
pub use state::{
    Confirmation, NodeRecord, NodeRecordingState, Session, SessionPhase, SessionStatus,
    SessionSummary,
};
