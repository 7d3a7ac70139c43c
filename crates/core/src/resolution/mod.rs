pub mod engine;
pub mod states;

pub use engine::{transition, IssueQueue, QueueTransitionError};
pub use states::{
    PendingIssue, PendingProductAction, QueueAction, QueueContext, QueueEvent, QueueState,
    Resolution, ServerRequest, TransitionOutcome,
};
