pub mod audit;
pub mod collaborators;
pub mod config;
pub mod domain;
pub mod eligibility;
pub mod errors;
pub mod payment;
pub mod reconciliation;
pub mod resolution;
pub mod runtime;
pub mod session;
pub mod verification;

pub use audit::{AuditContext, AuditEvent, AuditSink, InMemoryAuditSink};
pub use collaborators::{
    CatalogEntry, CatalogLookup, CheckoutSubmitter, CopayCheckService, OrdersSource,
    ProductCatalog, StockService, SubmissionReceipt,
};
pub use config::{AppConfig, FeatureFlags, LoadOptions};
pub use domain::dose::{CandidateDose, Dose, DoseId, DoseState};
pub use domain::issue::{Issue, IssueKind, ResolutionChoice};
pub use domain::payment::{PaymentMethod, PaymentMode, PaymentModeReason, PaymentSelection};
pub use domain::product::{Product, ProductId};
pub use domain::visit::{VisitId, VisitSnapshot};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use payment::{PaymentGroup, SubmissionPlan};
pub use reconciliation::{DoseReason, ReasonContext};
pub use resolution::{IssueQueue, QueueState};
pub use runtime::{CheckoutRuntime, Collaborators, RuntimeStep, ServerCallPolicy};
pub use session::{
    CheckoutSession, SessionEffect, SessionEvent, SessionOutcome, SessionState, SideFlow,
    SideFlowResult,
};
pub use verification::{DeterministicProductVerifier, ProductVerifier, Verification};
