//! `angelhub-core`: shared building blocks for the marketplace back office.
//!
//! This crate contains **pure** primitives (no infrastructure concerns): typed
//! identifiers, the shared error model and a clock abstraction so time-driven
//! logic (circuit breakers, dead-letter eligibility) stays testable.

pub mod clock;
pub mod error;
pub mod id;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{CoreError, CoreResult};
pub use id::{DeadLetterId, InvestmentId, JobId, PortfolioId, StartupId, UserId};
