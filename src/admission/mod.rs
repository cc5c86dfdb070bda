//! Admission logic and window state management.

mod engine;
mod rules;
mod store;
mod window;

pub use engine::{AdmissionEngine, Decision};
pub use rules::{AddressLimit, RateRule, RoleLimit, RuleResolver, Tier};
pub use store::{AdmissionResult, WindowStore};
pub use window::InMemoryWindowStore;
