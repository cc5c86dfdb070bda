//! HTTP middleware and response annotation.

mod layer;
pub mod reject;

pub use layer::{AdmissionLayer, AdmissionService};
pub use reject::ResponseAnnotator;
