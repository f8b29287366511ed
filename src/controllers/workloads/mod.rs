mod controller;
pub mod reconciler;
pub mod reconcilers;

pub use controller::{run, INJECTED_POD_LABEL};
pub use reconciler::{ReconcileOutcome, Reconciler, RestartDecision};
