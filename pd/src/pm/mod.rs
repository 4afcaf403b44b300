//! PM subsystem: order planning and redesign escalation.

pub mod planner;
pub mod redesign;

pub use planner::{PlanSummary, Planner};
pub use redesign::{RedesignHandler, RedesignResult};
