//! Review subsystem: out-of-process verdicts over worker reports.

mod processor;

pub use processor::{
    criteria_for_rework_count, parse_verdict, ReviewProcessor, ReviewSummary, ReviewVerdict,
    MIN_REPORT_CHARS,
};
