//! Fan control engine modules
//!
//! Contains the proportional-band policy evaluator.

mod evaluator;

pub use evaluator::{combine_inputs, evaluate, evaluate_fan};
