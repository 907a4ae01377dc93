//! Risk scoring, training, and the autonomous model lifecycle.

pub mod explainer;
pub mod gbm;
pub mod guardian;
pub mod registry;
pub mod scorer;
pub mod trainer;
