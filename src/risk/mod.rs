//! Risk budget and safety limits

pub mod governor;
pub mod safety;

pub use governor::{RiskCheck, RiskGovernor};
pub use safety::{SafetyAction, SafetyCheck, SafetyGuard};
