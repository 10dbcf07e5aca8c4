// Risk management module
pub mod sizer;

pub use sizer::{PositionSize, RiskSizer};
