// Order lifecycle state machine and supervision loops
pub mod lifecycle;
pub mod monitor;

pub use lifecycle::{
    ActivePosition, LifecycleStatus, OrderLifecycleManager, PendingEntry, PositionSource,
};
