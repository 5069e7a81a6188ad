//! Guarded coroutine stacks and a bounded cache to recycle them.
//!
//! A scheduler owns one [`StackPool`]; pools are never shared between
//! scheduler instances.

pub mod pool;

pub mod stack;

mod system;

pub use crate::pool::{PoolStats, StackPool};
pub use crate::stack::{Stack, StackError};
