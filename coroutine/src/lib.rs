//! Coroutine control blocks and the context switch underneath them.
//!
//! All architecture specific code sits in [`context`]: creating a fresh
//! context on a stack and switching between two contexts. Everything above
//! it deals in [`Coroutine`] blocks and [`CoroutineId`]s.

pub mod context;

pub mod coroutine;

pub use crate::context::Context;
pub use crate::coroutine::{Coroutine, CoroutineId, Payload, Status, Work};
