//! Per-connection verification sessions.
//!
//! [`fsm::SessionMachine`] holds all state for one WebSocket connection and
//! is driven by [`actor::run`], which owns the socket.

pub mod actor;
pub mod fsm;

use std::sync::Arc;

use liveproof_core::ByteBudget;

use crate::config::Policy;
use crate::engine::EngineHandle;
use crate::store::SessionStore;

/// Shared services every session actor needs.
#[derive(Clone)]
pub struct SessionDeps {
    pub policy: Arc<Policy>,
    pub store: SessionStore,
    pub engine: EngineHandle,
    pub budget: ByteBudget,
    pub buffer_max_frames: usize,
    pub max_fps: u32,
}

pub use fsm::{SessionMachine, Step};
