//! armada-bus — agent RPC over a pub/sub message bus.
//!
//! The director talks to per-VM agents through subjects: requests go to
//! `agent.<agent_id>`, replies come back on a per-invocation inbox subject
//! named with a fresh correlation uuid. The bus itself is stateless; the
//! in-process `MemoryBus` backs the dummy cloud and tests, and anything
//! with the same publish/subscribe contract can stand in for it.

pub mod bus;
pub mod client;
pub mod messages;

pub use bus::{Bus, BusError, BusResult, MemoryBus, Subscription};
pub use client::AgentClient;
pub use messages::{
    agent_subject, inbox_subject, AgentException, AgentReply, AgentRequest, AgentTaskRef,
};
