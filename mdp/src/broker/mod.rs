//! Broker engine and its registry types.

mod engine;
mod service;
mod transport;
mod worker;

pub use engine::Broker;
pub use service::{RequestEnvelope, Service};
pub use transport::{identity_for_addr, Inbound};
pub use worker::Worker;
