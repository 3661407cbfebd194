//! Inventory Management Engine
//!
//! Position-and-inventory calculation core and short-sell validation path
//! for a prime-brokerage inventory management system. Exposes the
//! per-shard engine components so the `ims-engine` binary (and tests) can
//! wire them together; the REST/WebSocket edge, vendor adapters, and
//! persistence schemas this engine's output feeds are external to this
//! crate.

pub mod bulkhead;
pub mod config;
pub mod envelope;
pub mod error;
pub mod ids;
pub mod ingest;
pub mod inventory;
pub mod limits;
pub mod locate;
pub mod position;
pub mod publisher;
pub mod settlement;
pub mod shard;
pub mod snapshot;
pub mod telemetry;
pub mod validator;
