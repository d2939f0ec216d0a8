//! Core engine: the latency-critical path and its cooperating tasks
//!
//! Data flow: feed -> edge -> gate -> capital guard -> dispatcher ->
//! position manager, with the opportunity tracker, persistence and the edge
//! broadcast fanning out from the same tick stream.

pub mod capital;
pub mod channels;
pub mod dispatch;
pub mod edge;
pub mod feed;
pub mod gate;
pub mod position;
pub mod rebalance;
pub mod runtime;
pub mod tracker;
