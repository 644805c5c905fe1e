//! Purpose: Persistent-memory storage engine exposing block and log pool abstractions.
//! Exports: `core` (durable mapping, streaming copy, block pools, log pools, errors).
//! Role: Library backing the `pmembench` binary and downstream embedders.
//! Invariants: Pools exclusively own their mapped region; no hidden global state.
//! Invariants: Durability is explicit; flush + drain (or msync) completes before success is reported.
pub mod core;
