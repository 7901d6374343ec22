//! Plan execution back-end.
//!
//! ## Overview
//!
//! Drives human-supervised agent plans: an ordered list of steps runs one at a
//! time, progress is pushed over a dedicated per-run stream, approval gates park
//! the run until a human decides, and any run whose stream (or process) went
//! away can be reactivated from the first step without a terminal record.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (axum Router, ServerConfig)          │
//! │          │ <─────── │    ├─ api.rs  (route handlers, AppState)         │
//! └──────────┘ SSE / WS │    ├─ sse.rs  (RunStream → text/event-stream)    │
//!                       │    └─ ws.rs   (activity broadcast → WebSocket)   │
//!                       │         │                                        │
//!                       │         │ ExecutionEngine::start_or_resume()     │
//!                       │         v                                        │
//!                       │  engine.rs  (state machine, one task per run)    │
//!                       │    ├─ ownership.rs  (RunRegistry, RunLease)      │
//!                       │    ├─ gates.rs      (GateRegistry, waiters)      │
//!                       │    └─ executor.rs   (StepExecutor trait)         │
//!                       │         │                                        │
//!                       │         v                                        │
//!                       │  db.rs  (runs, step records, gates, activity)    │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module          | Responsibility                                        |
//! |-----------------|-------------------------------------------------------|
//! | `models`        | Shared types: `PlanStep`, `Run`, `Gate`, records      |
//! | `events`        | `ExecutionEvent` vocabulary + `StreamSender`          |
//! | `activity`      | `ActivityPublisher`: persist + broadcast audit events |
//! | `sessions`      | `SessionDirectory` trait, in-memory implementation    |
//! | `reactivation`  | Answers "can this run continue" and resumes it        |
//!
//! ## Two sources of truth, one of them authoritative
//!
//! The per-run stream is a live convenience. Records and gates in `db` are the
//! system of record; reactivation only ever reads the store.

pub mod activity;
pub mod api;
pub mod db;
pub mod engine;
pub mod events;
pub mod executor;
pub mod gates;
pub mod models;
pub mod ownership;
pub mod reactivation;
pub mod server;
pub mod sessions;
pub mod sse;
pub mod ws;
