//! Cluster lifecycle orchestration.
//!
//! ## Overview
//!
//! Each tenant project owns at most one cluster record. Callers create the
//! record, start it (provisioning runs in the background), ask for live
//! status, terminate it and finally delete the record. Every mutation goes
//! through the state machine in `lifecycle` and a version-checked store
//! write, so racing requests end with one winner.
//!
//! ## Module Map
//!
//! ```text
//! ┌──────────┐   HTTP   ┌──────────────────────────────────────────────────┐
//! │  Client  │ ───────> │  server.rs  (router, state wiring, shutdown)     │
//! │          │ <─────── │    └─ api.rs   (handlers, ApiError, AppState)    │
//! └──────────┘ WebSocket│         │      auth.rs (bearer -> Principal)     │
//!       ^               │         v                                        │
//!       │               │  service.rs  (ClusterService: validate + route)  │
//!       │               │     │                  │                         │
//!       │               │     │ start/terminate  │ status                  │
//!       │               │     v                  v                         │
//!       │               │  dispatcher.rs      reconciler.rs                │
//!       │               │  (background tasks) (live merge, degraded)       │
//!       │               │     │                  │                         │
//!       │               │     └──── provider.rs (ProviderAdapter) ─────┐   │
//!       │               │           simulated.rs / http_provider.rs    │   │
//!       │               │                                              │   │
//!       └── ws.rs <──── notifier.rs <── dispatcher completion          │   │
//!                       └──────────────────────────────────────────────────┘
//! ```
//!
//! ## Supporting Modules
//!
//! | Module      | Responsibility                                          |
//! |-------------|---------------------------------------------------------|
//! | `lifecycle` | Legal transitions and per-operation guards              |
//! | `store`     | `ClusterStore` trait, `MemoryStore`                     |
//! | `db`        | `SqliteStore` via `DbHandle` (`Arc<Mutex<_>>` + blocking) |
//! | `notifier`  | `Notifier` trait: broadcast, webhook, fan-out           |
//! | `ws`        | `WsMessage` + `/ws` subscription loop                   |

pub mod api;
pub mod auth;
pub mod db;
pub mod dispatcher;
pub mod http_provider;
pub mod lifecycle;
pub mod notifier;
pub mod provider;
pub mod reconciler;
pub mod server;
pub mod service;
pub mod simulated;
pub mod store;
pub mod ws;
