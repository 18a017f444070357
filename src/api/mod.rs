//! HTTP surface for the gateway.
//!
//! ## Endpoints
//!
//! - `POST /v1/messages` (and sibling LLM paths) — proxied to z.ai with
//!   model substitution and retry/failover.
//! - `GET /health`, `/stats`, `/history`, `/models`
//! - `GET/PUT/POST/DELETE /model-routing*` — routing config CRUD.
//! - `GET /traces`, `/traces/:id`, `/requests`, `/requests/search`, `/requests/:id`
//! - `GET /stats/cost`, `/stats/cost/history`, `/persistent-stats`, `/logs`
//! - `POST /control/pause`, `/control/resume`
//! - `GET /requests/stream`, `/events` (SSE)

pub mod control;
pub mod model_routing;
pub mod monitoring;
pub mod proxy;
mod routes;

pub use routes::{serve, AppState};
