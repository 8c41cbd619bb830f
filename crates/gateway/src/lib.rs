//! `tess-gateway` — the HTTP surface of Tessera.
//!
//! A thin axum server over the engine: `POST /v1/chat/stream` runs a
//! turn and streams its events as SSE frames; cancel and session
//! endpoints round out the surface. All of the real behaviour lives in
//! `tess-engine`.

pub mod api;
pub mod host;
pub mod state;
