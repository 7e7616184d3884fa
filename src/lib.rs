//! # Avivo
//!
//! Grounded question answering over uploaded documents, plus cached image
//! descriptions, backed by local models served by Ollama.
//!
//! ## Architecture
//!
//! ```text
//! upload ─▶ extract ─▶ chunk ─▶ embed ─▶ ┌──────────────┐ ─▶ persist
//!                                         │ Vector Index │
//! question ─▶ cache? ─▶ embed ─▶ search ─▶└──────────────┘
//!                 │                  │
//!                 │                  ▼
//!                 │            synthesize (LLM) ─▶ cache ─▶ answer
//!                 ▼
//!               answer
//!
//! image ─▶ cache? ─▶ describe (vision model) ─▶ cache ─▶ description
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy and pipeline stages |
//! | [`logging`] | `tracing` subscriber setup |
//! | [`models`] | Core data types |
//! | [`extract`] | Plain-text extraction per format tag |
//! | [`chunk`] | Overlapping, boundary-aware chunking |
//! | [`backend`] | HTTP plumbing shared by model backends |
//! | [`embedding`] | Embedding backends and retry policy |
//! | [`generation`] | Text generation backend |
//! | [`index`] | In-memory vector index |
//! | [`persist`] | Index save/load |
//! | [`ingest`] | Ingestion pipeline |
//! | [`retrieve`] | Question → scored passages |
//! | [`synth`] | Grounded answer synthesis |
//! | [`cache`] | TTL cache for answers and descriptions |
//! | [`query`] | Query pipeline |
//! | [`vision`] | Image description pipeline |
//! | [`service`] | Component wiring |
//! | [`server`] | REST server |

pub mod backend;
pub mod cache;
pub mod chunk;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod generation;
pub mod index;
pub mod ingest;
pub mod logging;
pub mod models;
pub mod persist;
pub mod query;
pub mod retrieve;
pub mod server;
pub mod service;
pub mod synth;
pub mod vision;
