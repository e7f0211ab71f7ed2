//! # data-concierge
//!
//! Backend for a "chat with your enterprise data" assistant. A question is
//! routed to a data warehouse and/or the documents users uploaded, the
//! relevant data is fetched, and a language model streams back a cited,
//! grounded answer.
//!
//! ## Architecture
//!
//! ```text
//!               ┌──────────┐
//!  question ───▶│  router  │  fast model picks sources
//!               └────┬─────┘
//!          ┌─────────┴──────────┐
//!          ▼                    ▼
//!   ┌─────────────┐     ┌──────────────┐
//!   │  SQL engine │     │ upload index │◀── blob storage (remote / local)
//!   │ gen→dry→run │     │ parsed text  │
//!   └──────┬──────┘     └──────┬───────┘
//!          └─────────┬─────────┘
//!                    ▼
//!             ┌─────────────┐
//!             │   answer    │──▶ tokens … done{metadata}
//!             └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! export OPENAI_API_KEY=...            # language model
//! export GOOGLE_APPLICATION_CREDENTIALS=./key.json   # warehouse (optional)
//! dcx serve --config ./config/dcx.toml
//! curl -N -X POST localhost:8000/query -H 'content-type: application/json' \
//!      -d '{"question": "What is our current ARR?"}'
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and the stream event model |
//! | [`extract`] | Document parsing (Excel, PDF, Word, CSV) |
//! | [`blob_store`] | Remote (S3-compatible) and local file storage |
//! | [`uploads`] | Shared upload index |
//! | [`llm`] | Language model abstraction |
//! | [`gcp_auth`] | Refreshing Google Cloud access tokens |
//! | [`warehouse`] | Warehouse access, schema, fallback data |
//! | [`router`] | Stage 1: source routing |
//! | [`sql`] | Stage 2: SQL generation and validation |
//! | [`answer`] | Stage 3: streamed grounded answers |
//! | [`pipeline`] | The three stages wired together |
//! | [`app`] | Startup phase and application context |
//! | [`status`] | Dependency capability report |
//! | [`server`] | HTTP server |

pub mod answer;
pub mod app;
pub mod blob_store;
pub mod config;
pub mod extract;
pub mod gcp_auth;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod router;
pub mod server;
pub mod sql;
pub mod status;
pub mod uploads;
pub mod warehouse;
