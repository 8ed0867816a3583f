//! # Crawl Harness
//!
//! Keyword crawl orchestration and reconciliation.
//!
//! A submitted keyword becomes a crawl task in a SQLite ledger. Each task is
//! driven through two external stages, a collector and an analyzer, whose
//! outputs land in a result store on disk. Callers poll the ledger for
//! progress, and a reconciler repairs drift between the ledger and the
//! result files.
//!
//! ## Architecture
//!
//! ```text
//!  submit ──▶ ┌───────────┐    ┌──────────────┐    ┌────────────┐
//!             │ Admission │──▶ │ Orchestrator │──▶ │ collector  │
//!             │   Guard   │    │  (spawned)   │──▶ │ analyzer   │
//!             └─────┬─────┘    └──────┬───────┘    └─────┬──────┘
//!                   ▼                 ▼                  ▼
//!             ┌─────────────────────────────┐    ┌──────────────┐
//!  status ──▶ │      SQLite task ledger     │◀──▶│ Reconciler   │◀──▶ result store
//!             └─────────────────────────────┘    └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! crawl init                          # create the ledger
//! crawl submit "rust async" --wait    # run a crawl and follow it
//! crawl cleanup                       # report drift
//! crawl serve                         # start the HTTP server
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`ledger`] | Keyword and task persistence |
//! | [`results`] | Analysis artifacts and the aggregate index |
//! | [`admission`] | One in-flight task per keyword |
//! | [`runner`] | External stage processes |
//! | [`pipeline`] | Task state machine |
//! | [`status`] | Status reads and polling |
//! | [`progress`] | Poll progress output |
//! | [`reconcile`] | Drift detection and repair |
//! | [`stats`] | Task statistics |
//! | [`service`] | Operations shared by CLI and server |
//! | [`server`] | HTTP server |

pub mod admission;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod reconcile;
pub mod results;
pub mod runner;
pub mod server;
pub mod service;
pub mod stats;
pub mod status;
