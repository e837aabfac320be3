//! # Parcel Harvest
//!
//! Incremental ingestion of municipal open-data (SODA) datasets into a local
//! SQLite store, keyed by a canonical tax-lot identifier.
//!
//! Each configured source is harvested over a time window, one page at a
//! time. Progress is checkpointed per window, so an interrupted run resumes
//! at the last committed page. Rows are normalized, deduplicated in a
//! staging table, and merged into a canonical table that downstream readers
//! query.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌───────────────┐
//! │ SODA client  │──▶│  Harvester   │──▶│    SQLite     │
//! │ retry+backoff│   │ window/pages │   │ staging/canon │
//! └──────┬───────┘   └──────┬───────┘   │ watermarks    │
//!        │                  │           │ ingest_runs   │
//!        ▼                  ▼           └───────────────┘
//!  ┌────────────┐    ┌────────────┐
//!  │  Selector  │    │ Normalizer │
//!  │ date field │    │ parcel key │
//!  └────────────┘    └────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! harvest init                               # create tables
//! harvest sources                            # list sources and watermarks
//! harvest sync dob_permits --dry-run         # sample without writing
//! harvest sync all                           # incremental run
//! harvest sync pluto --since 2024-01-01 --until 2024-01-31
//! harvest diagnose dob_permits               # candidate cursor fields
//! harvest runs --limit 20
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`client`] | SODA HTTP client with retry and backoff |
//! | [`selector`] | Cursor date-field selection and diagnostics |
//! | [`window`] | Time windows and timestamp formats |
//! | [`watermark`] | Per-window checkpoint store |
//! | [`harvest`] | Run orchestration |
//! | [`identity`] | Parcel key and address normalization |
//! | [`normalize`] | Per-dataset row normalizers |
//! | [`staging`] | Staging dedup and canonical merge |
//! | [`runs`] | Ingest run log |
//! | [`db`] | Database connection and identifier checks |
//! | [`migrate`] | Schema creation |

pub mod client;
pub mod config;
pub mod db;
pub mod error;
pub mod harvest;
pub mod identity;
pub mod ingest;
pub mod migrate;
pub mod normalize;
pub mod runs;
pub mod selector;
pub mod sources;
pub mod staging;
pub mod watermark;
pub mod window;
