//
// lib.rs
// radifox
//
// Exposes the crate's modules and re-exports the CLI entry point for both binary and library consumers.
//
// Thales Matheus Mendonça Santos - October 2026

// Pipeline stages first, then the commands built on them.
pub mod anonymize;
pub mod batch;
pub mod cli;
pub mod config;
pub mod context;
pub mod converter;
pub mod deanonymize;
pub mod dicom_access;
pub mod error;
pub mod ledger;
pub mod metadata;
pub mod models;
pub mod naming;
pub mod provenance;
pub mod session;
pub mod storage;
pub mod update;

pub use cli::{run as run_cli, Cli, Commands};
