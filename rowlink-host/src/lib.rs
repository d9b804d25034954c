//! # rowlink-host
//!
//! Command-line host for the rowlink protocol: loads a PGM image, streams
//! it through a row-limited filtering peer and saves the filtered result.
//!
//! ## Modes
//!
//! - **Transfer**: one two-phase session for one image (default).
//! - **Listen**: save every frame a streaming peer emits (`--listen`).
//! - **Simulate**: run against an in-process identity peer (`--simulate`).

pub mod config;
pub mod endpoint;
pub mod runner;
