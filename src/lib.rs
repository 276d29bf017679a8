//! Recover a soft-deleted storage bucket onto its name without losing the
//! contents of a live bucket that currently holds that name.
//!
//! - [`services::storage_client`]: typed HTTP client for the storage service
//! - [`services::recovery_service`]: the phased recovery run
//! - [`services::credentials`]: bearer-token resolution
//! - [`models`]: descriptors and the end-of-run report

pub mod config;
pub mod errors;
pub mod models;
pub mod services;
