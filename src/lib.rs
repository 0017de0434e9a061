//! Gmail account connection for a mail-ingestion backend.
//!
//! Covers the OAuth consent handshake (redirect or popup), one-shot
//! redemption of the authorization artifact, connection status, the initial
//! backfill trigger, and disconnect.

pub mod api;
pub mod config;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod guard;
pub mod handshake;
pub mod identity;
pub mod output;
pub mod status;
pub mod sync;
