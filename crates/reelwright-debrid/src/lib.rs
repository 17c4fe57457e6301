// SPDX-License-Identifier: GPL-3.0-or-later

//! Client for a Real-Debrid-style link resolution service.
//!
//! The service turns a hoster link into a short-lived direct download URL.
//! Requests are rate limited and service error codes are folded into a small
//! set of outcomes the pipeline can act on.

pub mod client;
pub mod error;
pub mod models;
pub mod throttle;

pub use client::{DebridClient, DebridClientBuilder};
pub use error::{DebridError, Result};
pub use models::{ApiErrorBody, UnrestrictedLink};
