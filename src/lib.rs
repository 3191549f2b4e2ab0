//! The relyd library.
//!
//! This crate contains all the moving parts of relyd. The application
//! itself, via `main.rs`, is only a very tiny frontend.
//!
//! The heart of it all is the shared, versioned engine state in [`state`].
//! It is changed by trust anchor validation in [`validation`] and by the
//! administrative operations in [`admin`]. Its route origins are served to
//! routers through the RTR server in [`rtr`] and used to validate the
//! route announcements observed in the dumps of [`dump`] in [`validity`].

pub use self::config::Config;
pub use self::error::{ExitError, Failed};
pub use self::operation::Operation;

pub mod admin;
pub mod collector;
pub mod config;
pub mod dump;
pub mod engine;
pub mod error;
pub mod exceptions;
pub mod log;
pub mod operation;
pub mod origins;
pub mod process;
pub mod rtr;
pub mod state;
pub mod store;
pub mod tals;
pub mod validation;
pub mod validity;
