// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core domain layer for the tgbot remote terminal controller
//!
//! Durable stores (tab registry, user state, whitelist), the auth manager,
//! the command policy, the prompt-rule engine, output diffing/chunking, the
//! edit-session manager, and the audit log. Everything here is independent of
//! the chat transport; the service crate wires these pieces to inbound
//! updates.

pub mod audit;
pub mod auth;
pub mod config;
pub mod edit;
pub mod error;
pub mod output;
pub mod policy;
pub mod registry;
pub mod rules;
pub mod state;

pub use config::AppConfig;
pub use error::{Error, Result};
