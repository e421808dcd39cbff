//! DareMeX chat client core
//!
//! Optimistic message state, inbox projection and a realtime change feed on
//! top of the hosted DareMeX backend.

pub mod api;
pub mod auth;
pub mod chat;
pub mod config;
pub mod models;
pub mod realtime;
