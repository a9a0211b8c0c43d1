//! Piper Server - Chat API with real-time event fan-out.
//!
//! This crate provides the Piper chat backend:
//! - Signed bearer tokens and a session directory over pluggable stores
//! - Users, channels and messages with per-role authorization
//! - A notifier that pushes every change to connected WebSocket clients
//! - Password reset with single-use signed codes
//!
//! # Architecture
//!
//! Request handlers in [`routes`] authenticate through [`session`], act on
//! the stores in [`models`] and queue an [`types::Event`] on the
//! [`broadcast::Notifier`]. The notifier's broadcast loop serializes each
//! event once and writes it to every registered [`connection`].

pub mod broadcast;
pub mod config;
pub mod connection;
pub mod error;
pub mod mail;
pub mod models;
pub mod routes;
pub mod session;
pub mod token;
pub mod types;
