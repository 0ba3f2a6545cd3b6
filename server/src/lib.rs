//! # Session Hub
//!
//! This library provides the authoritative server of the virtual table. It
//! hosts live play sessions, decides what every participant is allowed to
//! do, and keeps every connected client's view of a session consistent.
//!
//! ## Core Responsibilities
//!
//! ### Authoritative Session State
//! Each session owns one reconciled state (participants, characters, the
//! master's sketch, notes and the shared log). Clients never change it
//! directly: they send intents, and the hub turns accepted intents into
//! sequenced events that everyone applies in the same order.
//!
//! ### Authorization
//! A single table maps every intent kind to the role or ownership it
//! requires. Rejected intents are answered to the sender only and leave no
//! trace in the session.
//!
//! ### Delivery
//! Events are delivered to their audience: most go to everyone, character
//! updates only to the master, the owner and admitted viewers, private
//! dice rolls only to the master and the roller.
//!
//! ## Architecture Design
//!
//! ### One Actor per Session
//! Every session runs in its own task and processes commands from a queue,
//! one at a time. Sessions share nothing mutable; the registry only maps
//! session ids to actor handles.
//!
//! ### Framed TCP
//! Clients speak length-prefixed bincode frames over TCP. Each connection
//! has a reader task forwarding intents to its session and a writer task
//! draining an unbounded outbound queue, so a slow client never stalls a
//! session.
//!
//! ### Resume
//! A participant whose connection drops keeps its seat for the resume
//! window. Joining again with the same user id replaces the connection
//! instead of adding a participant.
//!
//! ## Module Organization
//!
//! - `config`: server settings and per-intent propagation policy
//! - `directory`: user and character collaborators
//! - `roster`: participants and their connections
//! - `router`: authorization table, validation, audiences
//! - `dice`: the session's dice RNG
//! - `debounce`: coalescing of high-frequency updates
//! - `session`: the session core and its actor
//! - `registry`: the directory of live sessions
//! - `network`: listener, handshake and per-connection tasks
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::ServerConfig;
//! use server::directory::{InMemoryCharacterStore, OpenDirectory};
//! use server::network::Server;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::bind(
//!         ServerConfig::default(),
//!         Arc::new(OpenDirectory),
//!         Arc::new(InMemoryCharacterStore::default()),
//!     )
//!     .await?;
//!
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod debounce;
pub mod dice;
pub mod directory;
pub mod network;
pub mod registry;
pub mod roster;
pub mod router;
pub mod session;
pub mod utils;
