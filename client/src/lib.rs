//! # Table Client Library
//!
//! Client side of the virtual table: it connects to a session hub, keeps a
//! local read-only projection of the session up to date, and turns user
//! actions into intents.
//!
//! ## Architecture Overview
//!
//! The client never changes its projection on its own. Every visible change
//! comes from the hub as a sequenced event, applied with the same
//! reconciler the hub uses, so all clients of a session converge on the
//! same state.
//!
//! ### Snapshot, Then Deltas
//! Joining yields a full snapshot. Events that the snapshot already covers
//! are dropped, everything later is applied in order. After a reconnect,
//! or when the hub decides the view must change (for example a player is
//! granted access to every character sheet), a fresh snapshot replaces the
//! projection wholesale.
//!
//! ### Automatic Resume
//! When the link drops the connection task retries with exponential
//! backoff and re-joins the same session with the same character. Intents
//! submitted meanwhile are rejected locally with `ConnectionLost` instead of
//! being queued.
//!
//! ## Module Organization
//!
//! - `connection`: handshake, heartbeat, reconnect, the event stream
//! - `view`: the local projection of a session
//! - `play`: typed operations (dice, characters, sketch, notes, audio, chat)
//! - `console`: command-line parsing and log rendering for the binary
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::connection::{ClientConfig, Connection, JoinTarget};
//! use client::play::PlayHandle;
//! use client::view::SessionView;
//! use shared::{Credentials, RollVisibility};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let credentials = Credentials {
//!         user_id: "alice".into(),
//!         display_name: "Alice".into(),
//!         token: String::new(),
//!     };
//!     let mut connection = Connection::connect(
//!         ClientConfig::new("127.0.0.1:7878", credentials),
//!         JoinTarget::Join { session_id: 1, character_id: Some("brom".into()) },
//!     )
//!     .await?;
//!
//!     let play = PlayHandle::new(connection.sender());
//!     play.request_dice("1d20", Some("initiative".into()), RollVisibility::Public)?;
//!
//!     let mut view = SessionView::new();
//!     while let Some(event) = connection.next_event().await {
//!         if let Some(notice) = view.handle(event) {
//!             println!("{:?}", notice);
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod console;
pub mod play;
pub mod view;
