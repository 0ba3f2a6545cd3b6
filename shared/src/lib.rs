//! Types shared by the session hub and its clients: the session data model,
//! the wire protocol, frame codec, error taxonomy and the deterministic
//! state reconciler both sides apply events with.

pub mod codec;
pub mod dice;
pub mod error;
pub mod model;
pub mod protocol;
pub mod state;

pub use codec::{ClientCodec, CodecError, MessageCodec, ServerCodec, MAX_FRAME_LEN};
pub use dice::DiceFormula;
pub use error::SyncError;
pub use model::*;
pub use protocol::{
    ClientMessage, Credentials, EventEnvelope, Handshake, Intent, IntentKind, JoinSnapshot,
    ServerMessage, SessionEvent, PROTOCOL_VERSION,
};
pub use state::{SessionState, StateSnapshot};
