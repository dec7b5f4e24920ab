// Chat sessions: the per-session state and the turn pipeline behind the HTTP API.

pub mod handlers;
pub mod service;
pub mod session;

pub use service::{ChatService, TurnError, TurnReply, TurnRequest};
pub use session::{SessionHandle, SessionStore};
