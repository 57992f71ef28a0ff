//! Shared vocabulary for the quorum workspace: identifiers, the event
//! protocol, error classification and the provider/tool seams.

pub mod context;
pub mod duration;
pub mod errors;
pub mod events;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod retry;
pub mod stream;
pub mod tools;
