//! PBS TV application
//!
//! Settings, content backend bootstrap and the consent prompt shown while
//! bringing up the private tunnel.

pub mod backend;
pub mod prompt;
pub mod settings;

pub use backend::{Backend, BackendError, BackendParts, LocalServer, ProcessServer};
pub use prompt::{ConsentPrompt, TerminalPrompt};
pub use settings::{BackendMode, Settings, SettingsError};
