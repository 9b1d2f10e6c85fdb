//! Presentation: embeds, control buttons and the per-guild status message.

pub mod buttons;
pub mod embeds;
pub mod status;

pub use buttons::ControlAction;
pub use status::StatusBoard;
