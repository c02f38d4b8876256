//! Domain models shared by the room core and the upload pipeline.
//!
//! These are handed in by the surrounding application and are read-only here.

pub mod recording;
pub mod room;

pub use recording::*;
pub use room::*;
