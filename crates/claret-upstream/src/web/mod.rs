//! The scraped web interface: conversation CRUD, completion streaming,
//! session lifecycle, and the transcript adaptation that flattens a messages
//! request into a single prompt.

pub mod client;
pub mod session;
pub mod transcript;
