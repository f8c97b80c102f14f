//! Mail archiver — ingests remote mailboxes, reconstructs conversation
//! topics across noisy headers, classifies messages, and extracts
//! normalized content from nested MIME bodies.

pub mod classify;
pub mod config;
pub mod error;
pub mod extract;
pub mod model;
pub mod resolve;
pub mod session;
pub mod similarity;
pub mod source;
pub mod store;
