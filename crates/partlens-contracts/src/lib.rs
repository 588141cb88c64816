//! Shared contracts for the partlens pipeline: answer grammar, session
//! state, instruction text, audit events, and the file formats exchanged
//! with the crawler and export tooling.

pub mod catalog;
pub mod events;
pub mod export;
pub mod manifest;
pub mod prompts;
pub mod session;
pub mod verdict;
