//! Domain services used by the websocket route.
//!
//! ARCHITECTURE
//! ============
//! Service modules own identity verification and conversation persistence so
//! the route handler can stay focused on protocol translation and dispatch.

pub mod conversation;
pub mod memory;
pub mod token;
