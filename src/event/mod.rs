//! Contains the events and handlers for monitoring topology changes.

pub mod sdam;
