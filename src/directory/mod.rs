//! Shared directory service: clinic onboarding, slot availability, the
//! atomic hold-and-notify booking path, and the pull-based message outbox.

pub mod core;
pub mod http;
