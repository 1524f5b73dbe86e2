//! HTTP handlers.

pub mod callbacks;
pub mod dead_letters;
pub mod dispatch;
pub mod status;
