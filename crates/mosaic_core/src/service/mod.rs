//! Service directory and its consumers.
//!
//! # Responsibility
//! - Let components advertise typed services with properties.
//! - Let components react as matching services appear and disappear.

pub mod directory;
pub mod entry;
pub mod subscription;
pub mod tracker;
