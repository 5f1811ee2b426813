// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core error taxonomy and shared types for the Satchel bridge.
//!
//! Every other crate in the workspace depends on this one; it depends on
//! nothing but serde, thiserror, and chrono.

pub mod error;
pub mod types;

pub use error::{Result, SatchelError};
pub use types::{Attachment, AttachmentKind, Direction, Message, NewMessage, Update};
