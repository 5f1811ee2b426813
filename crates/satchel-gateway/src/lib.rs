// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The HTTP gateway: a bot-API-compatible surface over the session engine,
//! update log, dispatcher, scheduler, and webhook dispatcher.

pub mod handlers;
pub mod server;

pub use server::{build_router, start_server, GatewayState};
