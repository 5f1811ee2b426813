// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration system for the Satchel bridge.
//!
//! Layered loading: compiled defaults -> `satchel.toml` (working directory,
//! then XDG config dir) -> `SATCHEL_*` environment variables.

pub mod loader;
pub mod model;

pub use loader::{load_config, load_config_from_path, load_config_from_str};
pub use model::SatchelConfig;
