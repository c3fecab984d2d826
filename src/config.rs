// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Haven Health Labs

//! # Runtime Configuration
//!
//! Environment variable names and defaults. Configuration is loaded once
//! at startup into an explicit [`CoreConfig`]; there is no lazy global
//! initialization.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HAVEN_DATA_DIR` | Root directory for persistent core state | `/var/lib/haven` |
//! | `HAVEN_MASTER_KEY` | Base64 256-bit master secret (KMS handle in production) | Generated, with a warning |
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |

use std::env;
use std::path::PathBuf;

use crate::storage::paths::DATA_ROOT;

/// Environment variable for the persistent data directory.
pub const DATA_DIR_ENV: &str = "HAVEN_DATA_DIR";

/// Environment variable for the base64-encoded 256-bit master secret.
///
/// In production this value comes from the KMS boundary; the core only
/// ever derives subkeys from it and never writes it to disk.
pub const MASTER_KEY_ENV: &str = "HAVEN_MASTER_KEY";

/// Environment variable for the bind address.
pub const HOST_ENV: &str = "HOST";

/// Environment variable for the bind port.
pub const PORT_ENV: &str = "PORT";

/// Environment variable selecting `json` or `pretty` log output.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "info,tower_http=debug";

/// Startup configuration resolved from the environment.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub data_dir: PathBuf,
    pub host: String,
    pub port: u16,
    /// Base64 master secret, if provided.
    pub master_key: Option<String>,
    pub json_logs: bool,
}

impl CoreConfig {
    pub fn from_env() -> Self {
        Self {
            data_dir: env::var(DATA_DIR_ENV)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DATA_ROOT)),
            host: env::var(HOST_ENV).unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var(PORT_ENV)
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            master_key: env::var(MASTER_KEY_ENV).ok().filter(|v| !v.trim().is_empty()),
            json_logs: env::var(LOG_FORMAT_ENV)
                .map(|v| v.eq_ignore_ascii_case("json"))
                .unwrap_or(false),
        }
    }
}
