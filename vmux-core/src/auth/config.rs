//! Tunables for the authentication subsystem that don't belong on the
//! top-level [`crate::config::Config`] because they're algorithm parameters,
//! not deployment parameters.

use serde::{Deserialize, Serialize};

/// Argon2id cost parameters, OWASP-recommended defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PasswordConfig {
    pub memory_cost_kib: u32,
    pub time_cost: u32,
    pub parallelism: u32,
    pub min_password_length: usize,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_cost_kib: 19456,
            time_cost: 2,
            parallelism: 1,
            min_password_length: 8,
        }
    }
}
