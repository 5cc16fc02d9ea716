use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::models::{CoreError, CoreErrorKind, ExecutionClass};

/// Scheduling, retry and liveness limits. Every value is supplied from outside;
/// the defaults only exist so a partial config file still loads.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DispatchConfig {
    pub max_concurrent: usize,
    pub max_concurrent_per_class: ClassCaps,
    pub max_retries: u32,
    pub task_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_grace_multiplier: u32,
    pub enrollment_token_ttl_secs: u64,
    pub tick_interval_ms: u64,
    pub terminal_retention_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 8,
            max_concurrent_per_class: ClassCaps::default(),
            max_retries: 3,
            task_timeout_ms: 300_000,
            heartbeat_interval_ms: 15_000,
            heartbeat_grace_multiplier: 3,
            enrollment_token_ttl_secs: 900,
            tick_interval_ms: 250,
            terminal_retention_secs: 3_600,
        }
    }
}

/// Per-class running caps. A class left unset is bounded by the global cap alone.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassCaps {
    pub local: Option<usize>,
    pub blue: Option<usize>,
    pub red: Option<usize>,
    pub purple: Option<usize>,
}

impl Default for ClassCaps {
    fn default() -> Self {
        Self {
            local: Some(8),
            blue: Some(4),
            red: Some(2),
            purple: Some(2),
        }
    }
}

impl ClassCaps {
    pub fn get(&self, class: ExecutionClass) -> Option<usize> {
        match class {
            ExecutionClass::Local => self.local,
            ExecutionClass::Blue => self.blue,
            ExecutionClass::Red => self.red,
            ExecutionClass::Purple => self.purple,
        }
    }

    pub fn set(&mut self, class: ExecutionClass, cap: Option<usize>) {
        match class {
            ExecutionClass::Local => self.local = cap,
            ExecutionClass::Blue => self.blue = cap,
            ExecutionClass::Red => self.red = cap,
            ExecutionClass::Purple => self.purple = cap,
        }
    }
}

impl DispatchConfig {
    pub fn class_cap(&self, class: ExecutionClass) -> usize {
        self.max_concurrent_per_class
            .get(class)
            .unwrap_or(self.max_concurrent)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_grace(&self) -> Duration {
        self.heartbeat_interval()
            .saturating_mul(self.heartbeat_grace_multiplier)
    }

    pub fn enrollment_token_ttl(&self) -> Duration {
        Duration::from_secs(self.enrollment_token_ttl_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_secs)
    }

    pub fn validate(&self) -> Result<(), CoreError> {
        let checks = [
            (self.max_concurrent == 0, "max_concurrent must be greater than zero"),
            (self.max_retries == 0, "max_retries must be at least one"),
            (self.task_timeout_ms == 0, "task_timeout_ms must be greater than zero"),
            (
                self.heartbeat_interval_ms == 0,
                "heartbeat_interval_ms must be greater than zero",
            ),
            (
                self.heartbeat_grace_multiplier == 0,
                "heartbeat_grace_multiplier must be at least one",
            ),
            (
                self.enrollment_token_ttl_secs == 0,
                "enrollment_token_ttl_secs must be greater than zero",
            ),
            (self.tick_interval_ms == 0, "tick_interval_ms must be greater than zero"),
            (
                Instant::now()
                    .checked_add(self.enrollment_token_ttl())
                    .is_none(),
                "enrollment_token_ttl_secs is too large",
            ),
            (
                self.heartbeat_interval()
                    .checked_mul(self.heartbeat_grace_multiplier)
                    .is_none_or(|grace| Instant::now().checked_add(grace).is_none()),
                "heartbeat grace period is too large",
            ),
        ];

        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, message)) => Err(CoreError::new(CoreErrorKind::InvalidInput, *message)),
            None => Ok(()),
        }
    }
}
