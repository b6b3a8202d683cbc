//! Resource policy for a single execution.
//!
//! The limiter holds the configured ceilings. Per-task overrides are applied
//! on top and may only tighten them.

use std::time::Duration;

use crate::config::Config;
use crate::error::SandboxError;

/// Immutable constraint set for one execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub timeout: Duration,
    pub memory_mb: u64,
    pub allow_network: bool,
    pub allow_file_io: bool,
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.timeout.is_zero() {
            return Err(SandboxError::InvalidLimits(
                "timeout must be greater than zero".to_string(),
            ));
        }
        if self.memory_mb == 0 {
            return Err(SandboxError::InvalidLimits(
                "memory ceiling must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn memory_bytes(&self) -> usize {
        usize::try_from(self.memory_mb.saturating_mul(1024 * 1024)).unwrap_or(usize::MAX)
    }
}

/// Requested tightening for one task. `None` keeps the ceiling.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LimitOverrides {
    pub timeout_secs: Option<f64>,
    pub memory_mb: Option<u64>,
    pub allow_network: Option<bool>,
    pub allow_file_io: Option<bool>,
}

impl From<&shared_types::LimitOverrides> for LimitOverrides {
    fn from(wire: &shared_types::LimitOverrides) -> Self {
        Self {
            timeout_secs: wire.timeout_secs,
            memory_mb: wire.memory_mb,
            allow_network: wire.allow_network,
            allow_file_io: wire.allow_file_io,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResourceLimiter {
    ceiling: ResourceLimits,
}

impl ResourceLimiter {
    pub fn new(ceiling: ResourceLimits) -> Self {
        Self { ceiling }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(ResourceLimits {
            timeout: config.task_timeout,
            memory_mb: config.max_memory_mb,
            allow_network: config.allow_network,
            allow_file_io: config.allow_file_io,
        })
    }

    /// Resolve the constraint set for one task.
    pub fn resolve(&self, overrides: Option<&LimitOverrides>) -> Result<ResourceLimits, SandboxError> {
        let mut limits = self.ceiling;
        let Some(overrides) = overrides else {
            limits.validate()?;
            return Ok(limits);
        };

        if let Some(secs) = overrides.timeout_secs {
            if !secs.is_finite() || secs <= 0.0 {
                return Err(SandboxError::InvalidLimits(format!(
                    "timeout override must be a positive number of seconds, got {secs}"
                )));
            }
            let requested = Duration::try_from_secs_f64(secs)
                .ok()
                .filter(|requested| *requested <= self.ceiling.timeout)
                .ok_or_else(|| {
                    SandboxError::InvalidLimits(format!(
                        "timeout override {secs}s exceeds the configured {:.1}s",
                        self.ceiling.timeout.as_secs_f64()
                    ))
                })?;
            limits.timeout = requested;
        }

        if let Some(mb) = overrides.memory_mb {
            if mb == 0 || mb > self.ceiling.memory_mb {
                return Err(SandboxError::InvalidLimits(format!(
                    "memory override {mb} MB must be within 1..={} MB",
                    self.ceiling.memory_mb
                )));
            }
            limits.memory_mb = mb;
        }

        limits.allow_network =
            tighten_flag("network", self.ceiling.allow_network, overrides.allow_network)?;
        limits.allow_file_io =
            tighten_flag("file io", self.ceiling.allow_file_io, overrides.allow_file_io)?;

        limits.validate()?;
        Ok(limits)
    }
}

fn tighten_flag(name: &str, ceiling: bool, requested: Option<bool>) -> Result<bool, SandboxError> {
    match requested {
        None => Ok(ceiling),
        Some(true) if !ceiling => Err(SandboxError::InvalidLimits(format!(
            "{name} access is disabled by configuration"
        ))),
        Some(flag) => Ok(flag),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ceiling() -> ResourceLimits {
        ResourceLimits {
            timeout: Duration::from_secs(30),
            memory_mb: 256,
            allow_network: false,
            allow_file_io: true,
        }
    }

    fn limiter() -> ResourceLimiter {
        ResourceLimiter::new(ceiling())
    }

    #[test]
    fn test_no_overrides_returns_ceiling() {
        let limits = limiter().resolve(None).unwrap();
        assert_eq!(limits, ceiling());
    }

    #[test]
    fn test_tightening_is_applied() {
        let overrides = LimitOverrides {
            timeout_secs: Some(2.5),
            memory_mb: Some(64),
            allow_network: Some(false),
            allow_file_io: Some(false),
        };
        let limits = limiter().resolve(Some(&overrides)).unwrap();

        assert_eq!(limits.timeout, Duration::from_millis(2500));
        assert_eq!(limits.memory_mb, 64);
        assert!(!limits.allow_network);
        assert!(!limits.allow_file_io);
    }

    #[test]
    fn test_loosening_is_rejected() {
        let cases = [
            LimitOverrides {
                timeout_secs: Some(31.0),
                ..Default::default()
            },
            LimitOverrides {
                memory_mb: Some(512),
                ..Default::default()
            },
            LimitOverrides {
                allow_network: Some(true),
                ..Default::default()
            },
        ];

        for overrides in cases {
            let err = limiter().resolve(Some(&overrides)).unwrap_err();
            assert!(matches!(err, SandboxError::InvalidLimits(_)), "{overrides:?}");
        }
    }

    #[test]
    fn test_degenerate_values_are_rejected() {
        for secs in [0.0, -1.0, f64::NAN, f64::INFINITY, 1e30, f64::MAX] {
            let overrides = LimitOverrides {
                timeout_secs: Some(secs),
                ..Default::default()
            };
            assert!(limiter().resolve(Some(&overrides)).is_err());
        }

        let overrides = LimitOverrides {
            memory_mb: Some(0),
            ..Default::default()
        };
        assert!(limiter().resolve(Some(&overrides)).is_err());
    }

    #[test]
    fn test_keeping_an_enabled_flag_is_allowed() {
        let overrides = LimitOverrides {
            allow_file_io: Some(true),
            ..Default::default()
        };
        assert!(limiter().resolve(Some(&overrides)).unwrap().allow_file_io);
    }
}
