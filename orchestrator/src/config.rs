use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> anyhow::Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(anyhow::anyhow!(
                "Invalid LOG_FORMAT '{other}'. Expected 'pretty' or 'json'"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP API binds to
    pub host: String,
    /// Port the HTTP API listens on
    pub port: u16,
    /// Wall-clock ceiling for one task
    pub task_timeout: Duration,
    /// Memory ceiling for one task
    pub max_memory_mb: u64,
    /// Whether scripts may reach the network at all
    pub allow_network: bool,
    /// Whether scripts may read outside their session directory
    pub allow_file_io: bool,
    /// Lifetime task cap per session
    pub max_tasks_per_session: usize,
    /// Idle time after which the sweep drops a session
    pub session_timeout: Duration,
    /// Root under which every session gets its own directory
    pub workdir: PathBuf,
    /// Global session cap
    pub max_sessions: usize,
    /// Recently active sessions are protected from cap eviction for this long
    pub session_eviction_grace: Duration,
    /// Period of the idle sweep. Zero disables it.
    pub session_sweep_interval: Duration,
    /// Scripts running at once across all sessions
    pub max_concurrent_executions: usize,
    pub log_format: LogFormat,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            task_timeout: Duration::from_secs(300),
            max_memory_mb: 512,
            allow_network: false,
            allow_file_io: true,
            max_tasks_per_session: 50,
            session_timeout: Duration::from_secs(3600),
            workdir: PathBuf::from("./data/aipyapp_workdir"),
            max_sessions: 100,
            session_eviction_grace: Duration::ZERO,
            session_sweep_interval: Duration::from_secs(60),
            max_concurrent_executions: 8,
            log_format: LogFormat::Pretty,
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key lookup. Missing keys fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };
        let defaults = Self::default();

        let config = Self {
            host: env.str("ORCHESTRATOR_HOST", &defaults.host),
            port: env.parse("ORCHESTRATOR_PORT", defaults.port)?,
            task_timeout: env.secs("TASK_TIMEOUT", defaults.task_timeout)?,
            max_memory_mb: env.parse("MAX_MEMORY_MB", defaults.max_memory_mb)?,
            allow_network: env.bool("ALLOW_NETWORK", defaults.allow_network)?,
            allow_file_io: env.bool("ALLOW_FILE_IO", defaults.allow_file_io)?,
            max_tasks_per_session: env
                .parse("MAX_TASKS_PER_SESSION", defaults.max_tasks_per_session)?,
            session_timeout: env.secs("SESSION_TIMEOUT", defaults.session_timeout)?,
            workdir: PathBuf::from(env.str(
                "AIPYAPP_WORKDIR",
                &defaults.workdir.to_string_lossy(),
            )),
            max_sessions: env.parse("MAX_SESSIONS", defaults.max_sessions)?,
            session_eviction_grace: env
                .secs("SESSION_EVICTION_GRACE", defaults.session_eviction_grace)?,
            session_sweep_interval: env
                .secs("SESSION_SWEEP_INTERVAL", defaults.session_sweep_interval)?,
            max_concurrent_executions: env
                .parse("MAX_CONCURRENT_EXECUTIONS", defaults.max_concurrent_executions)?,
            log_format: LogFormat::parse(&env.str("LOG_FORMAT", "pretty"))?,
        };

        config.check()?;
        Ok(config)
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.task_timeout.is_zero() {
            anyhow::bail!("TASK_TIMEOUT must be greater than zero");
        }
        if self.max_memory_mb == 0 {
            anyhow::bail!("MAX_MEMORY_MB must be greater than zero");
        }
        if self.max_sessions == 0 {
            anyhow::bail!("MAX_SESSIONS must be greater than zero");
        }
        if self.max_concurrent_executions == 0 {
            anyhow::bail!("MAX_CONCURRENT_EXECUTIONS must be greater than zero");
        }
        Ok(())
    }
}

struct Env<F> {
    lookup: F,
}

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn str(&self, key: &str, default: &str) -> String {
        (self.lookup)(key).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> anyhow::Result<T>
    where
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(key) {
            Some(val) => val
                .trim()
                .parse::<T>()
                .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
            None => Ok(default),
        }
    }

    /// Seconds, fractional allowed.
    fn secs(&self, key: &str, default: Duration) -> anyhow::Result<Duration> {
        let secs: f64 = self.parse(key, default.as_secs_f64())?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            anyhow::anyhow!(
                "Failed to parse env var {key}={secs}: must be a non-negative number of seconds in range"
            )
        })
    }

    fn bool(&self, key: &str, default: bool) -> anyhow::Result<bool> {
        let Some(val) = (self.lookup)(key) else {
            return Ok(default);
        };
        match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(anyhow::anyhow!(
                "Failed to parse env var {key}={val}: expected a boolean"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_pairs(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]).unwrap();
        assert_eq!(config.task_timeout, Duration::from_secs(300));
        assert_eq!(config.max_tasks_per_session, 50);
        assert_eq!(config.session_timeout, Duration::from_secs(3600));
        assert!(!config.allow_network);
        assert!(config.allow_file_io);
        assert_eq!(config.max_memory_mb, 512);
        assert_eq!(config.workdir, PathBuf::from("./data/aipyapp_workdir"));
        assert_eq!(config.max_sessions, 100);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("TASK_TIMEOUT", "1.5"),
            ("ALLOW_NETWORK", "TRUE"),
            ("ALLOW_FILE_IO", "0"),
            ("AIPYAPP_WORKDIR", "/tmp/work"),
            ("MAX_SESSIONS", "3"),
            ("SESSION_SWEEP_INTERVAL", "0"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();

        assert_eq!(config.task_timeout, Duration::from_millis(1500));
        assert!(config.allow_network);
        assert!(!config.allow_file_io);
        assert_eq!(config.workdir, PathBuf::from("/tmp/work"));
        assert_eq!(config.max_sessions, 3);
        assert!(config.session_sweep_interval.is_zero());
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_parse_failures_name_the_key() {
        let err = from_pairs(&[("MAX_MEMORY_MB", "lots")]).unwrap_err();
        assert!(err.to_string().contains("MAX_MEMORY_MB"));

        let err = from_pairs(&[("ALLOW_NETWORK", "maybe")]).unwrap_err();
        assert!(err.to_string().contains("ALLOW_NETWORK"));

        assert!(from_pairs(&[("TASK_TIMEOUT", "-3")]).is_err());
        assert!(from_pairs(&[("TASK_TIMEOUT", "0")]).is_err());

        let err = from_pairs(&[("SESSION_TIMEOUT", "1e30")]).unwrap_err();
        assert!(err.to_string().contains("SESSION_TIMEOUT"));
        assert!(from_pairs(&[("TASK_TIMEOUT", "inf")]).is_err());
    }
}
