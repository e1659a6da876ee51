//! Tool spec parsing and retry/timeout machinery.
//!
//! A cell's `tool` field is one of four shapes:
//!
//! - `tool_name` for a registered tool,
//! - `python:module.path.func` for a dynamic Python import,
//! - `sql:path/to/query.sql` for a SQL file executed by the SQL tool,
//! - `shell:path/to/script.sh` for a subprocess with env-var inputs.

use std::time::Duration;

use crate::cascade::{Backoff, RetryConfig};

use super::registry::ToolError;

/// Parsed form of a `tool` spec string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ToolTarget {
    Registered(String),
    Python { module: String, function: String },
    Sql { path: String },
    Shell { path: String },
}

/// Parse a tool spec into its target.
pub fn parse_tool_target(spec: &str) -> Result<ToolTarget, ToolError> {
    if let Some(rest) = spec.strip_prefix("python:") {
        let Some((module, function)) = rest.rsplit_once('.') else {
            return Err(ToolError::InvalidArgs {
                name: spec.to_string(),
                message: "expected 'python:module.path.function'".to_string(),
            });
        };
        return Ok(ToolTarget::Python {
            module: module.to_string(),
            function: function.to_string(),
        });
    }
    if let Some(path) = spec.strip_prefix("sql:") {
        return Ok(ToolTarget::Sql {
            path: path.to_string(),
        });
    }
    if let Some(path) = spec.strip_prefix("shell:") {
        return Ok(ToolTarget::Shell {
            path: path.to_string(),
        });
    }
    Ok(ToolTarget::Registered(spec.to_string()))
}

/// Parse a timeout like `30s`, `5m`, `1.5h` into a duration.
pub fn parse_timeout(timeout: &str) -> Result<Duration, ToolError> {
    let trimmed = timeout.trim();
    let Some(unit) = trimmed.chars().last() else {
        return Err(bad_timeout(timeout));
    };
    if !unit.is_ascii_alphabetic() {
        return Err(bad_timeout(timeout));
    }
    let value: f64 = trimmed[..trimmed.len() - 1]
        .parse()
        .map_err(|_| bad_timeout(timeout))?;
    if value < 0.0 {
        return Err(bad_timeout(timeout));
    }
    let seconds = match unit {
        's' => value,
        'm' => value * 60.0,
        'h' => value * 3600.0,
        _ => return Err(bad_timeout(timeout)),
    };
    Ok(Duration::from_secs_f64(seconds))
}

fn bad_timeout(timeout: &str) -> ToolError {
    ToolError::InvalidArgs {
        name: "timeout".to_string(),
        message: format!("invalid timeout '{timeout}', use '30s', '5m', or '1h'"),
    }
}

/// Backoff delay before retry attempt `attempt` (zero-based, after the
/// first failure).
#[must_use]
pub fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let base = retry.backoff_base_seconds.max(0.0);
    let seconds = match retry.backoff {
        Backoff::None => return Duration::ZERO,
        Backoff::Linear => base * f64::from(attempt + 1),
        Backoff::Exponential => base * 2f64.powi(attempt as i32),
    };
    Duration::from_secs_f64(seconds)
}

/// Run an async operation with retry and optional per-attempt timeout.
///
/// `op` is re-invoked up to `max_attempts` times; the last error wins.
pub async fn execute_with_retry<F, Fut>(
    tool_name: &str,
    retry: Option<&RetryConfig>,
    timeout: Option<Duration>,
    op: F,
) -> Result<serde_json::Value, ToolError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<serde_json::Value, ToolError>>,
{
    let default_retry = RetryConfig::default();
    let retry = retry.unwrap_or(&default_retry);
    let max_attempts = retry.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..max_attempts {
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, op()).await {
                Ok(inner) => inner,
                Err(_) => Err(ToolError::Timeout {
                    name: tool_name.to_string(),
                    seconds: limit.as_secs_f64(),
                }),
            },
            None => op().await,
        };
        match result {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_error = Some(err);
                if attempt + 1 < max_attempts {
                    let delay = backoff_delay(retry, attempt);
                    if !delay.is_zero() {
                        tracing::debug!(
                            target: "rvbbit::tools",
                            tool = tool_name,
                            attempt = attempt + 1,
                            delay_s = delay.as_secs_f64(),
                            "retrying after backoff"
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ToolError::Execution {
        name: tool_name.to_string(),
        message: "no attempts executed".to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_parse() {
        assert_eq!(
            parse_tool_target("my_tool").unwrap(),
            ToolTarget::Registered("my_tool".into())
        );
        assert_eq!(
            parse_tool_target("python:pkg.mod.load").unwrap(),
            ToolTarget::Python {
                module: "pkg.mod".into(),
                function: "load".into()
            }
        );
        assert_eq!(
            parse_tool_target("sql:queries/report.sql").unwrap(),
            ToolTarget::Sql {
                path: "queries/report.sql".into()
            }
        );
        assert_eq!(
            parse_tool_target("shell:bin/sync.sh").unwrap(),
            ToolTarget::Shell {
                path: "bin/sync.sh".into()
            }
        );
        assert!(parse_tool_target("python:nodots").is_err());
    }

    #[test]
    fn timeouts_parse() {
        assert_eq!(parse_timeout("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_timeout("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_timeout("1.5h").unwrap(), Duration::from_secs(5400));
        assert!(parse_timeout("10x").is_err());
        assert!(parse_timeout("").is_err());
    }

    #[test]
    fn backoff_shapes() {
        let linear = RetryConfig {
            max_attempts: 3,
            backoff: Backoff::Linear,
            backoff_base_seconds: 2.0,
        };
        assert_eq!(backoff_delay(&linear, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(&linear, 1), Duration::from_secs(4));

        let exponential = RetryConfig {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            backoff_base_seconds: 1.0,
        };
        assert_eq!(backoff_delay(&exponential, 2), Duration::from_secs(4));

        let none = RetryConfig::default();
        assert_eq!(backoff_delay(&none, 5), Duration::ZERO);
    }

    #[tokio::test]
    async fn retry_returns_last_error_after_exhaustion() {
        let retry = RetryConfig {
            max_attempts: 2,
            backoff: Backoff::None,
            backoff_base_seconds: 0.0,
        };
        let result = execute_with_retry("t", Some(&retry), None, || async {
            Err::<serde_json::Value, _>(ToolError::Execution {
                name: "t".into(),
                message: "boom".into(),
            })
        })
        .await;
        assert!(matches!(result, Err(ToolError::Execution { .. })));
    }
}
