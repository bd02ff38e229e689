//! Readiness detection for supervised processes.

use regex::Regex;
use tokio::sync::watch;

use crate::error::GatewayError;

/// Matched against output lines when a server has no `ready_patterns` of its own.
pub const DEFAULT_READY_PATTERN: &str = r"(?i)\b(ready|listening|started)\b";

/// Startup progress of one launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Pending,
    Ready,
    /// The process exited before it was observed ready.
    Exited,
}

/// How a launch decides it is ready before the grace period runs out.
#[derive(Debug, Clone)]
pub enum ReadinessProbe {
    /// Ready on the first output line matching any pattern.
    Patterns(Vec<Regex>),
    /// Never signalled from output; the grace period decides.
    Delay,
}

impl ReadinessProbe {
    /// Build from a server's `ready_patterns`. `None` uses the default
    /// pattern; an empty list waits out the grace period.
    pub fn from_patterns(server_id: &str, patterns: Option<&[String]>) -> crate::Result<Self> {
        let sources: Vec<&str> = match patterns {
            None => vec![DEFAULT_READY_PATTERN],
            Some([]) => return Ok(Self::Delay),
            Some(list) => list.iter().map(String::as_str).collect(),
        };
        let compiled = sources
            .into_iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    GatewayError::Configuration(
                        server_id.to_string(),
                        format!("invalid ready pattern '{p}': {e}"),
                    )
                })
            })
            .collect::<crate::Result<Vec<_>>>()?;
        Ok(Self::Patterns(compiled))
    }

    pub fn matches(&self, line: &str) -> bool {
        match self {
            Self::Patterns(patterns) => patterns.iter().any(|re| re.is_match(line)),
            Self::Delay => false,
        }
    }

    /// Flip `state` from pending to ready if `line` matches.
    pub fn observe(&self, line: &str, state: &watch::Sender<Readiness>) {
        if !self.matches(line) {
            return;
        }
        state.send_if_modified(|current| {
            if *current == Readiness::Pending {
                *current = Readiness::Ready;
                true
            } else {
                false
            }
        });
    }
}
