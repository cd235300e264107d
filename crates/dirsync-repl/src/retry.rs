//! Consumer retry schedules.
//!
//! A schedule is written as interval/count pairs, e.g. `"60 10 300 +"`: ten
//! retries every 60 seconds, then every 300 seconds forever. Without a
//! trailing `+` the schedule runs out and the agreement is marked dead.

use crate::error::{ReplError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// One interval/count pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryStep {
    /// Delay before each retry in this step.
    pub interval: Duration,
    /// Number of retries, `None` for unbounded.
    pub count: Option<u32>,
}

/// A parsed retry schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RetrySchedule {
    steps: Vec<RetryStep>,
}

/// Position within a schedule. Reset after a successful session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    step: usize,
    used: u32,
}

impl RetryState {
    /// Start over from the first step.
    pub fn reset(&mut self) {
        *self = RetryState::default();
    }

    /// Retries consumed in the current step.
    pub fn used(&self) -> u32 {
        self.used
    }
}

impl RetrySchedule {
    /// Parse the textual form.
    pub fn parse(raw: &str) -> Result<Self> {
        let tokens: Vec<&str> = raw.split_whitespace().collect();
        if tokens.is_empty() || tokens.len() % 2 != 0 {
            return Err(ReplError::config(format!(
                "retry schedule needs interval/count pairs: {:?}",
                raw
            )));
        }
        let pairs = tokens.len() / 2;
        let mut steps = Vec::with_capacity(pairs);
        for (i, pair) in tokens.chunks(2).enumerate() {
            let secs: u64 = pair[0]
                .parse()
                .map_err(|_| ReplError::config(format!("bad retry interval {:?}", pair[0])))?;
            if secs == 0 {
                return Err(ReplError::config("retry interval must be positive"));
            }
            let count = if pair[1] == "+" {
                if i + 1 != pairs {
                    return Err(ReplError::config("'+' is only allowed in the last pair"));
                }
                None
            } else {
                let n: u32 = pair[1]
                    .parse()
                    .map_err(|_| ReplError::config(format!("bad retry count {:?}", pair[1])))?;
                if n == 0 {
                    return Err(ReplError::config("retry count must be positive"));
                }
                Some(n)
            };
            steps.push(RetryStep {
                interval: Duration::from_secs(secs),
                count,
            });
        }
        Ok(Self { steps })
    }

    /// The steps, in order.
    pub fn steps(&self) -> &[RetryStep] {
        &self.steps
    }

    /// True when the schedule never runs out.
    pub fn is_unbounded(&self) -> bool {
        self.steps.last().is_some_and(|s| s.count.is_none())
    }

    /// Delay before the next retry, or `None` once the schedule is exhausted.
    pub fn next_delay(&self, state: &mut RetryState) -> Option<Duration> {
        loop {
            let step = self.steps.get(state.step)?;
            match step.count {
                None => return Some(step.interval),
                Some(n) if state.used < n => {
                    state.used += 1;
                    return Some(step.interval);
                }
                Some(_) => {
                    state.step += 1;
                    state.used = 0;
                }
            }
        }
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            steps: vec![
                RetryStep {
                    interval: Duration::from_secs(60),
                    count: Some(10),
                },
                RetryStep {
                    interval: Duration::from_secs(300),
                    count: None,
                },
            ],
        }
    }
}

impl fmt::Display for RetrySchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .steps
            .iter()
            .map(|s| match s.count {
                Some(n) => format!("{} {}", s.interval.as_secs(), n),
                None => format!("{} +", s.interval.as_secs()),
            })
            .collect();
        f.write_str(&parts.join(" "))
    }
}

impl FromStr for RetrySchedule {
    type Err = ReplError;

    fn from_str(s: &str) -> Result<Self> {
        RetrySchedule::parse(s)
    }
}

impl TryFrom<String> for RetrySchedule {
    type Error = ReplError;

    fn try_from(s: String) -> Result<Self> {
        RetrySchedule::parse(&s)
    }
}

impl From<RetrySchedule> for String {
    fn from(s: RetrySchedule) -> String {
        s.to_string()
    }
}
