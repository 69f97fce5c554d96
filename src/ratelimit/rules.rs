//! Per-category rate limit rules.
//!
//! Each throttled category carries one rule: how many requests a caller may
//! make per unit of time. `Unrestricted` never has a rule.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::classifier::EndpointType;
use crate::error::{ReadgateError, Result};

/// Time unit for rate limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the duration of this time unit.
    pub fn duration(&self) -> Duration {
        match self {
            TimeUnit::Second => Duration::from_secs(1),
            TimeUnit::Minute => Duration::from_secs(60),
            TimeUnit::Hour => Duration::from_secs(3600),
            TimeUnit::Day => Duration::from_secs(86400),
        }
    }
}

/// A rate limit rule specifying the limit and time window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Number of requests allowed per unit of time
    pub requests_per_unit: u64,
    /// The time unit, which is also the window length
    pub unit: TimeUnit,
}

impl LimitRule {
    pub fn new(requests_per_unit: u64, unit: TimeUnit) -> Self {
        Self {
            requests_per_unit,
            unit,
        }
    }

    /// Window length for this rule.
    pub fn window(&self) -> Duration {
        self.unit.duration()
    }
}

/// Rules for every throttled category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryLimits {
    /// Text-to-speech, illustration, quiz and pre-generation endpoints
    #[serde(default = "default_generation_rule")]
    pub generation: LimitRule,
    /// Character and recap chat endpoints
    #[serde(default = "default_chat_rule")]
    pub chat: LimitRule,
}

impl Default for CategoryLimits {
    fn default() -> Self {
        Self {
            generation: default_generation_rule(),
            chat: default_chat_rule(),
        }
    }
}

fn default_generation_rule() -> LimitRule {
    LimitRule::new(10, TimeUnit::Minute)
}

fn default_chat_rule() -> LimitRule {
    LimitRule::new(30, TimeUnit::Minute)
}

impl CategoryLimits {
    /// The rule for a category, or `None` when the category is not throttled.
    pub fn rule_for(&self, category: EndpointType) -> Option<&LimitRule> {
        match category {
            EndpointType::Unrestricted => None,
            EndpointType::Generation => Some(&self.generation),
            EndpointType::Chat => Some(&self.chat),
        }
    }

    /// The widest window any rule uses.
    pub fn widest_window(&self) -> Duration {
        self.generation.window().max(self.chat.window())
    }

    /// Reject rules that could never admit anything.
    pub fn validate(&self) -> Result<()> {
        for (name, rule) in [("generation", &self.generation), ("chat", &self.chat)] {
            if rule.requests_per_unit == 0 {
                return Err(ReadgateError::Config(format!(
                    "limits.{}.requests_per_unit must be greater than zero",
                    name
                )));
            }
        }
        Ok(())
    }
}
