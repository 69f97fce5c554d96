//! Admission gate tying classification, rules and the limiter together.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::error::Result;
use crate::ratelimit::{AdmissionKey, CategoryLimits, EndpointType, RequestClassifier, WindowRateLimiter};

/// Decision for one inbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The endpoint is not throttled
    Unrestricted,
    /// The caller is within its limit for this category
    Admitted { category: EndpointType },
    /// The caller is over its limit for this category
    Throttled { category: EndpointType },
}

impl Admission {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Admission::Throttled { .. })
    }
}

/// Entry point for the request-handling layer.
pub struct AdmissionGate {
    classifier: RequestClassifier,
    limiter: Arc<WindowRateLimiter>,
    limits: CategoryLimits,
}

impl AdmissionGate {
    /// Create a new gate. Every configured rule's window is registered with
    /// the limiter's retention sweep up front.
    pub fn new(limiter: Arc<WindowRateLimiter>, limits: CategoryLimits) -> Self {
        limiter.observe_window(limits.widest_window());
        Self {
            classifier: RequestClassifier::new(),
            limiter,
            limits,
        }
    }

    pub fn limiter(&self) -> &Arc<WindowRateLimiter> {
        &self.limiter
    }

    /// Classify a request and, if its category is throttled, charge it to
    /// `caller`.
    #[instrument(skip(self), level = "trace")]
    pub async fn check(&self, method: Option<&str>, path: &str, caller: &str) -> Result<Admission> {
        let category = self.classifier.classify(method, path);
        let Some(rule) = self.limits.rule_for(category) else {
            return Ok(Admission::Unrestricted);
        };

        let key = AdmissionKey::new(category, caller)?;
        let admitted = self
            .limiter
            .try_consume(&key.to_string_key(), rule.requests_per_unit, rule.window())
            .await?;

        if admitted {
            Ok(Admission::Admitted { category })
        } else {
            debug!(key = %key, "Request throttled");
            Ok(Admission::Throttled { category })
        }
    }
}
