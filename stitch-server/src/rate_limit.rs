//! Per-client-IP sliding-window rate limits for the engine's ingestion
//! surfaces. The engine stays correct under limiter-driven retries
//! because callback handling is idempotent on terminal transitions.

use governor::{DefaultKeyedRateLimiter, Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;

pub struct RateLimits {
    api: DefaultKeyedRateLimiter<IpAddr>,
    webhook: DefaultKeyedRateLimiter<IpAddr>,
}

impl RateLimits {
    /// `api_per_minute` guards the control API routes; `webhook_per_minute`
    /// guards the worker callback route.
    pub fn new(api_per_minute: u32, webhook_per_minute: u32) -> Self {
        Self {
            api: RateLimiter::keyed(per_minute(api_per_minute)),
            webhook: RateLimiter::keyed(per_minute(webhook_per_minute)),
        }
    }

    pub fn check_api(&self, ip: IpAddr) -> bool {
        self.api.check_key(&ip).is_ok()
    }

    pub fn check_webhook(&self, ip: IpAddr) -> bool {
        self.webhook.check_key(&ip).is_ok()
    }
}

fn per_minute(count: u32) -> Quota {
    // A zero limit would make the quota unrepresentable; clamp to 1/min.
    Quota::per_minute(NonZeroU32::new(count.max(1)).expect("clamped to >= 1"))
}
