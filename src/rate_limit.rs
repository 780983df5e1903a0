/// Rate Limiting System
use crate::{
    config::RateLimitConfig,
    error::{GateError, GateResult},
};
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    DefaultKeyedRateLimiter, Quota, RateLimiter as GovernorLimiter,
};
use std::{num::NonZeroU32, sync::Arc, time::Duration};

/// Routes that authenticate by shared secret and are called by the SMS
/// gateway, so they never draw from the anonymous client budget
const EXEMPT_PATHS: &[&str] = &["/webhooks/sms/incoming"];

fn non_zero(value: u32, fallback: NonZeroU32) -> NonZeroU32 {
    NonZeroU32::new(value).unwrap_or(fallback)
}

/// Global request limiter
#[derive(Clone)]
pub struct RateLimiter {
    enabled: bool,
    authenticated: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
    unauthenticated: Arc<GovernorLimiter<NotKeyed, InMemoryState, DefaultClock>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let auth_rps = non_zero(config.authenticated_rps, NonZeroU32::MIN);
        let unauth_rps = non_zero(config.unauthenticated_rps, NonZeroU32::MIN);

        Self {
            enabled: config.enabled,
            authenticated: Arc::new(GovernorLimiter::direct(Quota::per_second(auth_rps))),
            unauthenticated: Arc::new(GovernorLimiter::direct(Quota::per_second(unauth_rps))),
        }
    }

    /// Check rate limit for a request carrying credentials
    pub fn check_authenticated(&self) -> GateResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.authenticated.check().map_err(|_| GateError::RateLimited {
            retry_after: Duration::from_secs(1),
        })
    }

    /// Check rate limit for an anonymous request
    pub fn check_unauthenticated(&self) -> GateResult<()> {
        if !self.enabled {
            return Ok(());
        }
        self.unauthenticated.check().map_err(|_| GateError::RateLimited {
            retry_after: Duration::from_secs(1),
        })
    }
}

/// Per-key limiter for sensitive operations such as SMS resends
pub struct KeyedLimiter {
    limiter: DefaultKeyedRateLimiter<String>,
}

impl KeyedLimiter {
    /// Allow `per_window` events per key in each `window`
    pub fn new(per_window: u32, window: Duration) -> Self {
        let burst = non_zero(per_window, NonZeroU32::MIN);
        let quota = Quota::with_period(window / burst.get())
            .unwrap_or_else(|| Quota::per_minute(burst))
            .allow_burst(burst);

        Self {
            limiter: GovernorLimiter::keyed(quota),
        }
    }

    pub fn check(&self, key: &str) -> GateResult<()> {
        self.limiter.check_key(&key.to_string()).map_err(|not_until| {
            let retry_after = not_until.wait_time_from(DefaultClock::default().now());
            tracing::warn!("Rate limit exceeded for {}", key);
            GateError::RateLimited { retry_after }
        })
    }

    /// Drop state for keys that have fully replenished
    pub fn retain_recent(&self) {
        self.limiter.retain_recent();
    }
}

/// Rate limiting middleware
pub async fn rate_limit_middleware(
    State(ctx): State<crate::context::AppContext>,
    request: Request,
    next: Next,
) -> Response {
    if EXEMPT_PATHS.contains(&request.uri().path()) {
        return next.run(request).await;
    }

    let has_auth_header = request.headers().get("authorization").is_some();

    let result = if has_auth_header {
        ctx.rate_limiter.check_authenticated()
    } else {
        ctx.rate_limiter.check_unauthenticated()
    };

    match result {
        Ok(()) => next.run(request).await,
        Err(e) => e.into_response(),
    }
}
