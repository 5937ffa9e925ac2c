// Copyright 2025. Strand Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Exponential-backoff retry policy for transfers.

use core::time::Duration;

use strand::Error;

/// Retry policy: `delay(n) = min(base * multiplier^(n-1), max)`, with an
/// optional ±25 % jitter.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub retryable_status_codes: Vec<u16>,
    /// Substrings matched against transfer error messages.
    pub retryable_exceptions: Vec<String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
            retryable_status_codes: vec![408, 429, 500, 502, 503, 504],
            retryable_exceptions: vec![
                "timeout".into(),
                "timed out".into(),
                "connection refused".into(),
                "connection reset".into(),
                "could not resolve".into(),
                "temporarily unavailable".into(),
            ],
        }
    }
}

impl RetryConfig {
    /// Backoff for the given 1-based attempt number.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let scaled = self.base_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent as i32);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        let jittered = if self.jitter {
            // uniform in [0.75, 1.25]
            capped * (0.75 + fastrand::f64() * 0.5)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.max(0.0))
    }

    pub fn retryable_status(&self, status: u16) -> bool {
        self.retryable_status_codes.contains(&status)
    }

    /// A transfer error is retryable when its message contains any of the
    /// configured substrings.
    pub fn retryable_error(&self, error: &Error) -> bool {
        let message = error.to_string().to_ascii_lowercase();
        self.retryable_exceptions
            .iter()
            .any(|needle| message.contains(&needle.to_ascii_lowercase()))
    }
}
