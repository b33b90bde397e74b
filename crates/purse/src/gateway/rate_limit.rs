//! Per-mint request pacing

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use purse_core::mint_url::MintUrl;

/// Minimum spacing between requests to the same mint.
///
/// Shared by every caller that goes through the gateway; requests to
/// different mints do not delay each other.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<HashMap<MintUrl, Instant>>,
}

impl RateLimiter {
    /// Create a limiter with the given minimum spacing
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until a request to the mint is allowed
    pub async fn acquire(&self, mint_url: &MintUrl) {
        loop {
            let wait = {
                let mut last_request = self.last_request.lock();
                let now = Instant::now();
                match last_request.get(mint_url) {
                    Some(last) if now < *last + self.min_interval => {
                        Some(*last + self.min_interval - now)
                    }
                    _ => {
                        last_request.insert(mint_url.clone(), now);
                        None
                    }
                }
            };

            match wait {
                None => return,
                Some(duration) => tokio::time::sleep(duration).await,
            }
        }
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(Duration::from_millis(100))
    }
}
