//! Per-IP sliding-window rate limiter for the relayer submission endpoint.

use std::collections::HashMap;
use std::net::IpAddr;

use crate::constants::{RATE_LIMIT_MAX_IPS, RATE_LIMIT_REQUESTS, RATE_LIMIT_WINDOW_MS};
use crate::error::{AgentError, AgentResult};

pub struct RateLimiter {
    requests: usize,
    window_ms: u128,
    max_ips: usize,
    hits: HashMap<IpAddr, Vec<u128>>,
}

impl RateLimiter {
    pub fn new(requests: usize, window_ms: u128) -> Self {
        Self {
            requests,
            window_ms,
            max_ips: RATE_LIMIT_MAX_IPS,
            hits: HashMap::new(),
        }
    }

    pub fn from_defaults() -> Self {
        Self::new(RATE_LIMIT_REQUESTS, RATE_LIMIT_WINDOW_MS)
    }

    /// Admit or reject one request from `ip` at `now_ms`.
    pub fn check(&mut self, ip: IpAddr, now_ms: u128) -> AgentResult<()> {
        if self.hits.len() > self.max_ips {
            // Bulk eviction: drop every IP whose whole window has expired.
            let cutoff = now_ms.saturating_sub(self.window_ms);
            self.hits.retain(|_, stamps| {
                stamps.retain(|t| *t > cutoff);
                !stamps.is_empty()
            });
        }
        let cutoff = now_ms.saturating_sub(self.window_ms);
        let stamps = self.hits.entry(ip).or_default();
        stamps.retain(|t| *t > cutoff);
        if stamps.len() >= self.requests {
            return Err(AgentError::RateLimited(format!(
                "more than {} requests in {} ms",
                self.requests, self.window_ms
            )));
        }
        stamps.push(now_ms);
        Ok(())
    }

    pub fn tracked_ips(&self) -> usize {
        self.hits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn boundary_r_then_429_then_recovery() {
        let mut rl = RateLimiter::new(3, 1_000);
        let t0 = 10_000u128;
        for i in 0..3 {
            rl.check(ip(1), t0 + i).expect("within limit");
        }
        assert!(matches!(
            rl.check(ip(1), t0 + 500),
            Err(AgentError::RateLimited(_))
        ));
        // After the window passes, a fresh request succeeds.
        rl.check(ip(1), t0 + 1_101).expect("window expired");
    }

    #[test]
    fn ips_are_independent() {
        let mut rl = RateLimiter::new(1, 1_000);
        rl.check(ip(1), 1).unwrap();
        rl.check(ip(2), 2).unwrap();
        assert!(rl.check(ip(1), 3).is_err());
    }

    #[test]
    fn bulk_eviction_drops_expired_ips() {
        let mut rl = RateLimiter::new(1, 100);
        rl.max_ips = 10;
        for last in 0..=20u8 {
            let _ = rl.check(ip(last), 1_000);
        }
        assert!(rl.tracked_ips() > 10);
        // Far past the window: the next check sweeps the map.
        rl.check(ip(99), 10_000).unwrap();
        assert_eq!(rl.tracked_ips(), 1);
    }
}
