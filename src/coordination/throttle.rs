//! Global inter-call spacing per external endpoint class.
//!
//! Shared by every wallet pipeline in the process: callers of one class are
//! serialized so that consecutive calls are at least `spacing` apart.

use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

use crate::config::ThrottleConfig;

/// Rate-limited provider families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Rpc,
    Bridge,
    Exchange,
}

impl EndpointClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            EndpointClass::Rpc => "rpc",
            EndpointClass::Bridge => "bridge",
            EndpointClass::Exchange => "exchange",
        }
    }
}

impl std::fmt::Display for EndpointClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

struct Slot {
    spacing: Duration,
    last_call: Mutex<Option<Instant>>,
}

pub struct Throttle {
    slots: HashMap<EndpointClass, Slot>,
}

impl Throttle {
    pub fn new(config: &ThrottleConfig) -> Self {
        let mut slots = HashMap::new();
        for (class, ms) in [
            (EndpointClass::Rpc, config.rpc_spacing_ms),
            (EndpointClass::Bridge, config.bridge_spacing_ms),
            (EndpointClass::Exchange, config.exchange_spacing_ms),
        ] {
            slots.insert(
                class,
                Slot {
                    spacing: Duration::from_millis(ms),
                    last_call: Mutex::new(None),
                },
            );
        }
        Self { slots }
    }

    /// No spacing at all
    pub fn disabled() -> Self {
        Self::new(&ThrottleConfig {
            rpc_spacing_ms: 0,
            bridge_spacing_ms: 0,
            exchange_spacing_ms: 0,
        })
    }

    pub fn spacing(&self, class: EndpointClass) -> Duration {
        self.slots
            .get(&class)
            .map(|s| s.spacing)
            .unwrap_or_default()
    }

    /// Wait until a call of `class` may be issued, then claim the slot
    pub async fn acquire(&self, class: EndpointClass) {
        let Some(slot) = self.slots.get(&class) else {
            return;
        };
        if slot.spacing.is_zero() {
            return;
        }

        // Held across the sleep so waiters queue behind each other
        let mut last = slot.last_call.lock().await;
        if let Some(prev) = *last {
            let ready_at = prev + slot.spacing;
            if ready_at > Instant::now() {
                trace!(endpoint = %class, "throttling call");
                sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn consecutive_calls_are_spaced() {
        let throttle = Throttle::new(&ThrottleConfig {
            rpc_spacing_ms: 0,
            bridge_spacing_ms: 30,
            exchange_spacing_ms: 0,
        });

        let start = Instant::now();
        for _ in 0..3 {
            throttle.acquire(EndpointClass::Bridge).await;
        }
        // First call is free, the next two wait one spacing each
        assert!(start.elapsed() >= Duration::from_millis(60));
    }

    #[tokio::test]
    async fn classes_are_independent() {
        let throttle = Throttle::new(&ThrottleConfig {
            rpc_spacing_ms: 0,
            bridge_spacing_ms: 500,
            exchange_spacing_ms: 0,
        });
        throttle.acquire(EndpointClass::Bridge).await;

        let start = Instant::now();
        for _ in 0..10 {
            throttle.acquire(EndpointClass::Rpc).await;
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn shared_across_tasks() {
        let throttle = Arc::new(Throttle::new(&ThrottleConfig {
            rpc_spacing_ms: 20,
            bridge_spacing_ms: 0,
            exchange_spacing_ms: 0,
        }));

        let start = Instant::now();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let throttle = throttle.clone();
                tokio::spawn(async move { throttle.acquire(EndpointClass::Rpc).await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(60));
    }
}
