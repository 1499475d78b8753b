//! Rate-limited operational notifications. Repeated alerts on the same
//! subject are dropped inside the cooldown window so a flapping balance or
//! a burst of failures does not flood subscribers.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::constants::ALERT_COOLDOWN;

#[derive(Debug, Clone)]
pub enum Alert {
    LowTradingBalance {
        currency: String,
        local: u64,
        required: u64,
    },
    SwapFailure {
        r_hash: String,
        pair_id: String,
        message: String,
    },
}

impl Alert {
    fn subject(&self) -> String {
        match self {
            Alert::LowTradingBalance { currency, .. } => format!("low-balance:{currency}"),
            Alert::SwapFailure { pair_id, .. } => format!("swap-failure:{pair_id}"),
        }
    }
}

pub struct Alerts {
    last_sent: Mutex<HashMap<String, Instant>>,
    tx: broadcast::Sender<Alert>,
    cooldown: Duration,
}

impl Alerts {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            last_sent: Mutex::new(HashMap::new()),
            tx,
            cooldown: ALERT_COOLDOWN,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Alert> {
        self.tx.subscribe()
    }

    /// Raise an alert unless one with the same subject fired recently.
    pub fn notify(&self, alert: Alert) {
        let subject = alert.subject();
        {
            let mut last_sent = self.last_sent.lock().expect("alert map poisoned");
            let now = Instant::now();
            if let Some(last) = last_sent.get(&subject)
                && now.duration_since(*last) < self.cooldown
            {
                return;
            }
            last_sent.insert(subject, now);
        }
        match &alert {
            Alert::LowTradingBalance {
                currency,
                local,
                required,
            } => {
                tracing::warn!(%currency, local, required, "low trading balance");
            }
            Alert::SwapFailure {
                r_hash,
                pair_id,
                message,
            } => {
                tracing::warn!(%r_hash, pair = %pair_id, %message, "swap failed");
            }
        }
        let _ = self.tx.send(alert);
    }
}

impl Default for Alerts {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_alerts_are_suppressed_within_cooldown() {
        let alerts = Alerts::new();
        let mut rx = alerts.subscribe();

        let alert = Alert::LowTradingBalance {
            currency: "BTC".into(),
            local: 10,
            required: 100,
        };
        alerts.notify(alert.clone());
        alerts.notify(alert);
        alerts.notify(Alert::LowTradingBalance {
            currency: "LTC".into(),
            local: 1,
            required: 2,
        });

        assert!(matches!(
            rx.try_recv(),
            Ok(Alert::LowTradingBalance { currency, .. }) if currency == "BTC"
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(Alert::LowTradingBalance { currency, .. }) if currency == "LTC"
        ));
        assert!(rx.try_recv().is_err());
    }
}
