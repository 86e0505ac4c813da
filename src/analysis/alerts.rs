//! Proximity alert debouncing

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// Last spoken alert per class label
///
/// A class may alert again only once strictly more than `cooldown` has
/// passed since its last spoken alert. The table is stamped only when an
/// alert was actually spoken.
#[derive(Debug, Clone)]
pub struct AlertCooldownTable {
    cooldown: Duration,
    last_alert: HashMap<String, Instant>,
}

impl AlertCooldownTable {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_alert: HashMap::new(),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether `label` is outside its cooldown at `now`
    pub fn is_ready(&self, label: &str, now: Instant) -> bool {
        match self.last_alert.get(label) {
            None => true,
            Some(last) => now.saturating_duration_since(*last) > self.cooldown,
        }
    }

    /// Record a spoken alert
    pub fn stamp(&mut self, label: &str, now: Instant) {
        debug!("Alert cooldown started for {}", label);
        self.last_alert.insert(label.to_string(), now);
    }

    pub fn last_alert(&self, label: &str) -> Option<Instant> {
        self.last_alert.get(label).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_alert_is_ready() {
        let table = AlertCooldownTable::new(Duration::from_secs(5));
        assert!(table.is_ready("person", Instant::now()));
    }

    #[test]
    fn test_cooldown_is_strict() {
        let start = Instant::now();
        let mut table = AlertCooldownTable::new(Duration::from_secs(5));
        table.stamp("person", start);

        assert!(!table.is_ready("person", start + Duration::from_secs(4)));
        assert!(!table.is_ready("person", start + Duration::from_secs(5)));
        assert!(table.is_ready("person", start + Duration::from_millis(5001)));
    }

    #[test]
    fn test_classes_are_independent() {
        let start = Instant::now();
        let mut table = AlertCooldownTable::new(Duration::from_secs(5));
        table.stamp("person", start);

        assert!(table.is_ready("car", start));
        assert_eq!(table.last_alert("person"), Some(start));
        assert_eq!(table.last_alert("car"), None);
    }
}
