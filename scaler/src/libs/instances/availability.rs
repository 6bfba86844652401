//! Tracks instance types that recently failed to launch

use chrono::prelude::*;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::libs::helpers::seconds;

/// Remembers launch failures for a window of time
#[derive(Debug)]
pub struct AvailabilityTracker {
    /// How long an instance type stays unavailable after a failure
    window: chrono::Duration,
    /// When each instance type last failed to launch
    failures: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AvailabilityTracker {
    /// Create a new availability tracker
    ///
    /// # Arguments
    ///
    /// * `window` - How many seconds an instance type stays unavailable after a failure
    #[must_use]
    pub fn new(window: u64) -> Self {
        AvailabilityTracker {
            window: seconds(window),
            failures: Mutex::new(HashMap::default()),
        }
    }

    /// Record that an instance type failed to launch
    ///
    /// # Arguments
    ///
    /// * `instance` - The instance type that failed
    pub async fn failed(&self, instance: &str) {
        self.failed_at(instance, Utc::now()).await;
    }

    /// Record that an instance type failed to launch at a specific time
    ///
    /// # Arguments
    ///
    /// * `instance` - The instance type that failed
    /// * `when` - When this instance type failed
    pub async fn failed_at(&self, instance: &str, when: DateTime<Utc>) {
        self.failures.lock().await.insert(instance.to_owned(), when);
    }

    /// Record that an instance type launched successfully
    ///
    /// # Arguments
    ///
    /// * `instance` - The instance type that launched
    pub async fn succeeded(&self, instance: &str) {
        self.failures.lock().await.remove(instance);
    }

    /// Check if an instance type can be launched right now
    ///
    /// # Arguments
    ///
    /// * `instance` - The instance type to check
    pub async fn is_available(&self, instance: &str) -> bool {
        let now = Utc::now();
        let mut failures = self.failures.lock().await;
        // forget any failures that have aged out
        failures.retain(|_, when| now - *when < self.window);
        !failures.contains_key(instance)
    }
}
