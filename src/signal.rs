//! Observable process-variable signals.
//!
//! Reactive value system using `tokio::sync::watch` for multi-subscriber
//! notifications. A [`Signal`] models one control-system process variable as
//! seen by this crate: a readback or setpoint that devices update and that
//! settle-waits, monitors, and the captured-count pollers subscribe to.
//!
//! # Example
//!
//! ```rust,ignore
//! let temperature = Signal::new("lakeshore_a", 295.0).with_units("K");
//!
//! // Subscribe to changes
//! let mut rx = temperature.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("readback now {}", *rx.borrow());
//!     }
//! });
//!
//! // Update value (notifies all subscribers)
//! temperature.set(300.0)?;
//! ```

use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;

use crate::error::{AcquireError, AppResult};

/// Validator callback type.
///
/// A function that validates a candidate value and returns an error if it is
/// invalid. Used by [`Signal::with_validator`] and [`Signal::with_range`].
pub type Validator<T> = Arc<dyn Fn(&T) -> AppResult<()> + Send + Sync>;

/// Shared state for a signal that propagates to all clones.
///
/// Uses `parking_lot::RwLock` (not tokio) because metadata access is fast,
/// needs no async context, and parking_lot locks cannot be poisoned.
struct SignalSharedState<T> {
    metadata: SignalMetadata,
    validator: Option<Validator<T>>,
}

/// Descriptive metadata for a signal.
#[derive(Debug, Clone)]
pub struct SignalMetadata {
    /// Signal name, unique within the session. Appears in log events and in
    /// settle-timeout errors.
    pub name: String,
    /// Human-readable description.
    pub description: Option<String>,
    /// Physical units (e.g. "K", "ms", "frames").
    pub units: Option<String>,
    /// Read-only signals reject `set()` calls; devices still update them
    /// through the crate-internal unchecked path.
    pub read_only: bool,
}

/// A thread-safe, observable value with change notifications.
///
/// Uses `tokio::sync::watch` internally for efficient multi-subscriber
/// broadcast. Subscribers can wait for changes asynchronously without
/// polling. All clones share the same watch channel and metadata.
pub struct Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The watch channel sender (holds current value)
    sender: watch::Sender<T>,
    /// Shared metadata and validator
    shared: Arc<RwLock<SignalSharedState<T>>>,
}

impl<T: Clone + Send + Sync + 'static> std::fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shared = self.shared.read();
        f.debug_struct("Signal")
            .field("metadata", &shared.metadata)
            .field("has_validator", &shared.validator.is_some())
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(), // shares the same watch channel
            shared: self.shared.clone(),
        }
    }
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new signal with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        Self {
            sender,
            shared: Arc::new(RwLock::new(SignalSharedState {
                metadata: SignalMetadata {
                    name: name.into(),
                    description: None,
                    units: None,
                    read_only: false,
                },
                validator: None,
            })),
        }
    }

    /// Add a description to this signal.
    pub fn with_description(self, description: impl Into<String>) -> Self {
        self.shared.write().metadata.description = Some(description.into());
        self
    }

    /// Add units to this signal.
    pub fn with_units(self, units: impl Into<String>) -> Self {
        self.shared.write().metadata.units = Some(units.into());
        self
    }

    /// Mark this signal as read-only for external callers.
    pub fn read_only(self) -> Self {
        self.shared.write().metadata.read_only = true;
        self
    }

    /// Add a custom validator function.
    pub fn with_validator<F>(self, validator: F) -> Self
    where
        F: Fn(&T) -> AppResult<()> + Send + Sync + 'static,
    {
        self.shared.write().validator = Some(Arc::new(validator));
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Get the signal name.
    pub fn name(&self) -> String {
        self.shared.read().metadata.name.clone()
    }

    /// Get the metadata (returns a clone for thread safety).
    pub fn metadata(&self) -> SignalMetadata {
        self.shared.read().metadata.clone()
    }

    /// Validate a value without setting it.
    ///
    /// Useful when a hardware write should be skipped entirely if validation
    /// will fail.
    pub fn validate(&self, value: &T) -> AppResult<()> {
        let guard = self.shared.read();
        if guard.metadata.read_only {
            return Err(AcquireError::Configuration(format!(
                "signal '{}' is read-only",
                guard.metadata.name
            )));
        }
        if let Some(validator) = &guard.validator {
            validator(value)?;
        }
        Ok(())
    }

    /// Set a new value, notifying all subscribers.
    ///
    /// Fails if the signal is read-only or a validator rejects the value.
    pub fn set(&self, value: T) -> AppResult<()> {
        self.validate(&value)?;
        self.sender.send_replace(value);
        Ok(())
    }

    /// Set a value bypassing validation and the read-only flag.
    ///
    /// Device drivers use this to publish hardware readbacks into signals
    /// that external callers may not write.
    pub(crate) fn set_unchecked(&self, value: T) {
        self.sender.send_replace(value);
    }

    /// Modify the value in place under the channel lock, notifying
    /// subscribers. Read-modify-write callers (counters) need this; a
    /// `get` followed by `set_unchecked` can lose updates between clones.
    pub(crate) fn update(&self, modify: impl FnOnce(&mut T)) {
        self.sender.send_modify(modify);
    }

    /// Subscribe to value changes.
    ///
    /// Returns a receiver that can be awaited:
    /// ```rust,ignore
    /// let mut rx = signal.subscribe();
    /// while rx.changed().await.is_ok() {
    ///     let value = rx.borrow().clone();
    /// }
    /// ```
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Check if there are any active subscribers.
    pub fn has_subscribers(&self) -> bool {
        self.sender.receiver_count() > 0
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<T> Signal<T>
where
    T: Clone + Send + Sync + PartialOrd + Debug + 'static,
{
    /// Add min/max range validation.
    ///
    /// Rejects values outside `[min, max]` on `set`.
    pub fn with_range(self, min: T, max: T) -> Self {
        let min_clone = min.clone();
        let max_clone = max.clone();
        self.shared.write().validator = Some(Arc::new(move |value: &T| {
            if value < &min_clone || value > &max_clone {
                Err(AcquireError::Configuration(format!(
                    "value {:?} out of range [{:?}, {:?}]",
                    value, min_clone, max_clone
                )))
            } else {
                Ok(())
            }
        }));
        self
    }
}

#[cfg(test)]
#[allow(clippy::float_cmp)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_basic() {
        let sig = Signal::new("test", 42);
        assert_eq!(sig.get(), 42);
        assert_eq!(sig.name(), "test");

        sig.set(100).unwrap();
        assert_eq!(sig.get(), 100);
    }

    #[test]
    fn test_signal_with_metadata() {
        let sig = Signal::new("ring_current", 102.3)
            .with_description("Storage ring current")
            .with_units("mA");

        assert_eq!(sig.metadata().units.as_deref(), Some("mA"));
        assert!(sig.metadata().description.is_some());
    }

    #[test]
    fn test_signal_range_validation() {
        let sig = Signal::new("atten", 10.0).with_range(0.0, 100.0);

        assert!(sig.set(50.0).is_ok());
        assert!(sig.set(-1.0).is_err()); // Below min
        assert!(sig.set(150.0).is_err()); // Above max
    }

    #[test]
    fn test_signal_read_only() {
        let sig = Signal::new("detector_state", 0u32).read_only();

        assert!(sig.set(1).is_err());
        assert_eq!(sig.get(), 0);

        // Internal writers bypass the flag
        sig.set_unchecked(1);
        assert_eq!(sig.get(), 1);
    }

    #[tokio::test]
    async fn test_signal_subscription() {
        let sig = Signal::new("value", 0);
        let mut rx = sig.subscribe();

        // Initial value
        assert_eq!(*rx.borrow(), 0);

        // Update and check
        sig.set(42).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 42);
    }

    #[test]
    fn test_signal_clone_shares_channel() {
        let sig = Signal::new("shared", 1);
        let copy = sig.clone();

        copy.set(7).unwrap();
        assert_eq!(sig.get(), 7);
        assert_eq!(copy.name(), "shared");
    }
}
