//! Configuration types for a resource instance.
//!
//! The [`Config`] struct controls where a resource keeps its stores and how
//! the engine behaves. Loading configuration from files is the host's job;
//! the engine only consumes the resolved struct.
//!
//! # Example
//! ```rust
//! use silt::Config;
//!
//! let config = Config {
//!     instance_id: "maildir.instance1".into(),
//!     ..Config::default()
//! };
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;

use crate::error::SiltError;

/// Resource instance configuration.
///
/// All fields have sensible defaults. Use struct update syntax to override
/// specific settings:
///
/// ```rust
/// use silt::Config;
///
/// let config = Config {
///     notification_capacity: 256,
///     ..Default::default()
/// };
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// Root directory under which every resource instance keeps its stores.
    ///
    /// The instance's main store lives at `<storage_root>/<instance_id>/`,
    /// the remote-ID mapping store at
    /// `<storage_root>/<instance_id>.synchronization/`.
    pub storage_root: PathBuf,

    /// Identifier of this resource instance, e.g. `"maildir.instance1"`.
    pub instance_id: String,

    /// Capacity of each subscriber's notification channel.
    ///
    /// Notifications are delivered at-most-once; when a subscriber's channel
    /// is full the event is dropped and the subscriber is expected to pull
    /// the current `maxRevision` on its next receipt.
    pub notification_capacity: usize,

    /// How often a write commit is retried after a transaction conflict
    /// before the error is surfaced.
    pub write_retry_limit: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./silt-storage"),
            instance_id: String::new(),
            notification_capacity: 64,
            write_retry_limit: 3,
        }
    }
}

impl Config {
    /// Creates a config for the given instance under the given root.
    pub fn for_instance(storage_root: impl Into<PathBuf>, instance_id: impl Into<String>) -> Self {
        Self {
            storage_root: storage_root.into(),
            instance_id: instance_id.into(),
            ..Default::default()
        }
    }

    /// Path of the instance's main store directory.
    pub fn store_path(&self) -> PathBuf {
        self.storage_root.join(&self.instance_id)
    }

    /// Path of the instance's remote-ID mapping store directory.
    pub fn synchronization_store_path(&self) -> PathBuf {
        self.storage_root
            .join(format!("{}.synchronization", self.instance_id))
    }

    /// Validates the configuration.
    ///
    /// Called automatically when a resource is created. You can also call
    /// this explicitly to check configuration up front.
    ///
    /// # Errors
    /// Returns `SiltError::Config` if:
    /// - `instance_id` is empty or contains a path separator
    /// - `notification_capacity` is 0
    pub fn validate(&self) -> Result<(), SiltError> {
        if self.instance_id.is_empty() {
            return Err(SiltError::config("instance_id must not be empty"));
        }
        if self.instance_id.contains('/') || self.instance_id.contains('\\') {
            return Err(SiltError::config(
                "instance_id must not contain path separators",
            ));
        }
        if self.notification_capacity == 0 {
            return Err(SiltError::config(
                "notification_capacity must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_needs_instance_id() {
        assert!(Config::default().validate().is_err());
    }

    #[test]
    fn test_for_instance_validates() {
        let config = Config::for_instance("/tmp/silt", "maildir.instance1");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_instance_id_with_separator_rejected() {
        let config = Config::for_instance("/tmp/silt", "../escape");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = Config {
            notification_capacity: 0,
            ..Config::for_instance("/tmp/silt", "dummy.instance1")
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_store_paths() {
        let config = Config::for_instance("/tmp/silt", "dummy.instance1");
        assert_eq!(
            config.store_path(),
            PathBuf::from("/tmp/silt/dummy.instance1")
        );
        assert_eq!(
            config.synchronization_store_path(),
            PathBuf::from("/tmp/silt/dummy.instance1.synchronization")
        );
    }
}
