//! Boundary to the management broker (CIMOM).

use crate::error::Result;
use crate::indication::Indication;

/// Broker handle owned by the provider that instruments an indication class.
///
/// Called from any thread while the sender's lock is held, so implementations
/// must not call back into the sender.
pub trait Broker: Send + Sync {
    /// Hand an indication to the broker for delivery in `namespace`.
    fn deliver_indication(&self, namespace: &str, indication: &Indication) -> Result<()>;

    /// Whether `class_name` is `superclass` or derives from it.
    fn class_is_a(&self, class_name: &str, superclass: &str) -> bool {
        class_name.eq_ignore_ascii_case(superclass)
    }
}
