//! Indication delivery for OpenLMI providers.
//!
//! Keeps the registry of static filters per CIM class, mirrors which of them
//! the CIMOM has activated, and hands indications to the broker only when a
//! matching subscription exists.
//!
//! # Architecture
//!
//! ```text
//! add_static_filters(class, [(id, query)])      ← provider startup
//! activate_filter / deactivate_filter(query)    ← CIMOM subscription callbacks
//! enable_indications / disable_indications      ← CIMOM
//!      ↓
//! send_inst{creation,modification,deletion}(instance, filter_id)
//!      ↓
//! subscribed && enabled → Broker::deliver_indication
//! ```

mod broker;
mod error;
mod filters;
mod indication;
mod instance;
mod sender;
#[doc(hidden)]
pub mod test_support;

pub use broker::Broker;
pub use error::{CimStatus, IndicationError, Result};
pub use filters::StaticFilter;
pub use indication::{Indication, IndicationKind, PerceivedSeverity, properties};
pub use instance::{Instance, ObjectPath};
pub use sender::IndicationSender;
