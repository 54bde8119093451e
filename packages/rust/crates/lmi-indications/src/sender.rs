//! Indication sender: filter registration, subscription gating and delivery.
//!
//! ```text
//! provider: send_instmodification(old, new, "Changed")
//!      ↓
//! enabled counter > 0 ?  ── no ──→ dropped (debug log)
//!      ↓
//! (class, filter) subscribed ? ── no ──→ dropped (debug log)
//!      ↓
//! Indication::wrap → Broker::deliver_indication
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::broker::Broker;
use crate::error::{IndicationError, Result};
use crate::filters::{FilterRegistry, StaticFilter};
use crate::indication::{Indication, IndicationKind, PerceivedSeverity};
use crate::instance::Instance;

#[derive(Default)]
struct SenderState {
    init_count: usize,
    name_prefix: String,
    registry: Option<FilterRegistry>,
    enabled: usize,
    brokers: HashMap<String, Arc<dyn Broker>>,
}

impl SenderState {
    fn registry(&self) -> Result<&FilterRegistry> {
        self.registry.as_ref().ok_or(IndicationError::NotInitialized)
    }

    fn registry_mut(&mut self) -> Result<&mut FilterRegistry> {
        self.registry.as_mut().ok_or(IndicationError::NotInitialized)
    }

    fn broker_for(&self, indication_class: &str, source_class: &str) -> Option<Arc<dyn Broker>> {
        self.brokers
            .get(&indication_class.to_ascii_lowercase())
            .or_else(|| self.brokers.get(&source_class.to_ascii_lowercase()))
            .cloned()
    }
}

/// Class hierarchy check through the broker owning either class, if any.
fn class_is_a(brokers: &HashMap<String, Arc<dyn Broker>>, class_name: &str, superclass: &str) -> bool {
    if class_name.eq_ignore_ascii_case(superclass) {
        return true;
    }
    brokers
        .get(&superclass.to_ascii_lowercase())
        .or_else(|| brokers.get(&class_name.to_ascii_lowercase()))
        .is_some_and(|broker| broker.class_is_a(class_name, superclass))
}

/// Process-wide indication sender shared by all providers of one profile.
///
/// The filter registry lives between the first [`init`](Self::init) and the
/// matching last [`cleanup`](Self::cleanup). All registry, subscription and
/// delivery work is serialized by one mutex.
pub struct IndicationSender {
    host_name: String,
    namespace: String,
    state: Mutex<SenderState>,
}

impl IndicationSender {
    /// Create an uninitialized sender.
    pub fn new(host_name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            host_name: host_name.into(),
            namespace: namespace.into(),
            state: Mutex::new(SenderState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SenderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Host name reported as `SourceInstanceHost`.
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    /// Namespace indications are delivered into.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Take one reference on the sender.
    ///
    /// Returns `true` when this call created the registry.
    pub fn init(&self, name_prefix: &str) -> Result<bool> {
        let mut state = self.lock();
        state.init_count += 1;
        if state.registry.is_some() {
            if !state.name_prefix.eq_ignore_ascii_case(name_prefix) {
                tracing::warn!(
                    existing = %state.name_prefix,
                    requested = %name_prefix,
                    "indication sender already initialized with another prefix"
                );
            }
            return Ok(false);
        }
        state.name_prefix = name_prefix.to_string();
        state.registry = Some(FilterRegistry::default());
        tracing::debug!(prefix = %name_prefix, "indication sender initialized");
        Ok(true)
    }

    /// Drop one reference; the last one destroys filters and subscriptions.
    ///
    /// Returns `true` when the registry was destroyed.
    pub fn cleanup(&self) -> Result<bool> {
        let mut state = self.lock();
        if state.init_count == 0 {
            return Err(IndicationError::NotInitialized);
        }
        state.init_count -= 1;
        if state.init_count > 0 {
            return Ok(false);
        }
        state.registry = None;
        state.enabled = 0;
        state.brokers.clear();
        tracing::debug!(prefix = %state.name_prefix, "indication sender cleaned up");
        Ok(true)
    }

    /// Whether the registry currently exists.
    pub fn is_initialized(&self) -> bool {
        self.lock().registry.is_some()
    }

    /// Prefix used to build indication class names.
    pub fn name_prefix(&self) -> Option<String> {
        let state = self.lock();
        state.registry.as_ref().map(|_| state.name_prefix.clone())
    }

    /// Register static filters for `class_name`. Filters are append-only.
    pub fn add_static_filters(&self, class_name: &str, filters: &[StaticFilter]) -> Result<usize> {
        let mut state = self.lock();
        let added = state.registry_mut()?.add(class_name, filters)?;
        tracing::debug!(class_name, count = added, "static filters registered");
        Ok(added)
    }

    /// Whether `query` names a registered filter served for `class_name`.
    ///
    /// `class_name` is what the CIMOM passes to every filter callback: the
    /// indication class (or a superclass of it), or the watched job class.
    pub fn authorize_filter(&self, query: &str, class_name: &str) -> bool {
        let state = self.lock();
        let Ok(registry) = state.registry() else {
            return false;
        };
        registry
            .matching(query)
            .any(|(_, filter)| filter.serves(class_name, |c, s| class_is_a(&state.brokers, c, s)))
    }

    /// Mark the filters matching `query` as subscribed.
    pub fn activate_filter(&self, query: &str, class_name: &str) -> Result<()> {
        let mut state = self.lock();
        let SenderState {
            registry, brokers, ..
        } = &mut *state;
        let registry = registry.as_mut().ok_or(IndicationError::NotInitialized)?;
        let ids = registry.activate(query, class_name, |c, s| class_is_a(brokers, c, s))?;
        tracing::info!(class_name, filters = ?ids, "indication filter activated");
        Ok(())
    }

    /// Remove the filters matching `query` from the subscribed set.
    pub fn deactivate_filter(&self, query: &str, class_name: &str) -> Result<()> {
        let mut state = self.lock();
        let SenderState {
            registry, brokers, ..
        } = &mut *state;
        let registry = registry.as_mut().ok_or(IndicationError::NotInitialized)?;
        match registry.deactivate(query, class_name, |c, s| class_is_a(brokers, c, s)) {
            Ok(ids) => {
                tracing::info!(class_name, filters = ?ids, "indication filter deactivated");
                Ok(())
            }
            Err(error) => {
                tracing::debug!(class_name, %error, "deactivating filter that is not active");
                Err(error)
            }
        }
    }

    /// Whether `(class_name, filter_id)` is currently subscribed.
    pub fn is_subscribed(&self, class_name: &str, filter_id: &str) -> bool {
        let state = self.lock();
        state
            .registry()
            .is_ok_and(|registry| registry.is_subscribed(class_name, filter_id))
    }

    /// Number of subscribed filters.
    pub fn active_filter_count(&self) -> usize {
        let state = self.lock();
        state.registry().map_or(0, FilterRegistry::subscribed_len)
    }

    /// Number of registered filters.
    pub fn filter_count(&self) -> usize {
        let state = self.lock();
        state.registry().map_or(0, FilterRegistry::len)
    }

    /// Nested enable; returns the new counter value.
    pub fn enable_indications(&self) -> usize {
        let mut state = self.lock();
        state.enabled += 1;
        state.enabled
    }

    /// Nested disable; returns the new counter value.
    pub fn disable_indications(&self) -> usize {
        let mut state = self.lock();
        state.enabled = state.enabled.saturating_sub(1);
        state.enabled
    }

    /// Whether the enable counter is positive.
    pub fn indications_enabled(&self) -> bool {
        self.lock().enabled > 0
    }

    /// Associate a broker handle with an indication or job class name.
    pub fn register_broker(&self, class_name: &str, broker: Arc<dyn Broker>) {
        self.lock()
            .brokers
            .insert(class_name.to_ascii_lowercase(), broker);
    }

    /// Forget the broker handle for `class_name`.
    pub fn unregister_broker(&self, class_name: &str) -> bool {
        self.lock()
            .brokers
            .remove(&class_name.to_ascii_lowercase())
            .is_some()
    }

    /// Send a generic alert about `instance`.
    pub fn send_indication(
        &self,
        instance: &Instance,
        filter_id: &str,
        severity: PerceivedSeverity,
    ) -> Result<bool> {
        self.send(IndicationKind::Alert, instance, None, filter_id, severity)
    }

    /// Send an `InstCreation` indication.
    pub fn send_instcreation(&self, instance: &Instance, filter_id: &str) -> Result<bool> {
        self.send(
            IndicationKind::Creation,
            instance,
            None,
            filter_id,
            PerceivedSeverity::Information,
        )
    }

    /// Send an `InstModification` indication carrying `previous`.
    pub fn send_instmodification(
        &self,
        previous: &Instance,
        current: &Instance,
        filter_id: &str,
    ) -> Result<bool> {
        self.send(
            IndicationKind::Modification,
            current,
            Some(previous),
            filter_id,
            PerceivedSeverity::Information,
        )
    }

    /// Send an `InstDeletion` indication.
    pub fn send_instdeletion(&self, instance: &Instance, filter_id: &str) -> Result<bool> {
        self.send(
            IndicationKind::Deletion,
            instance,
            None,
            filter_id,
            PerceivedSeverity::Information,
        )
    }

    /// Gate and deliver one indication.
    ///
    /// Returns `Ok(false)` when the indication was dropped because nobody is
    /// subscribed, indications are disabled, or no broker is attached.
    pub fn send(
        &self,
        kind: IndicationKind,
        source: &Instance,
        previous: Option<&Instance>,
        filter_id: &str,
        severity: PerceivedSeverity,
    ) -> Result<bool> {
        let state = self.lock();
        let registry = state.registry()?;
        if state.enabled == 0 || !registry.is_subscribed(&source.class_name, filter_id) {
            tracing::debug!(
                class_name = %source.class_name,
                filter_id,
                enabled = state.enabled > 0,
                "indication not subscribed; dropped"
            );
            return Ok(false);
        }

        let indication_class = kind.class_name(&state.name_prefix);
        let Some(broker) = state.broker_for(&indication_class, &source.class_name) else {
            tracing::warn!(
                indication_class = %indication_class,
                class_name = %source.class_name,
                filter_id,
                "no broker attached for indication class; skipping delivery"
            );
            return Ok(false);
        };

        let indication = Indication::wrap(
            kind,
            indication_class,
            filter_id,
            &self.host_name,
            severity,
            source,
            previous,
        );
        match broker.deliver_indication(&self.namespace, &indication) {
            Ok(()) => {
                tracing::debug!(
                    indication = %indication,
                    "indication delivered"
                );
                Ok(true)
            }
            Err(error) => {
                tracing::error!(
                    indication_class = %indication.class_name,
                    class_name = %source.class_name,
                    filter_id,
                    %error,
                    "failed to deliver indication"
                );
                Err(error)
            }
        }
    }
}

impl std::fmt::Debug for IndicationSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("IndicationSender")
            .field("host_name", &self.host_name)
            .field("namespace", &self.namespace)
            .field("name_prefix", &state.name_prefix)
            .field("init_count", &state.init_count)
            .field("enabled", &state.enabled)
            .finish_non_exhaustive()
    }
}
