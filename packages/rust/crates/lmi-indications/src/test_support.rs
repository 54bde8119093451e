//! Test doubles shared with dependent crates' integration tests.

use std::sync::{Mutex, PoisonError};

use crate::broker::Broker;
use crate::error::{IndicationError, Result};
use crate::indication::Indication;

/// Broker that records every delivered indication.
#[derive(Debug, Default)]
pub struct RecordingBroker {
    delivered: Mutex<Vec<Indication>>,
    fail_with: Option<String>,
}

impl RecordingBroker {
    /// Broker that accepts everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Broker that rejects every delivery with `message`.
    #[must_use]
    pub fn failing(message: &str) -> Self {
        Self {
            delivered: Mutex::new(Vec::new()),
            fail_with: Some(message.to_string()),
        }
    }

    /// Snapshot of delivered indications, in delivery order.
    pub fn delivered(&self) -> Vec<Indication> {
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Filter names of delivered indications, in delivery order.
    pub fn filter_names(&self) -> Vec<String> {
        self.delivered()
            .into_iter()
            .map(|indication| indication.filter_name)
            .collect()
    }
}

impl Broker for RecordingBroker {
    fn deliver_indication(&self, _namespace: &str, indication: &Indication) -> Result<()> {
        if let Some(message) = &self.fail_with {
            return Err(IndicationError::Delivery(message.clone()));
        }
        self.delivered
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(indication.clone());
        Ok(())
    }
}
