//! Static filter registry and the subscribed subset.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::{IndicationError, Result};

/// A pre-registered query a provider is prepared to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticFilter {
    /// Filter identifier, unique per class (e.g. `Changed`).
    pub id: String,
    /// WQL/CQL query text.
    pub query: String,
}

impl StaticFilter {
    /// Create a filter.
    pub fn new(id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            query: query.into(),
        }
    }
}

/// Case-insensitive (class, filter id) key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) struct FilterKey {
    class: String,
    id: String,
}

impl FilterKey {
    pub(crate) fn new(class_name: &str, filter_id: &str) -> Self {
        Self {
            class: class_name.to_ascii_lowercase(),
            id: filter_id.to_ascii_lowercase(),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RegisteredFilter {
    pub(crate) class_name: String,
    pub(crate) id: String,
    indication_class: Option<String>,
    normalized_query: String,
}

impl RegisteredFilter {
    /// Whether a CIMOM callback naming `class_name` concerns this filter.
    ///
    /// Accepted: the indication class in the query's `FROM` clause or one of
    /// its superclasses, and the watched job class or one of its superclasses.
    pub(crate) fn serves(&self, class_name: &str, is_a: impl Fn(&str, &str) -> bool) -> bool {
        self.indication_class
            .as_deref()
            .is_some_and(|indication_class| is_a(indication_class, class_name))
            || is_a(&self.class_name, class_name)
    }
}

/// Class named after `FROM` in a WQL/CQL query.
fn from_class(query: &str) -> Option<String> {
    let mut tokens = query.split_whitespace();
    tokens
        .by_ref()
        .find(|token| token.eq_ignore_ascii_case("from"))?;
    tokens.next().map(str::to_string)
}

/// Queries match case-insensitively with whitespace runs collapsed.
pub(crate) fn normalize_query(query: &str) -> String {
    query
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_ascii_lowercase()
}

#[derive(Debug, Default)]
pub(crate) struct FilterRegistry {
    filters: BTreeMap<FilterKey, RegisteredFilter>,
    subscribed: BTreeSet<FilterKey>,
}

impl FilterRegistry {
    /// Register all `filters` for `class_name`, or none of them.
    pub(crate) fn add(&mut self, class_name: &str, filters: &[StaticFilter]) -> Result<usize> {
        let mut batch = BTreeSet::new();
        for filter in filters {
            let key = FilterKey::new(class_name, &filter.id);
            if self.filters.contains_key(&key) || !batch.insert(key) {
                return Err(IndicationError::AlreadyExists {
                    class_name: class_name.to_string(),
                    filter_id: filter.id.clone(),
                });
            }
        }

        for filter in filters {
            self.filters.insert(
                FilterKey::new(class_name, &filter.id),
                RegisteredFilter {
                    class_name: class_name.to_string(),
                    id: filter.id.clone(),
                    indication_class: from_class(&filter.query),
                    normalized_query: normalize_query(&filter.query),
                },
            );
        }
        Ok(filters.len())
    }

    pub(crate) fn matching<'a>(
        &'a self,
        query: &str,
    ) -> impl Iterator<Item = (&'a FilterKey, &'a RegisteredFilter)> + 'a {
        let normalized = normalize_query(query);
        self.filters
            .iter()
            .filter(move |(_, filter)| filter.normalized_query == normalized)
    }

    pub(crate) fn activate(
        &mut self,
        query: &str,
        class_name: &str,
        is_a: impl Fn(&str, &str) -> bool,
    ) -> Result<Vec<String>> {
        let keys: Vec<(FilterKey, String)> = self
            .matching(query)
            .filter(|(_, filter)| filter.serves(class_name, &is_a))
            .map(|(key, filter)| (key.clone(), filter.id.clone()))
            .collect();
        if keys.is_empty() {
            return Err(IndicationError::FilterNotFound {
                class_name: class_name.to_string(),
                query: query.to_string(),
            });
        }
        Ok(keys
            .into_iter()
            .map(|(key, id)| {
                self.subscribed.insert(key);
                id
            })
            .collect())
    }

    pub(crate) fn deactivate(
        &mut self,
        query: &str,
        class_name: &str,
        is_a: impl Fn(&str, &str) -> bool,
    ) -> Result<Vec<String>> {
        let keys: Vec<(FilterKey, String)> = self
            .matching(query)
            .filter(|(key, filter)| {
                self.subscribed.contains(*key) && filter.serves(class_name, &is_a)
            })
            .map(|(key, filter)| (key.clone(), filter.id.clone()))
            .collect();
        if keys.is_empty() {
            return Err(IndicationError::FilterNotFound {
                class_name: class_name.to_string(),
                query: query.to_string(),
            });
        }
        Ok(keys
            .into_iter()
            .map(|(key, id)| {
                self.subscribed.remove(&key);
                id
            })
            .collect())
    }

    pub(crate) fn is_subscribed(&self, class_name: &str, filter_id: &str) -> bool {
        self.subscribed
            .contains(&FilterKey::new(class_name, filter_id))
    }

    pub(crate) fn len(&self) -> usize {
        self.filters.len()
    }

    pub(crate) fn subscribed_len(&self) -> usize {
        self.subscribed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const QUERY_CHANGED: &str = "SELECT * FROM LMI_SoftwareInstModification WHERE \
        SourceInstance ISA LMI_SoftwareJob";

    fn same(class_name: &str, superclass: &str) -> bool {
        class_name.eq_ignore_ascii_case(superclass)
    }

    fn registry() -> FilterRegistry {
        let mut registry = FilterRegistry::default();
        registry
            .add(
                "LMI_SoftwareJob",
                &[
                    StaticFilter::new("Changed", QUERY_CHANGED),
                    StaticFilter::new("Created", "SELECT * FROM LMI_SoftwareInstCreation"),
                ],
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_add_rejects_duplicate_key_case_insensitively() {
        let mut registry = registry();
        let err = registry
            .add("lmi_softwarejob", &[StaticFilter::new("CHANGED", "x")])
            .unwrap_err();
        assert!(matches!(err, IndicationError::AlreadyExists { .. }));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_add_is_all_or_nothing() {
        let mut registry = registry();
        let err = registry.add(
            "LMI_SoftwareJob",
            &[StaticFilter::new("Failed", "q1"), StaticFilter::new("Changed", "q2")],
        );
        assert!(err.is_err());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_activate_matches_normalized_query() {
        let mut registry = registry();
        let loud = "select *   from lmi_softwareinstmodification where sourceinstance isa lmi_softwarejob";
        let ids = registry
            .activate(loud, "LMI_SoftwareInstModification", same)
            .unwrap();
        assert_eq!(ids, vec!["Changed".to_string()]);
        assert!(registry.is_subscribed("lmi_softwarejob", "changed"));
        assert!(!registry.is_subscribed("LMI_SoftwareJob", "Created"));
    }

    #[test]
    fn test_deactivate_inactive_is_not_found_and_harmless() {
        let mut registry = registry();
        registry
            .activate("SELECT * FROM LMI_SoftwareInstCreation", "LMI_SoftwareInstCreation", same)
            .unwrap();
        let err = registry
            .deactivate(QUERY_CHANGED, "LMI_SoftwareInstModification", same)
            .unwrap_err();
        assert!(matches!(err, IndicationError::FilterNotFound { .. }));
        assert_eq!(registry.subscribed_len(), 1);
    }

    #[test]
    fn test_activate_accepts_indication_or_job_class_only() {
        let mut registry = registry();
        let err = registry
            .activate(QUERY_CHANGED, "LMI_StorageInstModification", same)
            .unwrap_err();
        assert!(matches!(err, IndicationError::FilterNotFound { .. }));
        registry
            .activate(QUERY_CHANGED, "lmi_softwarejob", same)
            .unwrap();
        assert!(registry.is_subscribed("LMI_SoftwareJob", "Changed"));
    }

    #[test]
    fn test_from_class_reads_indication_class() {
        assert_eq!(
            from_class(QUERY_CHANGED).as_deref(),
            Some("LMI_SoftwareInstModification")
        );
        assert_eq!(from_class("SELECT *"), None);
    }
}
