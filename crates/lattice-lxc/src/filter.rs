//! Instance list filters
//!
//! Filters are predicates over an instance's config map. A listing matches
//! an instance only when every filter matches.

use std::collections::BTreeMap;

use crate::api::Instance;

/// Predicate over an instance's config map
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListFilter {
    /// Every key must be present with exactly the given value
    Config(BTreeMap<String, String>),
    /// The key must be present, with any value
    HasConfigKey(String),
}

impl ListFilter {
    /// Match config key/value pairs exactly
    pub fn with_config<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        ListFilter::Config(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Match presence of a config key
    pub fn with_config_key(key: impl Into<String>) -> Self {
        ListFilter::HasConfigKey(key.into())
    }

    /// Whether the instance satisfies this filter
    pub fn matches(&self, instance: &Instance) -> bool {
        match self {
            ListFilter::Config(pairs) => pairs
                .iter()
                .all(|(k, v)| instance.config.get(k) == Some(v)),
            ListFilter::HasConfigKey(key) => instance.config.contains_key(key),
        }
    }
}

/// Whether the instance satisfies every filter
pub fn matches_all(filters: &[ListFilter], instance: &Instance) -> bool {
    filters.iter().all(|f| f.matches(instance))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(config: &[(&str, &str)]) -> Instance {
        Instance {
            name: "node-1".to_string(),
            config: config
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_filter_requires_every_pair() {
        let filter = ListFilter::with_config([
            ("user.cluster-name", "c1"),
            ("user.cluster-role", "control-plane"),
        ]);
        assert!(filter.matches(&instance(&[
            ("user.cluster-name", "c1"),
            ("user.cluster-role", "control-plane"),
            ("image.os", "ubuntu"),
        ])));
        assert!(!filter.matches(&instance(&[("user.cluster-name", "c1")])));
        assert!(!filter.matches(&instance(&[
            ("user.cluster-name", "c2"),
            ("user.cluster-role", "control-plane"),
        ])));
    }

    #[test]
    fn test_filters_combine() {
        let filters = [
            ListFilter::with_config_key("user.cluster-name"),
            ListFilter::with_config([("user.cluster-role", "loadbalancer")]),
        ];
        assert!(matches_all(
            &filters,
            &instance(&[("user.cluster-name", "x"), ("user.cluster-role", "loadbalancer")])
        ));
        assert!(!matches_all(&filters, &instance(&[("user.cluster-role", "loadbalancer")])));
        assert!(matches_all(&[], &instance(&[])));
    }
}
