use serde::Serialize;
use std::collections::BTreeSet;

/// Measurement keys the REST layer already knows for an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KnownKeys(BTreeSet<String>);

impl KnownKeys {
    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for KnownKeys {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Payload keys that are not in `known`.
pub fn check_new_keys<'a, I>(payload_keys: I, known: &KnownKeys) -> BTreeSet<String>
where
    I: IntoIterator<Item = &'a str>,
{
    payload_keys
        .into_iter()
        .filter(|key| !known.contains(key))
        .map(str::to_string)
        .collect()
}
