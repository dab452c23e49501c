use std::collections::HashMap;

/// Named model coefficients, e.g. `"tau"`, `"k"`, `"b"` or `"p_a"`.
///
/// Models read the keys they know and fall back to their documented
/// defaults for missing ones; unknown keys are ignored. Boolean switches are
/// stored as numbers, any non-zero value meaning `true`.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(transparent)
)]
pub struct ParamMap(HashMap<String, f64>);

impl ParamMap {
    /// Creates an empty parameter map.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the map with `key` set to `value`.
    pub fn with(mut self, key: &str, value: f64) -> Self {
        self.set(key, value);
        self
    }

    /// Sets `key` to `value`.
    pub fn set(&mut self, key: &str, value: f64) {
        self.0.insert(key.to_owned(), value);
    }

    /// Gets the value of `key`, if present.
    pub fn get_opt(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    /// Gets the value of `key`, or `default` if it is absent.
    pub fn get(&self, key: &str, default: f64) -> f64 {
        self.get_opt(key).unwrap_or(default)
    }

    /// Gets a boolean switch.
    pub fn flag(&self, key: &str, default: bool) -> bool {
        self.get_opt(key).map_or(default, |value| value != 0.0)
    }
}

impl<K: Into<String>> FromIterator<(K, f64)> for ParamMap {
    fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}
