use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::{env, fmt};

/// Credential read from the configuration file, optionally overridden by an
/// environment variable so broker passwords need not live in the JSON.
///
/// Accepts either a plain string or `{ "value": "...", "var_name": "ENV" }`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretValue {
    value: String,
    pub var_name: Option<String>,
}

impl SecretValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            var_name: None,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// Replace the value from `var_name` if that variable is set.
    /// Returns true when an override was applied.
    pub fn apply_env_override(&mut self) -> bool {
        match self.var_name.as_deref().map(env::var) {
            Some(Ok(v)) => {
                self.value = v;
                true
            }
            _ => false,
        }
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("value", &"***")
            .field("var_name", &self.var_name)
            .finish()
    }
}

impl<'de> Deserialize<'de> for SecretValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Simple(String),
            Detailed {
                #[serde(default)]
                value: String,
                var_name: Option<String>,
            },
        }

        match Repr::deserialize(deserializer)? {
            Repr::Simple(value) => Ok(SecretValue::new(value)),
            Repr::Detailed { value, var_name } => {
                let mut sv = SecretValue { value, var_name };
                if !sv.apply_env_override()
                    && let Some(name) = sv.var_name.as_deref()
                {
                    tracing::warn!("secret env var {} not set, using inline value", name);
                }
                Ok(sv)
            }
        }
    }
}

impl Serialize for SecretValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        #[derive(Serialize)]
        struct Repr<'a> {
            value: &'a str,
            var_name: &'a Option<String>,
        }

        Repr {
            value: &self.value,
            var_name: &self.var_name,
        }
        .serialize(serializer)
    }
}
