use crate::error::{CoreError, ErrorKind};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A typed config value. Untagged on the wire so manifests read naturally
/// (`"interval": 5` / `"user": "root"`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ConfigValue {
    pub fn value_type(&self) -> ValueType {
        match self {
            ConfigValue::Bool(_) => ValueType::Bool,
            ConfigValue::Int(_) => ValueType::Int,
            ConfigValue::Float(_) => ValueType::Float,
            ConfigValue::Str(_) => ValueType::Str,
        }
    }
}

impl std::fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{v}"),
            ConfigValue::Int(v) => write!(f, "{v}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::Str(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Str,
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValueType::Bool => "bool",
            ValueType::Int => "integer",
            ValueType::Float => "float",
            ValueType::Str => "string",
        };
        write!(f, "{s}")
    }
}

/// Config maps are ordered so policy application and serialization are
/// deterministic.
pub type ConfigMap = BTreeMap<String, ConfigValue>;

/// One rule of a plugin's declared config policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRule {
    pub key: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub default: Option<ConfigValue>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub minimum: Option<ConfigValue>,
    #[serde(default)]
    pub maximum: Option<ConfigValue>,
}

/// The set of rules a plugin declares at load time. `apply` validates a
/// caller-supplied config against the rules and fills in defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigPolicy {
    pub rules: BTreeMap<String, PolicyRule>,
}

impl ConfigPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_rule(&mut self, rule: PolicyRule) {
        self.rules.insert(rule.key.clone(), rule);
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Validate `config` and return the augmented map: defaults filled,
    /// types checked, bounds enforced, missing required keys rejected.
    /// Keys without a rule pass through untouched.
    pub fn apply(&self, config: &ConfigMap) -> Result<ConfigMap, CoreError> {
        let mut out = config.clone();
        for (key, rule) in &self.rules {
            let supplied = out.get(key).cloned();
            match supplied {
                Some(value) => {
                    let value = coerce(&value, rule.value_type).ok_or_else(|| {
                        policy_error(format!(
                            "config key {key:?} expects {} but got {}",
                            rule.value_type,
                            value.value_type()
                        ))
                    })?;
                    check_bound(key, &value, rule.minimum.as_ref(), Bound::Minimum)?;
                    check_bound(key, &value, rule.maximum.as_ref(), Bound::Maximum)?;
                    out.insert(key.clone(), value);
                }
                None => {
                    if let Some(default) = &rule.default {
                        out.insert(key.clone(), default.clone());
                    } else if rule.required {
                        return Err(policy_error(format!(
                            "required config key {key:?} is missing"
                        )));
                    }
                }
            }
        }
        Ok(out)
    }

    /// Flatten the rules for control-plane listings.
    pub fn as_table(&self) -> Vec<PolicyTableEntry> {
        self.rules
            .values()
            .map(|r| PolicyTableEntry {
                name: r.key.clone(),
                value_type: r.value_type,
                default: r.default.clone(),
                required: r.required,
                minimum: r.minimum.clone(),
                maximum: r.maximum.clone(),
            })
            .collect()
    }
}

/// Row of the rules table returned by `GET /v1/plugins/...` and
/// `GET /v1/metric`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyTableEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    pub default: Option<ConfigValue>,
    pub required: bool,
    pub minimum: Option<ConfigValue>,
    pub maximum: Option<ConfigValue>,
}

fn policy_error(message: String) -> CoreError {
    CoreError::new(ErrorKind::Policy, message)
}

/// Integers are accepted where floats are declared; everything else must
/// match exactly.
fn coerce(value: &ConfigValue, expected: ValueType) -> Option<ConfigValue> {
    match (value, expected) {
        (ConfigValue::Int(i), ValueType::Float) => Some(ConfigValue::Float(*i as f64)),
        (v, t) if v.value_type() == t => Some(v.clone()),
        _ => None,
    }
}

enum Bound {
    Minimum,
    Maximum,
}

fn check_bound(
    key: &str,
    value: &ConfigValue,
    bound: Option<&ConfigValue>,
    which: Bound,
) -> Result<(), CoreError> {
    let Some(bound) = bound else {
        return Ok(());
    };
    let ok = match (value, bound) {
        (ConfigValue::Int(v), ConfigValue::Int(b)) => match which {
            Bound::Minimum => v >= b,
            Bound::Maximum => v <= b,
        },
        (ConfigValue::Float(v), ConfigValue::Float(b)) => match which {
            Bound::Minimum => v >= b,
            Bound::Maximum => v <= b,
        },
        (ConfigValue::Float(v), ConfigValue::Int(b)) => match which {
            Bound::Minimum => *v >= *b as f64,
            Bound::Maximum => *v <= *b as f64,
        },
        // bounds on non-numeric values are ignored
        _ => true,
    };
    if ok {
        Ok(())
    } else {
        let side = match which {
            Bound::Minimum => "minimum",
            Bound::Maximum => "maximum",
        };
        Err(policy_error(format!(
            "config key {key:?} violates {side} {bound}"
        )))
    }
}
