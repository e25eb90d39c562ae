//! Volume rules
//!
//! Rules match objects by their raw server properties and override how they
//! are shown: volume bounds, a pinned level, or visibility.
//!
//! ## Matching
//! A rule matches when every selector matches. `equals` selectors compare the
//! property value exactly, `match` selectors run an unanchored regex search.
//! A property the object does not have never matches.
//!
//! ## Merging
//! Effects of all matching rules are merged in declaration order, and for each
//! field the last rule that sets it wins. `hidden` follows the same rule, so a
//! narrow rule later in the list can un-hide something a broad one hid.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::types::{LevelScale, Properties};
use crate::error::ConfigError;

/// A rule as written in the configuration file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "kebab-case")]
pub struct RuleSpec {
    pub name: String,
    /// property -> regex, searched anywhere in the value
    #[serde(rename = "match")]
    pub matches: BTreeMap<String, String>,
    /// property -> exact value
    pub equals: BTreeMap<String, String>,
    pub volume_max: Option<f64>,
    pub volume_min: Option<f64>,
    pub volume_set: Option<f64>,
    pub hidden: Option<bool>,
}

/// Overrides accumulated from all matching rules.
///
/// Volume fields are fractions of `max-level`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Effect {
    pub volume_max: Option<f64>,
    pub volume_min: Option<f64>,
    pub volume_set: Option<f64>,
    pub hidden: Option<bool>,
}

impl Effect {
    /// Overlay every field `other` sets.
    pub fn merge(&mut self, other: &Effect) {
        if other.volume_max.is_some() {
            self.volume_max = other.volume_max;
        }
        if other.volume_min.is_some() {
            self.volume_min = other.volume_min;
        }
        if other.volume_set.is_some() {
            self.volume_set = other.volume_set;
        }
        if other.hidden.is_some() {
            self.hidden = other.hidden;
        }
    }

    pub fn is_hidden(&self) -> bool {
        self.hidden.unwrap_or(false)
    }

    /// `(floor, ceiling)` in absolute levels. The ceiling wins if rules
    /// leave the floor above it.
    pub fn bounds(&self, scale: &LevelScale) -> (u32, u32) {
        let ceiling = self
            .volume_max
            .map(|f| scale.level_at(f))
            .unwrap_or(scale.max_level);
        let floor = self
            .volume_min
            .map(|f| scale.level_at(f))
            .unwrap_or(scale.min_level);
        (floor.min(ceiling), ceiling)
    }

    /// Absolute level pinned by `volume-set`, if any.
    pub fn forced_level(&self, scale: &LevelScale) -> Option<u32> {
        let (floor, ceiling) = self.bounds(scale);
        self.volume_set
            .map(|f| scale.level_at(f).clamp(floor, ceiling))
    }
}

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Regex(Regex),
}

#[derive(Debug)]
struct Selector {
    key: String,
    matcher: Matcher,
}

impl Selector {
    fn matches(&self, properties: &Properties) -> bool {
        let Some(value) = properties.get(&self.key) else {
            return false;
        };
        match &self.matcher {
            Matcher::Exact(expected) => value == expected,
            Matcher::Regex(re) => re.is_match(value),
        }
    }
}

/// A validated rule, ready for matching.
#[derive(Debug)]
pub struct Rule {
    pub name: String,
    selectors: Vec<Selector>,
    pub effect: Effect,
}

impl Rule {
    pub fn compile(spec: &RuleSpec) -> Result<Self, ConfigError> {
        let mut selectors = Vec::with_capacity(spec.matches.len() + spec.equals.len());

        for (key, pattern) in &spec.matches {
            let re = Regex::new(pattern).map_err(|source| ConfigError::InvalidPattern {
                rule: spec.name.clone(),
                key: key.clone(),
                source,
            })?;
            selectors.push(Selector {
                key: key.clone(),
                matcher: Matcher::Regex(re),
            });
        }
        for (key, value) in &spec.equals {
            selectors.push(Selector {
                key: key.clone(),
                matcher: Matcher::Exact(value.clone()),
            });
        }

        for (field, value) in [
            ("volume-max", spec.volume_max),
            ("volume-min", spec.volume_min),
            ("volume-set", spec.volume_set),
        ] {
            if let Some(v) = value
                && !(0.0..=1.0).contains(&v)
            {
                return Err(ConfigError::invalid(
                    format!("rule {:?} {}", spec.name, field),
                    format!("{} is outside [0, 1]", v),
                ));
            }
        }
        if let (Some(min), Some(max)) = (spec.volume_min, spec.volume_max)
            && min > max
        {
            return Err(ConfigError::invalid(
                format!("rule {:?} volume-min", spec.name),
                format!("{} is above volume-max {}", min, max),
            ));
        }

        Ok(Self {
            name: spec.name.clone(),
            selectors,
            effect: Effect {
                volume_max: spec.volume_max,
                volume_min: spec.volume_min,
                volume_set: spec.volume_set,
                hidden: spec.hidden,
            },
        })
    }

    pub fn matches(&self, properties: &Properties) -> bool {
        self.selectors.iter().all(|s| s.matches(properties))
    }
}

/// Ordered, compiled rule set.
#[derive(Debug, Default)]
pub struct RuleEngine {
    rules: Vec<Rule>,
}

impl RuleEngine {
    /// Validate and compile all rules up front; the first bad rule is an error.
    pub fn compile(specs: &[RuleSpec]) -> Result<Self, ConfigError> {
        let rules = specs.iter().map(Rule::compile).collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn evaluate(&self, properties: &Properties) -> Effect {
        let mut effect = Effect::default();
        for rule in &self.rules {
            if rule.matches(properties) {
                log::trace!("Rule {:?} matched", rule.name);
                effect.merge(&rule.effect);
            }
        }
        effect
    }
}
