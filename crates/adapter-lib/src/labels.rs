//! Label selectors
//!
//! Evaluates Kubernetes-style label selectors against label sets. Selectors
//! can be parsed from the string form used in API queries
//! (`app=web,tier!=cache,env in (prod,staging),!canary`) or converted from
//! a `LabelSelector` object as found in autoscaler specs.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors parsing a label selector
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectorError {
    #[error("empty label key in requirement '{0}'")]
    EmptyKey(String),

    #[error("unterminated value list in requirement '{0}'")]
    UnterminatedSet(String),

    #[error("unknown operator '{0}'")]
    UnknownOperator(String),

    #[error("operator {operator} requires {expected} values, got {actual}")]
    InvalidValues {
        operator: String,
        expected: &'static str,
        actual: usize,
    },
}

/// Operator of a single selector requirement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// A single `key <op> values` requirement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: BTreeSet<String>,
}

impl Requirement {
    pub fn new(
        key: impl Into<String>,
        operator: Operator,
        values: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            key: key.into(),
            operator,
            values: values.into_iter().collect(),
        }
    }

    /// Returns true if the label set satisfies this requirement
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let value = labels.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => {
                value.map(|v| self.values.contains(v)).unwrap_or(false)
            }
            Operator::NotEquals | Operator::NotIn => {
                value.map(|v| !self.values.contains(v)).unwrap_or(true)
            }
            Operator::Exists => value.is_some(),
            Operator::DoesNotExist => value.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = || self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, joined()),
            Operator::NotEquals => write!(f, "{}!={}", self.key, joined()),
            Operator::In => write!(f, "{} in ({})", self.key, joined()),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, joined()),
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// Conjunction of requirements. The empty selector matches everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    requirements: Vec<Requirement>,
    match_nothing: bool,
}

impl Selector {
    /// Selector that matches every label set
    pub fn everything() -> Self {
        Self {
            requirements: Vec::new(),
            match_nothing: false,
        }
    }

    /// Selector that matches no label set
    pub fn nothing() -> Self {
        Self {
            requirements: Vec::new(),
            match_nothing: true,
        }
    }

    /// Selector requiring every given label to be present with the given value
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self {
            requirements: labels
                .iter()
                .map(|(k, v)| Requirement::new(k.clone(), Operator::Equals, [v.clone()]))
                .collect(),
            match_nothing: false,
        }
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty() && !self.match_nothing
    }

    /// Returns true if the label set satisfies all requirements
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        !self.match_nothing && self.requirements.iter().all(|r| r.matches(labels))
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::everything()
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(|r| r.to_string()).collect();
        write!(f, "{}", parts.join(","))
    }
}

impl FromStr for Selector {
    type Err = SelectorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let requirements = split_requirements(s)?
            .into_iter()
            .map(parse_requirement)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            requirements,
            match_nothing: false,
        })
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = SelectorError;

    fn try_from(selector: &LabelSelector) -> Result<Self, Self::Error> {
        let mut requirements = Vec::new();

        if let Some(match_labels) = &selector.match_labels {
            for (key, value) in match_labels {
                requirements.push(Requirement::new(key.clone(), Operator::Equals, [value.clone()]));
            }
        }

        for expr in selector.match_expressions.iter().flatten() {
            let values = expr.values.clone().unwrap_or_default();
            let operator = match expr.operator.as_str() {
                "In" => Operator::In,
                "NotIn" => Operator::NotIn,
                "Exists" => Operator::Exists,
                "DoesNotExist" => Operator::DoesNotExist,
                other => return Err(SelectorError::UnknownOperator(other.to_string())),
            };
            check_values(&expr.operator, operator, values.len())?;
            requirements.push(Requirement::new(expr.key.clone(), operator, values));
        }

        Ok(Self {
            requirements,
            match_nothing: false,
        })
    }
}

fn check_values(name: &str, operator: Operator, count: usize) -> Result<(), SelectorError> {
    let (ok, expected) = match operator {
        Operator::Equals | Operator::NotEquals => (count == 1, "exactly one"),
        Operator::In | Operator::NotIn => (count > 0, "at least one"),
        Operator::Exists | Operator::DoesNotExist => (count == 0, "no"),
    };

    if ok {
        Ok(())
    } else {
        Err(SelectorError::InvalidValues {
            operator: name.to_string(),
            expected,
            actual: count,
        })
    }
}

/// Split on commas that are not inside a parenthesised value list
fn split_requirements(s: &str) -> Result<Vec<&str>, SelectorError> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }

    if depth > 0 {
        return Err(SelectorError::UnterminatedSet(s[start..].trim().to_string()));
    }
    parts.push(&s[start..]);

    Ok(parts
        .into_iter()
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect())
}

fn parse_requirement(raw: &str) -> Result<Requirement, SelectorError> {
    if let Some(key) = raw.strip_prefix('!') {
        let key = non_empty_key(key.trim(), raw)?;
        return Ok(Requirement::new(key, Operator::DoesNotExist, Vec::<String>::new()));
    }

    if let Some((key, value)) = raw.split_once("!=") {
        let key = non_empty_key(key.trim(), raw)?;
        return Ok(Requirement::new(
            key,
            Operator::NotEquals,
            [value.trim().to_string()],
        ));
    }

    if let Some((key, value)) = raw.split_once('=') {
        let key = non_empty_key(key.trim(), raw)?;
        let value = value.strip_prefix('=').unwrap_or(value);
        return Ok(Requirement::new(key, Operator::Equals, [value.trim().to_string()]));
    }

    let mut words = raw.splitn(2, char::is_whitespace);
    let key = non_empty_key(words.next().unwrap_or_default().trim(), raw)?;
    let rest = match words.next() {
        Some(rest) => rest.trim(),
        None => return Ok(Requirement::new(key, Operator::Exists, Vec::<String>::new())),
    };

    let (operator, list) = if let Some(list) = rest.strip_prefix("notin") {
        (Operator::NotIn, list)
    } else if let Some(list) = rest.strip_prefix("in") {
        (Operator::In, list)
    } else {
        let op = rest.split_whitespace().next().unwrap_or(rest);
        return Err(SelectorError::UnknownOperator(op.to_string()));
    };

    let list = list.trim();
    let inner = list
        .strip_prefix('(')
        .and_then(|l| l.strip_suffix(')'))
        .ok_or_else(|| SelectorError::UnterminatedSet(raw.to_string()))?;

    let values: Vec<String> = inner
        .split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect();

    let name = if operator == Operator::In { "in" } else { "notin" };
    check_values(name, operator, values.len())?;

    Ok(Requirement::new(key, operator, values))
}

fn non_empty_key(key: &str, raw: &str) -> Result<String, SelectorError> {
    if key.is_empty() {
        Err(SelectorError::EmptyKey(raw.to_string()))
    } else {
        Ok(key.to_string())
    }
}
