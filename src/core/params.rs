//! Stage parameters and environment branching.
//!
//! A stage declares the parameters it needs. At bind time each declaration
//! is resolved against the values supplied for the run: an explicit value
//! is validated against the declared choices, otherwise the default applies.
//! A `dispatch` table then selects exactly one branch of steps from the
//! effective value of a single parameter.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::pipeline::StepSpec;

/// Effective parameter values for one stage, keyed by parameter name
pub type BoundParameters = BTreeMap<String, String>;

/// A parameter declared by a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDecl {
    pub key: String,

    /// Value used when none is supplied
    #[serde(default)]
    pub default: Option<String>,

    /// Enumerated choices; empty means free text
    #[serde(default)]
    pub allowed: Vec<String>,

    #[serde(default)]
    pub description: Option<String>,
}

impl ParameterDecl {
    pub fn is_constrained(&self) -> bool {
        !self.allowed.is_empty()
    }

    /// Check a value against the declared choices
    pub fn permits(&self, value: &str) -> bool {
        !self.is_constrained() || self.allowed.iter().any(|a| a == value)
    }
}

/// Errors raised while binding a stage's parameters
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParameterValidationError {
    #[error("Parameter '{key}' value '{value}' is not one of [{}]", .allowed.join(", "))]
    NotAllowed {
        key: String,
        value: String,
        allowed: Vec<String>,
    },

    #[error("Parameter '{key}' has no value and no default")]
    Missing { key: String },

    #[error("No branch handles {key}={value}")]
    NoBranch { key: String, value: String },
}

/// Resolves declarations against the values supplied for a run
#[derive(Debug, Clone, Default)]
pub struct ParameterResolver {
    supplied: BTreeMap<String, String>,
}

impl ParameterResolver {
    pub fn new(supplied: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            supplied: supplied.into_iter().collect(),
        }
    }

    /// Values supplied for the run
    pub fn supplied(&self) -> &BTreeMap<String, String> {
        &self.supplied
    }

    /// Resolve a single declaration to its effective value
    pub fn resolve(&self, decl: &ParameterDecl) -> Result<String, ParameterValidationError> {
        match self.supplied.get(&decl.key) {
            Some(value) if decl.permits(value) => Ok(value.clone()),
            Some(value) => Err(ParameterValidationError::NotAllowed {
                key: decl.key.clone(),
                value: value.clone(),
                allowed: decl.allowed.clone(),
            }),
            None => decl
                .default
                .clone()
                .ok_or_else(|| ParameterValidationError::Missing {
                    key: decl.key.clone(),
                }),
        }
    }

    /// Resolve every declaration of a stage; the first failure wins
    pub fn bind(&self, decls: &[ParameterDecl]) -> Result<BoundParameters, ParameterValidationError> {
        decls
            .iter()
            .map(|decl| self.resolve(decl).map(|value| (decl.key.clone(), value)))
            .collect()
    }
}

/// Branch table selecting steps by the value of one parameter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dispatch {
    /// Parameter whose effective value selects the branch
    pub on: String,

    /// Steps per value
    pub cases: BTreeMap<String, Vec<StepSpec>>,
}

impl Dispatch {
    /// Pick the branch for the bound value. A value without a case is an
    /// error, never an empty branch.
    pub fn select(&self, params: &BoundParameters) -> Result<&[StepSpec], ParameterValidationError> {
        let value = params
            .get(&self.on)
            .ok_or_else(|| ParameterValidationError::Missing {
                key: self.on.clone(),
            })?;

        self.cases
            .get(value)
            .map(Vec::as_slice)
            .ok_or_else(|| ParameterValidationError::NoBranch {
                key: self.on.clone(),
                value: value.clone(),
            })
    }
}

/// Parse a `KEY=VALUE` assignment (CLI `--param`)
pub fn parse_assignment(input: &str) -> Result<(String, String), String> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", input))?;

    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in '{}'", input));
    }
    Ok((key.to_string(), value.to_string()))
}
