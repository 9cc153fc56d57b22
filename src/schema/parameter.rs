//! Tunable parameters with finite, enumerable value domains.
//!
//! Every parameter maps an integer id in `[0, max_id]` to a value string.
//! Three domains are supported: integer ranges, double ranges and explicit
//! string lists.

use serde::{Deserialize, Serialize};

/// Tolerance used when converting float ranges into step counts.
const STEP_EPSILON: f64 = 1e-9;

/// Largest accepted domain. Ids stay exact when weighted as `f64`.
pub const MAX_POSSIBILITIES: u64 = 1 << 53;

/// A named parameter with an immutable value domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ParameterDef", into = "ParameterDef")]
pub struct Parameter {
    name: String,
    domain: Domain,
}

#[derive(Debug, Clone, PartialEq)]
enum Domain {
    IntRange {
        min: i64,
        max: i64,
        step: i64,
    },
    DoubleRange {
        min: f64,
        max: f64,
        step: f64,
        decimals: i32,
    },
    StringEnum(Vec<String>),
}

impl Parameter {
    /// Integer range `[min, max]` walked in `step` increments.
    pub fn integer(
        name: impl Into<String>,
        min: i64,
        max: i64,
        step: i64,
    ) -> Result<Self, ParameterError> {
        let name = name.into();
        if step <= 0 {
            return Err(ParameterError::InvalidStep(name));
        }
        if min > max {
            return Err(ParameterError::InvertedBounds(name));
        }
        if int_domain_size(min, max, step).is_none() {
            return Err(ParameterError::DomainTooLarge(name));
        }
        Ok(Self {
            name,
            domain: Domain::IntRange { min, max, step },
        })
    }

    /// Double range `[min, max]` walked in `step` increments.
    ///
    /// Values are rounded to whichever of `min` and `step` carries more
    /// decimal places, so accumulated float error never leaks into the
    /// value strings.
    pub fn double(
        name: impl Into<String>,
        min: f64,
        max: f64,
        step: f64,
    ) -> Result<Self, ParameterError> {
        let name = name.into();
        if !(step.is_finite() && step > 0.0) {
            return Err(ParameterError::InvalidStep(name));
        }
        if !(min.is_finite() && max.is_finite()) || min > max {
            return Err(ParameterError::InvertedBounds(name));
        }
        if double_domain_size(min, max, step).is_none() {
            return Err(ParameterError::DomainTooLarge(name));
        }
        let decimals = decimal_places(step).max(decimal_places(min));
        Ok(Self {
            name,
            domain: Domain::DoubleRange {
                min,
                max,
                step,
                decimals,
            },
        })
    }

    /// Explicit ordered list of string values.
    pub fn string<I, S>(name: impl Into<String>, domain: I) -> Result<Self, ParameterError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let domain: Vec<String> = domain.into_iter().map(Into::into).collect();
        if domain.is_empty() {
            return Err(ParameterError::EmptyDomain(name));
        }
        Ok(Self {
            name,
            domain: Domain::StringEnum(domain),
        })
    }

    /// Parameter name, also used as placeholder and storage column.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of distinct ids (`max_id + 1`), never above
    /// [`MAX_POSSIBILITIES`].
    pub fn possibilities(&self) -> u64 {
        let size = match &self.domain {
            Domain::IntRange { min, max, step } => int_domain_size(*min, *max, *step),
            Domain::DoubleRange { min, max, step, .. } => double_domain_size(*min, *max, *step),
            Domain::StringEnum(values) => Some(values.len() as u64),
        };
        // Constructors reject oversized domains.
        size.unwrap_or(MAX_POSSIBILITIES)
    }

    /// Highest valid id.
    pub fn max_id(&self) -> u64 {
        self.possibilities() - 1
    }

    /// Value string for `id`. Ids at or past `max_id` yield the maximum value.
    pub fn value(&self, id: u64) -> String {
        let last = id >= self.max_id();
        match &self.domain {
            Domain::IntRange { min, max, step } => {
                if last {
                    return max.to_string();
                }
                let value = min.saturating_add((id as i64).saturating_mul(*step));
                value.min(*max).to_string()
            }
            Domain::DoubleRange {
                min,
                max,
                step,
                decimals,
            } => {
                if last {
                    return format_double(*max);
                }
                let value = round_to(min + id as f64 * step, *decimals);
                format_double(value.min(*max))
            }
            Domain::StringEnum(values) => {
                let index = (id as usize).min(values.len() - 1);
                values[index].clone()
            }
        }
    }

    /// Lowest value string.
    pub fn min_value(&self) -> String {
        self.value(0)
    }

    /// Highest value string.
    pub fn max_value(&self) -> String {
        self.value(self.max_id())
    }

    /// Id of a stored value string, if it belongs to this domain.
    ///
    /// Numeric domains map any value inside `[min, max]` to its nearest id so
    /// values written under an older, coarser step still land in range.
    pub fn position_of(&self, value: &str) -> Option<u64> {
        match &self.domain {
            Domain::IntRange { min, max, step } => {
                let v: i64 = value.trim().parse().ok()?;
                if v < *min || v > *max {
                    return None;
                }
                let id = (i128::from(v) - i128::from(*min)) / i128::from(*step);
                Some((id as u64).min(self.max_id()))
            }
            Domain::DoubleRange { min, max, step, .. } => {
                let v: f64 = value.trim().parse().ok()?;
                if v < min - STEP_EPSILON || v > max + STEP_EPSILON {
                    return None;
                }
                let id = ((v - min) / step).round().max(0.0) as u64;
                Some(id.min(self.max_id()))
            }
            Domain::StringEnum(values) => values.iter().position(|s| s == value).map(|i| i as u64),
        }
    }
}

/// Serialized form of a parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParameterDef {
    Integer {
        name: String,
        min: i64,
        max: i64,
        step: i64,
    },
    Double {
        name: String,
        min: f64,
        max: f64,
        step: f64,
    },
    String {
        name: String,
        domain: Vec<String>,
    },
}

impl TryFrom<ParameterDef> for Parameter {
    type Error = ParameterError;

    fn try_from(def: ParameterDef) -> Result<Self, Self::Error> {
        match def {
            ParameterDef::Integer {
                name,
                min,
                max,
                step,
            } => Parameter::integer(name, min, max, step),
            ParameterDef::Double {
                name,
                min,
                max,
                step,
            } => Parameter::double(name, min, max, step),
            ParameterDef::String { name, domain } => Parameter::string(name, domain),
        }
    }
}

impl From<Parameter> for ParameterDef {
    fn from(param: Parameter) -> Self {
        let name = param.name;
        match param.domain {
            Domain::IntRange { min, max, step } => ParameterDef::Integer {
                name,
                min,
                max,
                step,
            },
            Domain::DoubleRange { min, max, step, .. } => ParameterDef::Double {
                name,
                min,
                max,
                step,
            },
            Domain::StringEnum(domain) => ParameterDef::String { name, domain },
        }
    }
}

/// Parameter construction errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParameterError {
    #[error("Parameter '{0}' needs a positive step size")]
    InvalidStep(String),
    #[error("Parameter '{0}' has a lower bound above its upper bound")]
    InvertedBounds(String),
    #[error("Parameter '{0}' has an empty value domain")]
    EmptyDomain(String),
    #[error("Parameter '{0}' has more than 2^53 values")]
    DomainTooLarge(String),
}

fn int_domain_size(min: i64, max: i64, step: i64) -> Option<u64> {
    let steps = (i128::from(max) - i128::from(min)) / i128::from(step);
    u64::try_from(steps + 1)
        .ok()
        .filter(|size| *size <= MAX_POSSIBILITIES)
}

fn double_domain_size(min: f64, max: f64, step: f64) -> Option<u64> {
    let steps = ((max - min) / step + STEP_EPSILON).floor();
    if !steps.is_finite() || steps >= MAX_POSSIBILITIES as f64 {
        return None;
    }
    Some(steps as u64 + 1)
}

fn decimal_places(value: f64) -> i32 {
    let text = format!("{}", value.abs());
    match text.find('.') {
        Some(dot) => (text.len() - dot - 1) as i32,
        None => 0,
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn format_double(value: f64) -> String {
    // Avoid "-0" for values that round to zero from below.
    if value == 0.0 {
        return "0".to_string();
    }
    format!("{}", value)
}
