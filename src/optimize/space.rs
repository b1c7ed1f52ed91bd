use crate::optimize::model::ValidationError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// One concrete parameter assignment handed to the evaluator.
pub type ParamAssignment = BTreeMap<String, Value>;

/// Inclusive numeric bounds for a sampled parameter.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub min: f64,
    pub max: f64,
    /// Round samples to the nearest integer (periods, lookbacks).
    #[serde(default)]
    pub integer: bool,
}

impl ParamRange {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            integer: false,
        }
    }

    pub fn integer(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            integer: true,
        }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Value {
        let raw = if self.max > self.min {
            rng.gen_range(self.min..=self.max)
        } else {
            self.min
        };
        self.to_value(raw)
    }

    fn midpoint(&self) -> Value {
        self.to_value(self.min + (self.max - self.min) / 2.0)
    }

    fn to_value(&self, raw: f64) -> Value {
        if self.integer {
            Value::from(raw.round() as i64)
        } else {
            Value::from(raw)
        }
    }
}

/// Search space of a job.
///
/// `Grid` lists finite candidates per parameter and is enumerated exhaustively;
/// `Range` bounds each parameter and is sampled uniformly. Keys iterate in
/// lexicographic order, which fixes the grid enumeration order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ParamSpace {
    Grid { values: BTreeMap<String, Vec<Value>> },
    /// Also accepted as `random` or `bayes`; both sample uniformly.
    #[serde(alias = "random", alias = "bayes")]
    Range { bounds: BTreeMap<String, ParamRange> },
}

impl ParamSpace {
    pub fn grid<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, Vec<Value>)>,
    {
        ParamSpace::Grid {
            values: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn range<K, I>(entries: I) -> Self
    where
        K: Into<String>,
        I: IntoIterator<Item = (K, ParamRange)>,
    {
        ParamSpace::Range {
            bounds: entries.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            ParamSpace::Grid { .. } => "grid",
            ParamSpace::Range { .. } => "range",
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            ParamSpace::Grid { values } => values.is_empty(),
            ParamSpace::Range { bounds } => bounds.is_empty(),
        }
    }

    /// Number of distinct grid combinations; `None` for sampled spaces.
    pub fn combinations(&self) -> Option<usize> {
        match self {
            ParamSpace::Grid { values } => Some(
                values
                    .values()
                    .fold(1usize, |acc, v| acc.saturating_mul(v.len())),
            ),
            ParamSpace::Range { .. } => None,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.is_empty() {
            return Err(ValidationError::EmptySpace);
        }
        match self {
            ParamSpace::Grid { values } => {
                for (name, candidates) in values {
                    if candidates.is_empty() {
                        return Err(ValidationError::EmptyValues {
                            param: name.clone(),
                        });
                    }
                }
            }
            ParamSpace::Range { bounds } => {
                for (name, range) in bounds {
                    if !range.min.is_finite() || !range.max.is_finite() || range.min > range.max {
                        return Err(ValidationError::InvalidRange {
                            param: name.clone(),
                            min: range.min,
                            max: range.max,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Single-point grid used by backtest jobs: the first grid combination,
    /// or the midpoint of every range.
    pub fn baseline(&self) -> ParamSpace {
        match self {
            ParamSpace::Grid { values } => ParamSpace::Grid {
                values: values
                    .iter()
                    .map(|(k, v)| (k.clone(), v.iter().take(1).cloned().collect()))
                    .collect(),
            },
            ParamSpace::Range { bounds } => ParamSpace::Grid {
                values: bounds
                    .iter()
                    .map(|(k, r)| (k.clone(), vec![r.midpoint()]))
                    .collect(),
            },
        }
    }

    /// Depth-first enumeration of the grid; empty iterator for range spaces.
    pub fn grid_iter(&self) -> GridIter {
        match self {
            ParamSpace::Grid { values } => GridIter::new(values),
            ParamSpace::Range { .. } => GridIter::empty(),
        }
    }

    /// One uniform draw per parameter; `None` for grid spaces.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<ParamAssignment> {
        match self {
            ParamSpace::Grid { .. } => None,
            ParamSpace::Range { bounds } => Some(
                bounds
                    .iter()
                    .map(|(name, range)| (name.clone(), range.sample(rng)))
                    .collect(),
            ),
        }
    }
}

/// Odometer over the Cartesian product; the last key varies fastest, which
/// reproduces a recursive depth-first walk.
pub struct GridIter {
    keys: Vec<String>,
    values: Vec<Vec<Value>>,
    cursor: Vec<usize>,
    done: bool,
}

impl GridIter {
    fn new(space: &BTreeMap<String, Vec<Value>>) -> Self {
        let keys: Vec<String> = space.keys().cloned().collect();
        let values: Vec<Vec<Value>> = space.values().cloned().collect();
        let done = values.is_empty() || values.iter().any(|v| v.is_empty());
        Self {
            cursor: vec![0; keys.len()],
            keys,
            values,
            done,
        }
    }

    fn empty() -> Self {
        Self {
            keys: Vec::new(),
            values: Vec::new(),
            cursor: Vec::new(),
            done: true,
        }
    }
}

impl Iterator for GridIter {
    type Item = ParamAssignment;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let item = self
            .keys
            .iter()
            .zip(self.cursor.iter())
            .zip(self.values.iter())
            .map(|((k, &i), vals)| (k.clone(), vals[i].clone()))
            .collect();

        // advance
        let mut pos = self.cursor.len();
        loop {
            if pos == 0 {
                self.done = true;
                break;
            }
            pos -= 1;
            self.cursor[pos] += 1;
            if self.cursor[pos] < self.values[pos].len() {
                break;
            }
            self.cursor[pos] = 0;
        }

        Some(item)
    }
}
