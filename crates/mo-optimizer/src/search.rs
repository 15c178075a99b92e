//! Search space definitions and proposal strategies.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

use mo_types::{validation_error, MoError, MoResult, ParameterValue};

/// A single parameter dimension in the search space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterDef {
    /// Parameter name, matching a column of the trial schema.
    pub name: String,
    /// The kind of search range.
    pub kind: ParameterKind,
}

/// Describes how a parameter is sampled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterKind {
    /// Continuous uniform range [low, high].
    FloatRange { low: f64, high: f64 },
    /// Integer range [low, high] inclusive.
    IntRange { low: i64, high: i64 },
    /// Log-uniform range (sampled in log-space then exponentiated).
    LogUniform { low: f64, high: f64 },
}

/// The full search space: an ordered list of parameter definitions.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchSpace {
    pub parameters: Vec<ParameterDef>,
}

impl SearchSpace {
    pub fn new() -> Self {
        Self {
            parameters: Vec::new(),
        }
    }

    pub fn add_float(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::FloatRange { low, high },
        });
        self
    }

    pub fn add_int(mut self, name: impl Into<String>, low: i64, high: i64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::IntRange { low, high },
        });
        self
    }

    pub fn add_log_uniform(mut self, name: impl Into<String>, low: f64, high: f64) -> Self {
        self.parameters.push(ParameterDef {
            name: name.into(),
            kind: ParameterKind::LogUniform { low, high },
        });
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.parameters.iter().map(|p| p.name.as_str())
    }

    pub fn validate(&self) -> MoResult<()> {
        let mut seen = HashSet::new();
        for param in &self.parameters {
            if !seen.insert(param.name.as_str()) {
                return Err(validation_error!("duplicate search parameter: {}", param.name));
            }
            let ok = match param.kind {
                ParameterKind::FloatRange { low, high } => {
                    low.is_finite() && high.is_finite() && low <= high
                }
                ParameterKind::IntRange { low, high } => low <= high,
                ParameterKind::LogUniform { low, high } => {
                    low.is_finite() && high.is_finite() && low > 0.0 && low <= high
                }
            };
            if !ok {
                return Err(validation_error!(
                    "invalid range for search parameter {}: {:?}",
                    param.name,
                    param.kind
                ));
            }
        }
        Ok(())
    }

    /// Draw one uniform sample per dimension.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> HashMap<String, ParameterValue> {
        self.parameters
            .iter()
            .map(|param| (param.name.clone(), sample_dimension(&param.kind, rng)))
            .collect()
    }
}

fn sample_dimension<R: Rng + ?Sized>(kind: &ParameterKind, rng: &mut R) -> ParameterValue {
    match *kind {
        ParameterKind::FloatRange { low, high } => {
            ParameterValue::Float(rng.random_range(low..=high))
        }
        ParameterKind::IntRange { low, high } => ParameterValue::Int(rng.random_range(low..=high)),
        ParameterKind::LogUniform { low, high } => {
            let log_val: f64 = rng.random_range(low.ln()..=high.ln());
            ParameterValue::Float(log_val.exp())
        }
    }
}

// ---------------------------------------------------------------------------
// Search strategies
// ---------------------------------------------------------------------------

/// Fixed evaluation budget for one strategy instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    /// Seed evaluations drawn before any guided proposal.
    pub init_points: usize,
    /// Guided evaluations after the seed phase.
    pub iterations: usize,
}

impl Budget {
    pub fn new(init_points: usize, iterations: usize) -> Self {
        Self {
            init_points,
            iterations,
        }
    }

    pub fn total(&self) -> usize {
        self.init_points + self.iterations
    }
}

/// A black-box search algorithm that always maximizes its guidance scalar.
pub trait SearchStrategy: Send {
    /// Propose the next candidate assignment.
    fn propose(&mut self, space: &SearchSpace) -> HashMap<String, ParameterValue>;

    /// Feed back the guidance scalar observed for `params`.
    fn observe(&mut self, _params: &HashMap<String, ParameterValue>, _score: f64) {}

    /// Whether the evaluation budget is exhausted.
    fn done(&self) -> bool;

    /// Human-readable strategy name.
    fn name(&self) -> &str;
}

fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

// ---- Random search ----

/// Independent random sampling across the search space.
#[derive(Debug, Clone)]
pub struct RandomSearch {
    budget: Budget,
    proposed: usize,
    rng: StdRng,
}

impl RandomSearch {
    pub fn new(budget: Budget, seed: Option<u64>) -> Self {
        Self {
            budget,
            proposed: 0,
            rng: rng_from_seed(seed),
        }
    }
}

impl SearchStrategy for RandomSearch {
    fn propose(&mut self, space: &SearchSpace) -> HashMap<String, ParameterValue> {
        self.proposed += 1;
        space.sample(&mut self.rng)
    }

    fn done(&self) -> bool {
        self.proposed >= self.budget.total()
    }

    fn name(&self) -> &str {
        "random"
    }
}

// ---- Bayesian search (surrogate-model heuristic) ----

/// Explore/exploit search guided by the observed history.
///
/// The first `init_points` proposals are pure exploration. After that each
/// proposal either explores (with probability `exploration_weight`) or
/// perturbs the best observed point.
#[derive(Debug, Clone)]
pub struct BayesianSearch {
    budget: Budget,
    proposed: usize,
    rng: StdRng,
    observations: Vec<(HashMap<String, ParameterValue>, f64)>,
    exploration_weight: f64,
}

impl BayesianSearch {
    pub fn new(budget: Budget, exploration_weight: f64, seed: Option<u64>) -> Self {
        Self {
            budget,
            proposed: 0,
            rng: rng_from_seed(seed),
            observations: Vec::new(),
            exploration_weight,
        }
    }

    pub fn observations(&self) -> &[(HashMap<String, ParameterValue>, f64)] {
        &self.observations
    }

    fn best(&self) -> Option<&HashMap<String, ParameterValue>> {
        self.observations
            .iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(params, _)| params)
    }

    /// Exploitation: perturb the best-known point.
    fn exploit(&mut self, space: &SearchSpace) -> HashMap<String, ParameterValue> {
        let base = match self.best() {
            Some(params) => params.clone(),
            None => return space.sample(&mut self.rng),
        };

        let mut perturbed = HashMap::new();
        for param in &space.parameters {
            let value = match (&param.kind, base.get(&param.name)) {
                (ParameterKind::FloatRange { low, high }, Some(ParameterValue::Float(v))) => {
                    let noise = self.rng.random_range(-0.1..0.1) * (high - low);
                    ParameterValue::Float((v + noise).clamp(*low, *high))
                }
                (ParameterKind::IntRange { low, high }, Some(ParameterValue::Int(v))) => {
                    let delta: i64 = self.rng.random_range(-2..=2);
                    ParameterValue::Int(v.saturating_add(delta).clamp(*low, *high))
                }
                (ParameterKind::LogUniform { low, high }, Some(ParameterValue::Float(v))) => {
                    let log_range = high.ln() - low.ln();
                    let noise = self.rng.random_range(-0.1..0.1) * log_range;
                    ParameterValue::Float((v.ln() + noise).exp().clamp(*low, *high))
                }
                (kind, _) => sample_dimension(kind, &mut self.rng),
            };
            perturbed.insert(param.name.clone(), value);
        }
        perturbed
    }
}

impl SearchStrategy for BayesianSearch {
    fn propose(&mut self, space: &SearchSpace) -> HashMap<String, ParameterValue> {
        let seeding = self.proposed < self.budget.init_points;
        self.proposed += 1;
        if seeding
            || self.observations.is_empty()
            || self.rng.random::<f64>() < self.exploration_weight
        {
            space.sample(&mut self.rng)
        } else {
            self.exploit(space)
        }
    }

    fn observe(&mut self, params: &HashMap<String, ParameterValue>, score: f64) {
        self.observations.push((params.clone(), score));
    }

    fn done(&self) -> bool {
        self.proposed >= self.budget.total()
    }

    fn name(&self) -> &str {
        "bayesian"
    }
}

/// Built-in strategy selection for configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StrategyKind {
    Random,
    Bayesian { exploration_weight: f64 },
}

impl Default for StrategyKind {
    fn default() -> Self {
        Self::Bayesian {
            exploration_weight: 0.3,
        }
    }
}

impl StrategyKind {
    pub fn build(&self, budget: Budget, seed: Option<u64>) -> Box<dyn SearchStrategy> {
        match self {
            Self::Random => Box::new(RandomSearch::new(budget, seed)),
            Self::Bayesian { exploration_weight } => {
                Box::new(BayesianSearch::new(budget, *exploration_weight, seed))
            }
        }
    }
}

/// Counters from one [`drive`] loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveStats {
    pub proposals: usize,
    pub observed: usize,
    /// Proposals dropped because a parameter could not be cast.
    pub skipped: usize,
}

impl DriveStats {
    pub fn absorb(&mut self, other: DriveStats) {
        self.proposals += other.proposals;
        self.observed += other.observed;
        self.skipped += other.skipped;
    }
}

/// Run `strategy` to the end of its budget, scoring each proposal with
/// `evaluate`.
///
/// A cast failure costs one proposal and the loop moves on; any other error
/// ends the loop.
pub fn drive<F>(
    strategy: &mut dyn SearchStrategy,
    space: &SearchSpace,
    mut evaluate: F,
) -> MoResult<DriveStats>
where
    F: FnMut(&HashMap<String, ParameterValue>) -> MoResult<Option<f64>>,
{
    let mut stats = DriveStats::default();
    while !strategy.done() {
        let candidate = strategy.propose(space);
        stats.proposals += 1;
        match evaluate(&candidate) {
            Ok(Some(score)) => {
                strategy.observe(&candidate, score);
                stats.observed += 1;
            }
            Ok(None) => debug!("Objective returned no outcome records"),
            Err(MoError::TypeCast { column, message }) => {
                warn!("Skipping proposal, cannot cast {}: {}", column, message);
                stats.skipped += 1;
            }
            Err(e) => return Err(e),
        }
    }
    Ok(stats)
}
