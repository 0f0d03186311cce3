use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A stored computational unit with versioned metadata and an optional fitness score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Formula {
    /// Assigned by the store; ignored on import
    #[serde(default)]
    pub id: u64,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub fitness: Option<f64>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Creation time in milliseconds since the Unix epoch
    #[serde(default)]
    pub timestamp: i64,
    /// Opaque body handed to evaluation workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default)]
    pub cost: u32,
    /// Parent formula ids (set by mutation and crossover)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub provenance: Vec<u64>,
}

fn default_version() -> u32 {
    1
}

/// Caller-supplied payload for creating a formula.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaDraft {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub fitness: Option<f64>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub cost: u32,
    #[serde(default)]
    pub provenance: Vec<u64>,
}

impl FormulaDraft {
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_io<I, O, S, T>(mut self, inputs: I, outputs: O) -> Self
    where
        I: IntoIterator<Item = S>,
        O: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_fitness(mut self, fitness: f64) -> Self {
        self.fitness = Some(fitness);
        self
    }

    /// Materialize the draft with the store-assigned timestamp. A missing or
    /// zero version becomes 1.
    pub fn into_formula(self, timestamp: i64) -> Formula {
        Formula {
            id: 0,
            version: self.version.filter(|v| *v > 0).unwrap_or(1),
            fitness: self.fitness,
            inputs: self.inputs,
            outputs: self.outputs,
            tags: self.tags,
            timestamp,
            code: self.code,
            cost: self.cost,
            provenance: self.provenance,
        }
    }
}

impl From<Formula> for FormulaDraft {
    fn from(f: Formula) -> Self {
        Self {
            version: Some(f.version),
            fitness: f.fitness,
            inputs: f.inputs,
            outputs: f.outputs,
            tags: f.tags,
            code: f.code,
            cost: f.cost,
            provenance: f.provenance,
        }
    }
}

/// Partial update. Only `Some` fields are applied; `id` and `timestamp` are immutable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormulaUpdate {
    #[serde(default)]
    pub version: Option<u32>,
    /// `Some(None)` clears the score
    #[serde(default)]
    pub fitness: Option<Option<f64>>,
    #[serde(default)]
    pub inputs: Option<Vec<String>>,
    #[serde(default)]
    pub outputs: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub code: Option<Option<String>>,
    #[serde(default)]
    pub cost: Option<u32>,
}

impl FormulaUpdate {
    pub fn apply(&self, formula: &mut Formula) {
        if let Some(v) = self.version {
            formula.version = v;
        }
        if let Some(f) = self.fitness {
            formula.fitness = f;
        }
        if let Some(inputs) = &self.inputs {
            formula.inputs = inputs.clone();
        }
        if let Some(outputs) = &self.outputs {
            formula.outputs = outputs.clone();
        }
        if let Some(tags) = &self.tags {
            formula.tags = tags.clone();
        }
        if let Some(code) = &self.code {
            formula.code = code.clone();
        }
        if let Some(cost) = self.cost {
            formula.cost = cost;
        }
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Listing filter. Tags combine with OR: a formula matches if it carries any of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormulaFilter {
    #[serde(default)]
    pub tags: Vec<String>,
}

impl FormulaFilter {
    pub fn any_tag<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tags: tags.into_iter().map(Into::into).collect(),
        }
    }

    pub fn matches(&self, formula: &Formula) -> bool {
        self.tags.is_empty() || formula.tags.iter().any(|t| self.tags.contains(t))
    }
}

impl Formula {
    /// Case-insensitive substring match against the joined inputs, outputs and
    /// tags, each checked on its own.
    pub fn matches_term(&self, term: &str) -> bool {
        let needle = term.to_lowercase();
        [&self.inputs, &self.outputs, &self.tags]
            .iter()
            .any(|field| field.join(" ").to_lowercase().contains(&needle))
    }

    /// Derive a mutated child: version +1, parent recorded as provenance and
    /// fitness scaled by a factor in [0.95, 1.05).
    pub fn mutate<R: Rng>(&self, rng: &mut R) -> FormulaDraft {
        let mut child = FormulaDraft::from(self.clone());
        child.version = Some(self.version.saturating_add(1));
        child.provenance = vec![self.id];
        child.fitness = self
            .fitness
            .map(|f| f * rng.gen_range(0.95..1.05));
        child
    }

    /// Blend two parents. The child starts from `self`, takes the union of both
    /// parents' inputs and tags, and averages whichever fitness scores exist.
    pub fn crossover(&self, other: &Formula) -> FormulaDraft {
        let mut child = FormulaDraft::from(self.clone());
        child.version = Some(self.version.saturating_add(other.version) / 2 + 1);
        child.provenance = vec![self.id, other.id];
        child.inputs = union(&self.inputs, &other.inputs);
        child.tags = union(&self.tags, &other.tags);
        child.fitness = match (self.fitness, other.fitness) {
            (Some(a), Some(b)) => Some((a + b) / 2.0),
            (a, b) => a.or(b),
        };
        child
    }
}

/// Order-preserving union: every element of `a`, then the new ones of `b`.
fn union(a: &[String], b: &[String]) -> Vec<String> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    a.iter()
        .chain(b.iter())
        .filter(|s| seen.insert(s.as_str()))
        .cloned()
        .collect()
}
