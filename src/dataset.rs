use itertools::Itertools;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufRead, Write};

use crate::error::EngineError;

/// One feature slot of an example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_text(&self) -> String {
        match self {
            Value::Number(n) => n.to_string(),
            Value::Text(t) => t.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Classification {
    Positive,
    Negative,
}

/// An ordered feature vector with a two-class label. Content is frozen once
/// the example has been added to a training set; the associated weight lives
/// in the set, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    values: Vec<Value>,
    classification: Classification,
}

impl Example {
    pub fn new(values: Vec<Value>, classification: Classification) -> Self {
        Example {
            values,
            classification,
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn value(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn set_value(&mut self, index: usize, value: Value) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = value;
        }
    }

    pub fn classification(&self) -> Classification {
        self.classification
    }

    pub fn set_classification(&mut self, classification: Classification) {
        self.classification = classification;
    }
}

/// The observed value domain of one attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttributeDomain {
    Numeric { min: f64, max: f64 },
    Categorical(BTreeSet<String>),
}

impl AttributeDomain {
    fn for_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => AttributeDomain::Numeric { min: *n, max: *n },
            Value::Text(t) => {
                AttributeDomain::Categorical(BTreeSet::from([t.clone()]))
            }
        }
    }

    fn register(&mut self, value: &Value) -> Result<(), EngineError> {
        match (self, value) {
            (AttributeDomain::Numeric { min, max }, Value::Number(n)) => {
                if *n < *min {
                    *min = *n;
                }
                if *n > *max {
                    *max = *n;
                }
                Ok(())
            }
            (AttributeDomain::Categorical(values), Value::Text(t)) => {
                values.insert(t.clone());
                Ok(())
            }
            (domain, value) => Err(EngineError::Invariant(format!(
                "value '{}' does not fit the declared {} attribute domain",
                value.as_text(),
                match domain {
                    AttributeDomain::Numeric { .. } => "numeric",
                    AttributeDomain::Categorical(_) => "categorical",
                }
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FoldAssignment {
    of_example: Vec<usize>,
    sizes: Vec<usize>,
    validation: usize,
    positive_counter: usize,
    negative_counter: usize,
}

/// A labeled example collection with per-example weights, incrementally
/// inferred attribute domains, optional cross-validation folds, and the two
/// biased-resampling strategies the classifiers train on.
///
/// Examples live in an arena and are addressed by their index; the weight
/// store is a parallel vector keyed by that index, so structurally identical
/// examples keep distinct weights.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSet {
    relation: String,
    attribute_names: Vec<String>,
    domains: Vec<AttributeDomain>,
    class_attribute: String,
    /// File-format names of the two classes, positive first.
    class_names: [String; 2],
    examples: Vec<Example>,
    weights: Vec<f64>,
    numeric_range: Option<(f64, f64)>,
    folds: Option<FoldAssignment>,
}

impl Default for TrainingSet {
    fn default() -> Self {
        TrainingSet {
            relation: "examples".to_string(),
            attribute_names: Vec::new(),
            domains: Vec::new(),
            class_attribute: "class".to_string(),
            class_names: ["POSITIVE".to_string(), "NEGATIVE".to_string()],
            examples: Vec::new(),
            weights: Vec::new(),
            numeric_range: None,
            folds: None,
        }
    }
}

impl TrainingSet {
    pub fn new(relation: &str) -> Self {
        TrainingSet {
            relation: relation.to_string(),
            ..Self::default()
        }
    }

    /// A new empty set carrying over the schema (relation, attributes,
    /// domains, class names) but none of the examples.
    pub fn from_template(template: &TrainingSet) -> Self {
        TrainingSet {
            relation: template.relation.clone(),
            attribute_names: template.attribute_names.clone(),
            domains: template.domains.clone(),
            class_attribute: template.class_attribute.clone(),
            class_names: template.class_names.clone(),
            ..Self::default()
        }
    }

    pub fn relation(&self) -> &str {
        &self.relation
    }

    pub fn attribute_names(&self) -> &[String] {
        &self.attribute_names
    }

    pub fn domains(&self) -> &[AttributeDomain] {
        &self.domains
    }

    pub fn class_names(&self) -> &[String; 2] {
        &self.class_names
    }

    pub fn set_class_names(&mut self, positive: &str, negative: &str) {
        self.class_names = [positive.to_string(), negative.to_string()];
    }

    pub fn declare_numeric_attribute(&mut self, name: &str) {
        self.attribute_names.push(name.to_string());
        self.domains.push(AttributeDomain::Numeric {
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        });
    }

    pub fn declare_categorical_attribute<I, S>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attribute_names.push(name.to_string());
        self.domains.push(AttributeDomain::Categorical(
            values.into_iter().map(Into::into).collect(),
        ));
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    pub fn example(&self, index: usize) -> Option<&Example> {
        self.examples.get(index)
    }

    pub fn examples(&self) -> &[Example] {
        &self.examples
    }

    pub fn weight(&self, index: usize) -> Option<f64> {
        self.weights.get(index).copied()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn set_weight(&mut self, index: usize, weight: f64) {
        if let Some(slot) = self.weights.get_mut(index) {
            *slot = weight;
        }
    }

    /// The numeric range registered across all numeric attributes.
    pub fn numeric_range(&self) -> Option<(f64, f64)> {
        self.numeric_range
    }

    /// Appends an example, registers its values in the attribute domains, and
    /// resets all weights. The first example of a schema-less set fixes the
    /// attribute count and domain kinds. Returns the example's index, which is
    /// its stable handle.
    pub fn add_example(&mut self, example: Example) -> Result<usize, EngineError> {
        if self.domains.is_empty() && self.examples.is_empty() {
            for (i, value) in example.values().iter().enumerate() {
                self.attribute_names.push(format!("attr{}", i + 1));
                self.domains.push(AttributeDomain::for_value(value));
            }
        } else if example.values().len() != self.domains.len() {
            let err = EngineError::Invariant(format!(
                "example carries {} values but '{}' declares {} attributes",
                example.values().len(),
                self.relation,
                self.domains.len()
            ));
            log::error!("{err}");
            return Err(err);
        } else {
            for (domain, value) in self.domains.iter_mut().zip(example.values()) {
                domain.register(value)?;
            }
        }
        for value in example.values() {
            if let Value::Number(n) = value {
                self.numeric_range = Some(match self.numeric_range {
                    None => (*n, *n),
                    Some((min, max)) => (min.min(*n), max.max(*n)),
                });
            }
        }

        let index = self.examples.len();
        if let Some(folds) = self.folds.as_mut() {
            let counter = match example.classification() {
                Classification::Positive => &mut folds.positive_counter,
                Classification::Negative => &mut folds.negative_counter,
            };
            let fold = *counter % folds.sizes.len();
            *counter += 1;
            folds.of_example.push(fold);
            folds.sizes[fold] += 1;
        }
        self.examples.push(example);
        self.weights.push(1.0);
        self.reset_weights();
        Ok(index)
    }

    /// Removes an example; later indices shift down by one.
    pub fn remove_example(&mut self, index: usize) -> Result<Example, EngineError> {
        if index >= self.examples.len() {
            return Err(EngineError::Invariant(format!(
                "no example at index {index} in '{}'",
                self.relation
            )));
        }
        let example = self.examples.remove(index);
        self.weights.remove(index);
        if let Some(folds) = self.folds.as_mut() {
            let fold = folds.of_example.remove(index);
            folds.sizes[fold] -= 1;
        }
        self.reset_weights();
        Ok(example)
    }

    /// Uniform weights 1/N; under active cross-validation, 0 for the
    /// validation fold and 1/M for the M training examples.
    pub fn reset_weights(&mut self) {
        match &self.folds {
            None => {
                let n = self.examples.len();
                if n > 0 {
                    self.weights.fill(1.0 / n as f64);
                }
            }
            Some(folds) => {
                let training = self.examples.len() - folds.sizes[folds.validation];
                if training == 0 {
                    log::warn!(
                        "'{}': every example is in the validation fold, all weights zeroed",
                        self.relation
                    );
                    self.weights.fill(0.0);
                    return;
                }
                let share = 1.0 / training as f64;
                for (weight, fold) in self.weights.iter_mut().zip(&folds.of_example) {
                    *weight = if *fold == folds.validation { 0.0 } else { share };
                }
            }
        }
    }

    /// Rescales the weights to sum 1.0, preserving their proportions. A
    /// zero-total vector is reset to uniform instead.
    pub fn normalize_weights(&mut self) {
        let total: f64 = self.weights.iter().sum();
        if total > 0.0 {
            for weight in &mut self.weights {
                *weight /= total;
            }
        } else if !self.weights.is_empty() {
            log::warn!("'{}': weights sum to zero, resetting to uniform", self.relation);
            self.folds = None;
            self.reset_weights();
        }
    }

    /// Assigns every example to one of `folds` folds, keeping two independent
    /// round-robin counters so each class spreads evenly regardless of input
    /// order. Fold 0 starts as the validation fold.
    pub fn setup_cross_validation(&mut self, folds: usize) -> Result<(), EngineError> {
        if folds < 2 {
            return Err(EngineError::Invariant(
                "cross-validation needs at least 2 folds".to_string(),
            ));
        }
        let mut assignment = FoldAssignment {
            of_example: Vec::with_capacity(self.examples.len()),
            sizes: vec![0; folds],
            validation: 0,
            positive_counter: 0,
            negative_counter: 0,
        };
        for example in &self.examples {
            let counter = match example.classification() {
                Classification::Positive => &mut assignment.positive_counter,
                Classification::Negative => &mut assignment.negative_counter,
            };
            let fold = *counter % folds;
            *counter += 1;
            assignment.of_example.push(fold);
            assignment.sizes[fold] += 1;
        }
        self.folds = Some(assignment);
        self.reset_weights();
        Ok(())
    }

    pub fn set_validation_fold(&mut self, fold: usize) -> Result<(), EngineError> {
        match self.folds.as_mut() {
            None => Err(EngineError::Invariant(
                "cross-validation has not been set up".to_string(),
            )),
            Some(folds) => {
                if fold >= folds.sizes.len() {
                    return Err(EngineError::Invariant(format!(
                        "fold {fold} does not exist, only {} folds assigned",
                        folds.sizes.len()
                    )));
                }
                folds.validation = fold;
                self.reset_weights();
                Ok(())
            }
        }
    }

    pub fn clear_cross_validation(&mut self) {
        self.folds = None;
        self.reset_weights();
    }

    pub fn fold_of(&self, index: usize) -> Option<usize> {
        self.folds
            .as_ref()
            .and_then(|f| f.of_example.get(index).copied())
    }

    pub fn fold_sizes(&self) -> Option<&[usize]> {
        self.folds.as_ref().map(|f| f.sizes.as_slice())
    }

    pub fn validation_fold(&self) -> Option<usize> {
        self.folds.as_ref().map(|f| f.validation)
    }

    /// Cumulative weight array over the whole example list, normalized to the
    /// weight total, with the final slot forced to exactly 1.0 to absorb
    /// floating-point drift.
    fn cumulative_weights(&self) -> Result<Vec<f64>, EngineError> {
        let total: f64 = self.weights.iter().sum();
        if total <= 0.0 {
            let err = EngineError::Invariant(format!(
                "'{}': total sampleable weight is zero",
                self.relation
            ));
            log::error!("{err}");
            return Err(err);
        }
        let mut running = 0.0;
        let mut cumulative: Vec<f64> = self
            .weights
            .iter()
            .map(|w| {
                running += w / total;
                running
            })
            .collect();
        if let Some(last) = cumulative.last_mut() {
            *last = 1.0;
        }
        Ok(cumulative)
    }

    /// Fitness-proportional resampling with replacement: each draw scans the
    /// cumulative array for the first segment past a uniform random number.
    /// A draw landing on a zero-weight example is discarded and redrawn.
    pub fn sample_indices_weighted(
        &self,
        count: usize,
        rng: &mut impl Rng,
    ) -> Result<Vec<usize>, EngineError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let cumulative = self.cumulative_weights()?;
        let mut picks = Vec::with_capacity(count);
        while picks.len() < count {
            let r = rng.gen::<f64>();
            let index = cumulative
                .iter()
                .position(|c| *c > r)
                .unwrap_or(cumulative.len() - 1);
            if self.weights[index] == 0.0 {
                log::debug!("discarding draw on zero-weight example {index}");
                continue;
            }
            picks.push(index);
        }
        Ok(picks)
    }

    /// Stochastic universal sampling: `count` equally spaced pointers from one
    /// random offset, wrapped around 1.0 and sorted, matched to the cumulative
    /// array in a single pass. Every example is drawn its expected number of
    /// times, rounded up or down.
    pub fn sample_indices_sus(
        &self,
        count: usize,
        rng: &mut impl Rng,
    ) -> Result<Vec<usize>, EngineError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let cumulative = self.cumulative_weights()?;
        let start = rng.gen::<f64>();
        let step = 1.0 / count as f64;
        let mut pointers: Vec<f64> = (0..count)
            .map(|i| (start + i as f64 * step) % 1.0)
            .collect();
        pointers.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let mut picks = Vec::with_capacity(count);
        let mut index = 0;
        for pointer in pointers {
            while cumulative[index] <= pointer {
                index += 1;
            }
            if self.weights[index] == 0.0 {
                log::warn!("stochastic universal sampling drew zero-weight example {index}");
            }
            picks.push(index);
        }
        Ok(picks)
    }

    pub fn sample_weighted(
        &self,
        count: usize,
        rng: &mut impl Rng,
    ) -> Result<TrainingSet, EngineError> {
        let indices = self.sample_indices_weighted(count, rng)?;
        self.subset(&indices)
    }

    pub fn sample_with_stochastic_universal_sampling(
        &self,
        count: usize,
        rng: &mut impl Rng,
    ) -> Result<TrainingSet, EngineError> {
        let indices = self.sample_indices_sus(count, rng)?;
        self.subset(&indices)
    }

    fn subset(&self, indices: &[usize]) -> Result<TrainingSet, EngineError> {
        let mut sample = TrainingSet::from_template(self);
        for index in indices {
            let example = self.examples.get(*index).ok_or_else(|| {
                EngineError::Invariant(format!("sampled index {index} is out of range"))
            })?;
            sample.add_example(example.clone())?;
        }
        Ok(sample)
    }

    /// Writes the attribute-relation text format: a relation line, one
    /// attribute declaration per line (the class attribute last), and
    /// comma-separated data rows whose final field is the class label.
    pub fn save_to_path(&self, path: &str) -> Result<(), EngineError> {
        let mut file = File::create(path)?;
        writeln!(file, "@relation {}", self.relation)?;
        for (name, domain) in self.attribute_names.iter().zip(&self.domains) {
            match domain {
                AttributeDomain::Numeric { .. } => {
                    writeln!(file, "@attribute {name} NUMERIC")?;
                }
                AttributeDomain::Categorical(values) => {
                    writeln!(file, "@attribute {name} {{{}}}", values.iter().join(","))?;
                }
            }
        }
        writeln!(
            file,
            "@attribute {} {{{}}}",
            self.class_attribute,
            self.class_names.iter().join(",")
        )?;
        writeln!(file, "@data")?;
        for example in &self.examples {
            let label = match example.classification() {
                Classification::Positive => &self.class_names[0],
                Classification::Negative => &self.class_names[1],
            };
            let row = example.values().iter().map(Value::as_text).join(",");
            if row.is_empty() {
                writeln!(file, "{label}")?;
            } else {
                writeln!(file, "{row},{label}")?;
            }
        }
        Ok(())
    }

    pub fn from_file(path: &str) -> Result<Self, EngineError> {
        let mut set = TrainingSet::default();
        set.import_from_path(path, true)?;
        Ok(set)
    }

    /// Imports a dataset file. Without `overwrite`, the file's attribute count
    /// and class vocabulary must match the schema already declared here; the
    /// parsed examples are then appended. Nothing is mutated on any error.
    /// With `overwrite`, the file replaces schema and examples wholesale.
    /// Returns the number of examples imported.
    pub fn import_from_path(&mut self, path: &str, overwrite: bool) -> Result<usize, EngineError> {
        let file = File::open(path)?;
        let parsed = ParsedFile::read(io::BufReader::new(file))?;

        let has_schema = !self.domains.is_empty() || !self.examples.is_empty();
        if !overwrite && has_schema {
            if parsed.domains.len() != self.domains.len() {
                return Err(EngineError::Format {
                    line: parsed.data_line,
                    detail: format!(
                        "file declares {} attributes but '{}' has {}",
                        parsed.domains.len(),
                        self.relation,
                        self.domains.len()
                    ),
                });
            }
            let registered: BTreeSet<&str> =
                self.class_names.iter().map(|s| s.as_str()).collect();
            let declared: BTreeSet<&str> =
                parsed.class_names.iter().map(|s| s.as_str()).collect();
            if registered != declared {
                return Err(EngineError::Format {
                    line: parsed.class_line,
                    detail: format!(
                        "class vocabulary {{{}}} does not match the registered classes {{{}}}",
                        declared.iter().join(","),
                        registered.iter().join(","),
                    ),
                });
            }
        }

        if overwrite || !has_schema {
            let count = parsed.examples.len();
            *self = parsed.into_training_set()?;
            return Ok(count);
        }
        let count = parsed.examples.len();
        for example in parsed.examples {
            self.add_example(example)?;
        }
        Ok(count)
    }
}

struct ParsedFile {
    relation: String,
    attribute_names: Vec<String>,
    domains: Vec<AttributeDomain>,
    class_attribute: String,
    class_names: Vec<String>,
    class_line: usize,
    data_line: usize,
    examples: Vec<Example>,
}

impl ParsedFile {
    fn read<R: BufRead>(reader: R) -> Result<Self, EngineError> {
        let mut relation = None;
        // Attribute declarations in file order; the last one is the class.
        let mut attributes: Vec<(String, Option<AttributeDomain>, Vec<String>, usize)> =
            Vec::new();
        let mut rows: Vec<(usize, String)> = Vec::new();
        let mut in_data = false;
        let mut data_line = 0;

        for (number, line) in reader.lines().enumerate() {
            let number = number + 1;
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('%') {
                continue;
            }
            if in_data {
                rows.push((number, line.to_string()));
                continue;
            }
            let lower = line.to_ascii_lowercase();
            if let Some(rest) = strip_keyword(line, &lower, "@relation") {
                relation = Some(rest.to_string());
            } else if let Some(rest) = strip_keyword(line, &lower, "@attribute") {
                attributes.push(Self::parse_attribute(rest, number)?);
            } else if lower == "@data" {
                in_data = true;
                data_line = number;
            } else {
                return Err(EngineError::Format {
                    line: number,
                    detail: format!("unrecognized header line '{line}'"),
                });
            }
        }

        let relation = relation.ok_or(EngineError::Format {
            line: 1,
            detail: "missing @relation header".to_string(),
        })?;
        let (class_name, class_domain, class_values, class_line) =
            attributes.pop().ok_or(EngineError::Format {
                line: data_line.max(1),
                detail: "no attribute declarations before @data".to_string(),
            })?;
        if class_domain.is_some() || class_values.len() != 2 {
            return Err(EngineError::Format {
                line: class_line,
                detail: format!(
                    "the final attribute '{class_name}' must declare exactly two class values"
                ),
            });
        }

        let mut names = Vec::with_capacity(attributes.len());
        let mut domains = Vec::with_capacity(attributes.len());
        for (name, domain, values, _) in attributes {
            names.push(name);
            domains.push(match domain {
                Some(domain) => domain,
                None => AttributeDomain::Categorical(values.into_iter().collect()),
            });
        }

        let mut examples = Vec::with_capacity(rows.len());
        for (number, row) in rows {
            examples.push(Self::parse_row(&row, number, &domains, &class_values)?);
        }

        Ok(ParsedFile {
            relation,
            attribute_names: names,
            domains,
            class_attribute: class_name,
            class_names: class_values,
            class_line,
            data_line: data_line.max(1),
            examples,
        })
    }

    fn parse_attribute(
        rest: &str,
        line: usize,
    ) -> Result<(String, Option<AttributeDomain>, Vec<String>, usize), EngineError> {
        let mut parts = rest.trim().splitn(2, char::is_whitespace);
        let name = parts.next().unwrap_or("").to_string();
        let domain_spec = parts.next().map(str::trim).unwrap_or("");
        if name.is_empty() || domain_spec.is_empty() {
            return Err(EngineError::Format {
                line,
                detail: "attribute declaration needs a name and a domain".to_string(),
            });
        }
        if domain_spec.eq_ignore_ascii_case("numeric") || domain_spec.eq_ignore_ascii_case("real") {
            return Ok((
                name,
                Some(AttributeDomain::Numeric {
                    min: f64::INFINITY,
                    max: f64::NEG_INFINITY,
                }),
                Vec::new(),
                line,
            ));
        }
        match domain_spec.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            Some(inner) => {
                let values: Vec<String> = inner
                    .split(',')
                    .map(|v| v.trim().to_string())
                    .filter(|v| !v.is_empty())
                    .collect();
                if values.is_empty() {
                    return Err(EngineError::Format {
                        line,
                        detail: format!("attribute '{name}' declares an empty value set"),
                    });
                }
                Ok((name, None, values, line))
            }
            None => Err(EngineError::Format {
                line,
                detail: format!("attribute '{name}' must be NUMERIC or a {{v1,v2,...}} set"),
            }),
        }
    }

    fn parse_row(
        row: &str,
        line: usize,
        domains: &[AttributeDomain],
        class_values: &[String],
    ) -> Result<Example, EngineError> {
        let fields: Vec<&str> = row.split(',').map(str::trim).collect();
        if fields.len() != domains.len() + 1 {
            return Err(EngineError::Format {
                line,
                detail: format!(
                    "expected {} fields, found {}",
                    domains.len() + 1,
                    fields.len()
                ),
            });
        }
        let mut values = Vec::with_capacity(domains.len());
        for (field, domain) in fields.iter().zip(domains) {
            values.push(match domain {
                AttributeDomain::Numeric { .. } => {
                    Value::Number(field.parse::<f64>().map_err(|_| EngineError::Format {
                        line,
                        detail: format!("'{field}' is not a number"),
                    })?)
                }
                AttributeDomain::Categorical(declared) => {
                    if !declared.contains(*field) {
                        return Err(EngineError::Format {
                            line,
                            detail: format!(
                                "'{field}' is not among the declared values {{{}}}",
                                declared.iter().join(",")
                            ),
                        });
                    }
                    Value::Text(field.to_string())
                }
            });
        }
        let label = fields[fields.len() - 1];
        let classification = if label == class_values[0] {
            Classification::Positive
        } else if label == class_values[1] {
            Classification::Negative
        } else {
            return Err(EngineError::Format {
                line,
                detail: format!(
                    "class label '{label}' is not among {{{}}}",
                    class_values.iter().join(",")
                ),
            });
        };
        Ok(Example::new(values, classification))
    }

    fn into_training_set(self) -> Result<TrainingSet, EngineError> {
        let mut set = TrainingSet {
            relation: self.relation,
            attribute_names: self.attribute_names,
            domains: self.domains,
            class_attribute: self.class_attribute,
            class_names: [self.class_names[0].clone(), self.class_names[1].clone()],
            ..TrainingSet::default()
        };
        for example in self.examples {
            set.add_example(example)?;
        }
        Ok(set)
    }
}

fn strip_keyword<'a>(line: &'a str, lower: &str, keyword: &str) -> Option<&'a str> {
    if lower.starts_with(keyword) {
        let rest = &line[keyword.len()..];
        if rest.starts_with(char::is_whitespace) {
            return Some(rest.trim());
        }
    }
    None
}
