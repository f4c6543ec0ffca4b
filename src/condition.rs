use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::data::{DataContext, Partition};
use crate::error::EngineError;
use crate::feature::{
    DistanceWindow, KindMatch, NumericDataset, Region, RegionDataset, RegionFilter,
};
use crate::motif::MotifRegistry;
use crate::operand::{check_pair, resolve_token, Operand};

/// Endpoint slack for the fuzzy structural-membership test.
const SIMILARITY_SLACK: usize = 3;

/// The closed comparator vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Equals,
    IsIn,
    Matches,
    Overlaps,
    Inside,
    Covers,
    PresentIn,
    SimilarIn,
    DistanceToClosest,
    DistanceToAny,
}

impl FromStr for Comparator {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "=" => Comparator::Eq,
            "!=" | "<>" => Comparator::Ne,
            "<" => Comparator::Lt,
            "<=" => Comparator::Le,
            ">" => Comparator::Gt,
            ">=" => Comparator::Ge,
            "in" => Comparator::In,
            "equals" => Comparator::Equals,
            "is-in" | "is in" | "in-set" | "in set" => Comparator::IsIn,
            "matches" => Comparator::Matches,
            "overlaps" => Comparator::Overlaps,
            "inside" => Comparator::Inside,
            "covers" => Comparator::Covers,
            "present-in" | "present in" => Comparator::PresentIn,
            "similar-in" | "similar in" => Comparator::SimilarIn,
            "distance-to-closest" | "distance to closest" => Comparator::DistanceToClosest,
            "distance-to-any" | "distance to any" => Comparator::DistanceToAny,
            other => {
                return Err(EngineError::Evaluation {
                    comparator: other.to_string(),
                    detail: "unknown comparator".to_string(),
                })
            }
        })
    }
}

impl fmt::Display for Comparator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let text = match self {
            Comparator::Eq => "=",
            Comparator::Ne => "!=",
            Comparator::Lt => "<",
            Comparator::Le => "<=",
            Comparator::Gt => ">",
            Comparator::Ge => ">=",
            Comparator::In => "in",
            Comparator::Equals => "equals",
            Comparator::IsIn => "is-in",
            Comparator::Matches => "matches",
            Comparator::Overlaps => "overlaps",
            Comparator::Inside => "inside",
            Comparator::Covers => "covers",
            Comparator::PresentIn => "present-in",
            Comparator::SimilarIn => "similar-in",
            Comparator::DistanceToClosest => "distance-to-closest",
            Comparator::DistanceToAny => "distance-to-any",
        };
        write!(f, "{text}")
    }
}

impl Comparator {
    /// Comparators that search another region track instead of comparing a
    /// single extracted value.
    pub fn is_interval(&self) -> bool {
        matches!(
            self,
            Comparator::Overlaps
                | Comparator::Inside
                | Comparator::Covers
                | Comparator::PresentIn
                | Comparator::SimilarIn
                | Comparator::DistanceToClosest
                | Comparator::DistanceToAny
        )
    }
}

/// Converts an inner comparator plus operand(s) into a concrete
/// admissible-distance window. `!=` becomes an equality window with the
/// negate flag set.
pub fn distance_window(
    cmp: Comparator,
    value: i64,
    upper: Option<i64>,
) -> Result<DistanceWindow, EngineError> {
    let window = match cmp {
        Comparator::Eq => DistanceWindow {
            min: value,
            max: value,
            negate: false,
        },
        Comparator::Ne => DistanceWindow {
            min: value,
            max: value,
            negate: true,
        },
        Comparator::Lt => DistanceWindow {
            min: i64::MIN,
            max: value - 1,
            negate: false,
        },
        Comparator::Le => DistanceWindow {
            min: i64::MIN,
            max: value,
            negate: false,
        },
        Comparator::Gt => DistanceWindow {
            min: value + 1,
            max: i64::MAX,
            negate: false,
        },
        Comparator::Ge => DistanceWindow {
            min: value,
            max: i64::MAX,
            negate: false,
        },
        Comparator::In => {
            let upper = upper.ok_or_else(|| EngineError::Evaluation {
                comparator: "in".to_string(),
                detail: "range upper bound missing".to_string(),
            })?;
            DistanceWindow {
                min: value,
                max: upper,
                negate: false,
            }
        }
        other => {
            return Err(EngineError::Evaluation {
                comparator: other.to_string(),
                detail: "cannot derive a distance window".to_string(),
            })
        }
    };
    Ok(window)
}

/// An extracted comparison value.
#[derive(Debug)]
enum EvalValue<'a> {
    Number(f64),
    Texts(Vec<String>),
    Set(&'a BTreeSet<String>),
    Partition(&'a Partition),
    /// A named region property that the region does not carry. Comparisons
    /// against a missing value are unsatisfied, not errors.
    Missing,
}

impl EvalValue<'_> {
    fn describe(&self) -> &'static str {
        match self {
            EvalValue::Number(_) => "a number",
            EvalValue::Texts(_) => "text",
            EvalValue::Set(_) => "a collection",
            EvalValue::Partition(_) => "a partition",
            EvalValue::Missing => "a missing value",
        }
    }
}

fn eval_err(cmp: Comparator, detail: String) -> EngineError {
    EngineError::Evaluation {
        comparator: cmp.to_string(),
        detail,
    }
}

fn upper_number(cmp: Comparator, upper: Option<EvalValue>) -> Result<Option<f64>, EngineError> {
    match upper {
        None => Ok(None),
        Some(EvalValue::Number(n)) => Ok(Some(n)),
        Some(other) => Err(eval_err(
            cmp,
            format!("range upper bound must be a number, found {}", other.describe()),
        )),
    }
}

fn compare_numbers(
    cmp: Comparator,
    a: f64,
    b: f64,
    upper: Option<f64>,
) -> Result<bool, EngineError> {
    Ok(match cmp {
        Comparator::Eq | Comparator::Equals => a == b,
        Comparator::Ne => a != b,
        Comparator::Lt => a < b,
        Comparator::Le => a <= b,
        Comparator::Gt => a > b,
        Comparator::Ge => a >= b,
        Comparator::In => {
            let upper = upper.ok_or_else(|| {
                eval_err(cmp, "range comparison needs an upper bound".to_string())
            })?;
            a >= b && a <= upper
        }
        other => {
            return Err(eval_err(
                other,
                "not defined for numeric operands".to_string(),
            ))
        }
    })
}

fn as_set(values: &[String]) -> BTreeSet<&str> {
    values.iter().map(|s| s.as_str()).collect()
}

fn compare_texts(
    cmp: Comparator,
    left: &[String],
    right: &[String],
    regex: Option<&Regex>,
) -> Result<bool, EngineError> {
    Ok(match cmp {
        Comparator::Equals => left == right,
        Comparator::Eq | Comparator::Ne => {
            let equal = if left.len() == 1 && right.len() == 1 {
                left[0] == right[0]
            } else if left.len() == 1 {
                right.contains(&left[0])
            } else {
                as_set(left) == as_set(right)
            };
            if cmp == Comparator::Eq {
                equal
            } else {
                !equal
            }
        }
        Comparator::IsIn => left.iter().all(|v| right.contains(v)),
        Comparator::Lt | Comparator::Le | Comparator::Gt | Comparator::Ge => {
            if left.len() == 1 && right.len() == 1 {
                match cmp {
                    Comparator::Lt => left[0] < right[0],
                    Comparator::Le => left[0] <= right[0],
                    Comparator::Gt => left[0] > right[0],
                    _ => left[0] >= right[0],
                }
            } else {
                let l = as_set(left);
                let r = as_set(right);
                match cmp {
                    Comparator::Lt => l.is_subset(&r) && l != r,
                    Comparator::Le => l.is_subset(&r),
                    Comparator::Gt => r.is_subset(&l) && l != r,
                    _ => r.is_subset(&l),
                }
            }
        }
        Comparator::Matches => {
            let compiled;
            let re = match regex {
                Some(re) => re,
                None => {
                    if right.len() != 1 {
                        return Err(eval_err(
                            cmp,
                            "pattern operand must be a single text value".to_string(),
                        ));
                    }
                    compiled = Regex::new(&right[0]).map_err(|e| {
                        eval_err(cmp, format!("invalid regular expression: {e}"))
                    })?;
                    &compiled
                }
            };
            left.iter().all(|v| re.is_match(v))
        }
        other => {
            return Err(eval_err(other, "not defined for text operands".to_string()));
        }
    })
}

fn compare_sets(
    cmp: Comparator,
    left: &BTreeSet<String>,
    right: &BTreeSet<String>,
) -> Result<bool, EngineError> {
    Ok(match cmp {
        Comparator::Eq | Comparator::Equals => left == right,
        Comparator::Ne => left != right,
        Comparator::Lt => left.is_subset(right) && left != right,
        Comparator::Le | Comparator::IsIn => left.is_subset(right),
        Comparator::Gt => right.is_subset(left) && left != right,
        Comparator::Ge => right.is_subset(left),
        Comparator::Overlaps => left.intersection(right).next().is_some(),
        other => {
            return Err(eval_err(
                other,
                "not defined for collection operands".to_string(),
            ))
        }
    })
}

fn compare_values(
    cmp: Comparator,
    left: EvalValue,
    right: EvalValue,
    upper: Option<EvalValue>,
    regex: Option<&Regex>,
) -> Result<bool, EngineError> {
    match (&left, &right) {
        (EvalValue::Missing, _) | (_, EvalValue::Missing) => Ok(false),
        (EvalValue::Number(a), EvalValue::Number(b)) => {
            let upper = upper_number(cmp, upper)?;
            compare_numbers(cmp, *a, *b, upper)
        }
        (EvalValue::Number(a), EvalValue::Texts(r)) if r.len() == 1 => {
            match r[0].parse::<f64>() {
                Ok(b) => {
                    let upper = upper_number(cmp, upper)?;
                    compare_numbers(cmp, *a, b, upper)
                }
                Err(_) => Err(eval_err(
                    cmp,
                    format!("cannot compare a number to '{}'", r[0]),
                )),
            }
        }
        (EvalValue::Texts(l), EvalValue::Number(b)) if l.len() == 1 => {
            match l[0].parse::<f64>() {
                Ok(a) => {
                    let upper = upper_number(cmp, upper)?;
                    compare_numbers(cmp, a, *b, upper)
                }
                Err(_) => Err(eval_err(
                    cmp,
                    format!("cannot compare '{}' to a number", l[0]),
                )),
            }
        }
        (EvalValue::Texts(l), EvalValue::Texts(r)) => compare_texts(cmp, l, r, regex),
        (EvalValue::Texts(l), EvalValue::Set(r)) => {
            let r: Vec<String> = r.iter().cloned().collect();
            compare_texts(cmp, l, &r, regex)
        }
        (EvalValue::Set(l), EvalValue::Set(r)) => compare_sets(cmp, l, r),
        (EvalValue::Partition(a), EvalValue::Partition(b)) => match cmp {
            Comparator::Eq | Comparator::Equals => Ok(a == b),
            Comparator::Ne => Ok(a != b),
            other => Err(eval_err(
                other,
                "not defined for partition operands".to_string(),
            )),
        },
        (l, r) => Err(eval_err(
            cmp,
            format!("cannot compare {} to {}", l.describe(), r.describe()),
        )),
    }
}

fn compile_regex(
    cmp: Comparator,
    right: &Operand,
    token: &str,
    line: usize,
) -> Result<Option<Regex>, EngineError> {
    if cmp != Comparator::Matches {
        return Ok(None);
    }
    match right {
        Operand::Text(pattern) => {
            let re = Regex::new(pattern).map_err(|e| EngineError::Resolution {
                token: token.to_string(),
                line,
                reason: format!("invalid regular expression: {e}"),
            })?;
            Ok(Some(re))
        }
        _ => Ok(None),
    }
}

/// A per-position comparison in token form, before resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionCondition {
    pub left: String,
    pub comparator: Comparator,
    pub right: String,
    #[serde(default)]
    pub right_upper: Option<String>,
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub line: usize,
}

impl PositionCondition {
    pub fn new(left: &str, comparator: Comparator, right: &str) -> Self {
        PositionCondition {
            left: left.to_string(),
            comparator,
            right: right.to_string(),
            right_upper: None,
            negate: false,
            line: 0,
        }
    }

    pub fn with_range(left: &str, lower: &str, upper: &str) -> Self {
        PositionCondition {
            left: left.to_string(),
            comparator: Comparator::In,
            right: lower.to_string(),
            right_upper: Some(upper.to_string()),
            negate: false,
            line: 0,
        }
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = line;
        self
    }

    /// Binds both operand tokens, producing the immutable evaluatable form.
    pub fn resolve(
        &self,
        ctx: &dyn DataContext,
    ) -> Result<ResolvedPositionCondition, EngineError> {
        if self.comparator.is_interval() {
            return Err(EngineError::Evaluation {
                comparator: self.comparator.to_string(),
                detail: "only region conditions can search region tracks".to_string(),
            });
        }
        let left = resolve_token(&self.left, self.line, ctx)?;
        let right = resolve_token(&self.right, self.line, ctx)?;
        check_pair(&left, &right, &self.right, self.line)?;
        let right_upper = match &self.right_upper {
            Some(token) => Some(resolve_token(token, self.line, ctx)?),
            None => None,
        };
        let regex = compile_regex(self.comparator, &right, &self.right, self.line)?;
        Ok(ResolvedPositionCondition {
            left,
            comparator: self.comparator,
            right,
            right_upper,
            regex,
            negate: self.negate,
        })
    }
}

/// The resolved, immutable form of a position condition. Safe to share
/// read-only across worker threads.
#[derive(Debug, Clone)]
pub struct ResolvedPositionCondition {
    left: Operand,
    comparator: Comparator,
    right: Operand,
    right_upper: Option<Operand>,
    regex: Option<Regex>,
    negate: bool,
}

impl ResolvedPositionCondition {
    pub fn is_satisfied(&self, seq: &str, pos: usize) -> Result<bool, EngineError> {
        let raw = self.compare(seq, pos)?;
        Ok(raw != self.negate)
    }

    fn compare(&self, seq: &str, pos: usize) -> Result<bool, EngineError> {
        let left = self.value_of(&self.left, seq, pos)?;
        let right = self.value_of(&self.right, seq, pos)?;
        let upper = match &self.right_upper {
            Some(op) => Some(self.value_of(op, seq, pos)?),
            None => None,
        };
        compare_values(self.comparator, left, right, upper, self.regex.as_ref())
    }

    fn value_of<'a>(
        &self,
        op: &'a Operand,
        seq: &str,
        pos: usize,
    ) -> Result<EvalValue<'a>, EngineError> {
        let cmp = self.comparator;
        Ok(match op {
            Operand::Number(n) => EvalValue::Number(*n),
            Operand::NumericMap(m) => EvalValue::Number(m.value(seq)),
            Operand::Track(t) => EvalValue::Number(t.get(seq, pos).ok_or_else(|| {
                eval_err(cmp, format!("no value at position {pos} of '{seq}'"))
            })?),
            Operand::Text(t) => EvalValue::Texts(vec![t.clone()]),
            Operand::TextSet(v) => EvalValue::Texts(v.clone()),
            Operand::TextMap(m) => EvalValue::Texts(m.value(seq).to_vec()),
            Operand::Dna(d) => {
                let base = d.base(seq, pos).ok_or_else(|| {
                    eval_err(cmp, format!("no base at position {pos} of '{seq}'"))
                })?;
                EvalValue::Texts(vec![(base as char).to_string()])
            }
            Operand::Collection(c) => EvalValue::Set(&c.members),
            Operand::Partition(p) => EvalValue::Partition(p),
            Operand::Regions(_) | Operand::RegionProperty(_) => {
                return Err(eval_err(
                    cmp,
                    "region operands are not valid in a position condition".to_string(),
                ))
            }
        })
    }
}

/// Which region attribute participates in a value comparison.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RegionField {
    Kind,
    Score,
    Length,
    Property(String),
    TrackStat { track: String, stat: RegionStat },
}

/// A numeric-track statistic over a region's span. The weighted variants read
/// the information-content vector of the region's motif, oriented by strand,
/// and fall back to the unweighted statistic when no usable weights exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegionStat {
    Avg,
    Sum,
    Min,
    Max,
    Median,
    StartValue,
    EndValue,
    WeightedAvg,
    WeightedSum,
    WeightedMin,
    WeightedMax,
    WeightedMedian,
}

fn median(values: &mut Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        values[mid]
    } else {
        (values[mid - 1] + values[mid]) / 2.0
    }
}

fn region_stat(values: &[f64], weights: Option<&[f64]>, stat: RegionStat) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let unweighted = |stat: RegionStat| match stat {
        RegionStat::Sum => values.iter().sum::<f64>(),
        RegionStat::Avg => values.iter().sum::<f64>() / values.len() as f64,
        RegionStat::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
        RegionStat::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        RegionStat::Median => median(&mut values.to_vec()),
        RegionStat::StartValue => values[0],
        RegionStat::EndValue => values[values.len() - 1],
        _ => 0.0,
    };
    match stat {
        RegionStat::Sum
        | RegionStat::Avg
        | RegionStat::Min
        | RegionStat::Max
        | RegionStat::Median
        | RegionStat::StartValue
        | RegionStat::EndValue => unweighted(stat),
        RegionStat::WeightedSum
        | RegionStat::WeightedAvg
        | RegionStat::WeightedMin
        | RegionStat::WeightedMax
        | RegionStat::WeightedMedian => {
            let weights = match weights {
                Some(w) if w.len() == values.len() => w,
                _ => {
                    let fallback = match stat {
                        RegionStat::WeightedSum => RegionStat::Sum,
                        RegionStat::WeightedAvg => RegionStat::Avg,
                        RegionStat::WeightedMin => RegionStat::Min,
                        RegionStat::WeightedMax => RegionStat::Max,
                        _ => RegionStat::Median,
                    };
                    return unweighted(fallback);
                }
            };
            let mut scaled: Vec<f64> = values.iter().zip(weights).map(|(v, w)| v * w).collect();
            match stat {
                RegionStat::WeightedSum => scaled.iter().sum(),
                RegionStat::WeightedAvg => {
                    let total: f64 = weights.iter().sum();
                    if total == 0.0 {
                        0.0
                    } else {
                        scaled.iter().sum::<f64>() / total
                    }
                }
                RegionStat::WeightedMin => scaled.iter().copied().fold(f64::INFINITY, f64::min),
                RegionStat::WeightedMax => {
                    scaled.iter().copied().fold(f64::NEG_INFINITY, f64::max)
                }
                _ => median(&mut scaled),
            }
        }
    }
}

/// A per-region comparison in token form, before resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionCondition {
    pub field: RegionField,
    pub comparator: Comparator,
    /// Right operand token: a value for the field comparators, the reference
    /// region track for the interval comparators.
    pub right: String,
    /// Inner numeric comparator for the distance-to-* comparators.
    #[serde(default)]
    pub distance_comparator: Option<Comparator>,
    /// Distance value token for the distance-to-* comparators.
    #[serde(default)]
    pub distance_value: Option<String>,
    #[serde(default)]
    pub right_upper: Option<String>,
    /// Restricts interval searches to reference regions of a matching kind.
    #[serde(default)]
    pub kind_filter: Option<KindMatch>,
    /// Restricts distance searches to interaction partners of the tested
    /// region's motif.
    #[serde(default)]
    pub partners_only: bool,
    #[serde(default)]
    pub negate: bool,
    #[serde(default)]
    pub line: usize,
}

impl RegionCondition {
    pub fn new(field: RegionField, comparator: Comparator, right: &str) -> Self {
        RegionCondition {
            field,
            comparator,
            right: right.to_string(),
            distance_comparator: None,
            distance_value: None,
            right_upper: None,
            kind_filter: None,
            partners_only: false,
            negate: false,
            line: 0,
        }
    }

    pub fn distance(
        comparator: Comparator,
        track: &str,
        inner: Comparator,
        value: &str,
    ) -> Self {
        RegionCondition {
            field: RegionField::Kind,
            comparator,
            right: track.to_string(),
            distance_comparator: Some(inner),
            distance_value: Some(value.to_string()),
            right_upper: None,
            kind_filter: None,
            partners_only: false,
            negate: false,
            line: 0,
        }
    }

    pub fn negated(mut self) -> Self {
        self.negate = true;
        self
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = line;
        self
    }

    pub fn resolve(
        &self,
        ctx: &dyn DataContext,
        motifs: &MotifRegistry,
    ) -> Result<ResolvedRegionCondition, EngineError> {
        let field = match &self.field {
            RegionField::Kind => ResolvedRegionField::Kind,
            RegionField::Score => ResolvedRegionField::Score,
            RegionField::Length => ResolvedRegionField::Length,
            RegionField::Property(name) => ResolvedRegionField::Property(name.clone()),
            RegionField::TrackStat { track, stat } => {
                match resolve_token(track, self.line, ctx)? {
                    Operand::Track(t) => ResolvedRegionField::TrackStat {
                        track: t,
                        stat: *stat,
                    },
                    other => {
                        return Err(EngineError::Resolution {
                            token: track.clone(),
                            line: self.line,
                            reason: format!(
                                "expected a numeric track, found a {}",
                                other.describe()
                            ),
                        })
                    }
                }
            }
        };

        let mut track = None;
        let mut right = None;
        let mut distance_value = None;
        if self.comparator.is_interval() {
            match resolve_token(&self.right, self.line, ctx)? {
                Operand::Regions(t) => track = Some(t),
                other => {
                    return Err(EngineError::Resolution {
                        token: self.right.clone(),
                        line: self.line,
                        reason: format!("expected a region track, found a {}", other.describe()),
                    })
                }
            }
            if let Some(token) = &self.distance_value {
                distance_value = Some(resolve_token(token, self.line, ctx)?);
            }
        } else {
            let operand = match resolve_token(&self.right, self.line, ctx)? {
                // A feature dataset on the right of a value comparison means
                // "read this named property off the region itself".
                Operand::Regions(_) | Operand::Track(_) | Operand::Dna(_) => {
                    Operand::RegionProperty(self.right.clone())
                }
                other => other,
            };
            right = Some(operand);
        }
        let right_upper = match &self.right_upper {
            Some(token) => Some(resolve_token(token, self.line, ctx)?),
            None => None,
        };
        let regex = match &right {
            Some(op) => compile_regex(self.comparator, op, &self.right, self.line)?,
            None => None,
        };
        Ok(ResolvedRegionCondition {
            field,
            comparator: self.comparator,
            distance_comparator: self.distance_comparator,
            right,
            track,
            distance_value,
            right_upper,
            kind_filter: self.kind_filter.clone(),
            partners_only: self.partners_only,
            motifs: Arc::new(motifs.clone()),
            regex,
            negate: self.negate,
        })
    }
}

#[derive(Debug, Clone)]
enum ResolvedRegionField {
    Kind,
    Score,
    Length,
    Property(String),
    TrackStat {
        track: Arc<NumericDataset>,
        stat: RegionStat,
    },
}

/// The resolved, immutable form of a region condition.
#[derive(Debug, Clone)]
pub struct ResolvedRegionCondition {
    field: ResolvedRegionField,
    comparator: Comparator,
    distance_comparator: Option<Comparator>,
    right: Option<Operand>,
    track: Option<Arc<RegionDataset>>,
    distance_value: Option<Operand>,
    right_upper: Option<Operand>,
    kind_filter: Option<KindMatch>,
    partners_only: bool,
    motifs: Arc<MotifRegistry>,
    regex: Option<Regex>,
    negate: bool,
}

impl ResolvedRegionCondition {
    pub fn is_satisfied(&self, seq: &str, region: &Region) -> Result<bool, EngineError> {
        let raw = if self.comparator.is_interval() {
            self.search_track(seq, region)?
        } else {
            self.compare_field(seq, region)?
        };
        Ok(raw != self.negate)
    }

    fn reference_filter(&self, region: &Region) -> RegionFilter {
        let motifs = if self.partners_only {
            Some(
                region
                    .motif
                    .as_ref()
                    .and_then(|id| self.motifs.partners_of(id))
                    .unwrap_or_default(),
            )
        } else {
            None
        };
        RegionFilter {
            kind: self.kind_filter.clone(),
            motifs,
        }
    }

    fn search_track(&self, seq: &str, region: &Region) -> Result<bool, EngineError> {
        let track = self.track.as_ref().ok_or_else(|| {
            EngineError::Invariant("interval comparator resolved without a track".to_string())
        })?;
        let filter = self.reference_filter(region);
        Ok(match self.comparator {
            Comparator::Overlaps => {
                track.any_overlapping(seq, region.start, region.end, &filter)
            }
            Comparator::Inside => track.any_within(seq, region.start, region.end, &filter),
            Comparator::Covers => track.any_spanning(seq, region.start, region.end, &filter),
            Comparator::PresentIn => track.contains_region(seq, region),
            Comparator::SimilarIn => {
                track.contains_similar_region(seq, region, SIMILARITY_SLACK)
            }
            Comparator::DistanceToClosest => {
                match track.distance_to_closest(seq, region.start, region.end, &filter) {
                    None => false,
                    Some(d) => {
                        let (inner, value, upper) = self.distance_operands(seq, region)?;
                        compare_numbers(inner, d as f64, value, upper)?
                    }
                }
            }
            Comparator::DistanceToAny => {
                let (inner, value, upper) = self.distance_operands(seq, region)?;
                let window = distance_window(inner, value as i64, upper.map(|u| u as i64))?;
                track.any_within_distance(seq, region.start, region.end, &window, &filter)
            }
            other => {
                return Err(eval_err(other, "not an interval comparator".to_string()));
            }
        })
    }

    fn distance_operands(
        &self,
        seq: &str,
        region: &Region,
    ) -> Result<(Comparator, f64, Option<f64>), EngineError> {
        let inner = self.distance_comparator.ok_or_else(|| {
            eval_err(
                self.comparator,
                "distance comparison needs an inner comparator".to_string(),
            )
        })?;
        let value = match &self.distance_value {
            Some(op) => match self.right_value(op, seq, region)? {
                EvalValue::Number(n) => n,
                other => {
                    return Err(eval_err(
                        inner,
                        format!("distance operand must be a number, found {}", other.describe()),
                    ))
                }
            },
            None => {
                return Err(eval_err(
                    self.comparator,
                    "distance comparison needs a distance operand".to_string(),
                ))
            }
        };
        let upper = match &self.right_upper {
            Some(op) => match self.right_value(op, seq, region)? {
                EvalValue::Number(n) => Some(n),
                other => {
                    return Err(eval_err(
                        inner,
                        format!(
                            "range upper bound must be a number, found {}",
                            other.describe()
                        ),
                    ))
                }
            },
            None => None,
        };
        Ok((inner, value, upper))
    }

    fn compare_field(&self, seq: &str, region: &Region) -> Result<bool, EngineError> {
        let left = self.field_value(seq, region)?;
        let right_op = self.right.as_ref().ok_or_else(|| {
            EngineError::Invariant("value comparator resolved without a right operand".to_string())
        })?;
        let right = self.right_value(right_op, seq, region)?;
        let upper = match &self.right_upper {
            Some(op) => Some(self.right_value(op, seq, region)?),
            None => None,
        };
        compare_values(self.comparator, left, right, upper, self.regex.as_ref())
    }

    fn field_value(&self, seq: &str, region: &Region) -> Result<EvalValue, EngineError> {
        Ok(match &self.field {
            ResolvedRegionField::Kind => EvalValue::Texts(vec![region.kind.clone()]),
            ResolvedRegionField::Score => EvalValue::Number(region.score),
            ResolvedRegionField::Length => EvalValue::Number(region.length() as f64),
            ResolvedRegionField::Property(name) => property_value(region, name),
            ResolvedRegionField::TrackStat { track, stat } => {
                let values = track
                    .values(seq)
                    .and_then(|v| v.get(region.start..=region.end))
                    .ok_or_else(|| {
                        eval_err(
                            self.comparator,
                            format!("no track values spanning the region on '{seq}'"),
                        )
                    })?;
                let weights = region
                    .motif
                    .as_ref()
                    .and_then(|id| self.motifs.get(id))
                    .map(|m| m.oriented_ic_weights(region.strand));
                EvalValue::Number(region_stat(values, weights.as_deref(), *stat))
            }
        })
    }

    fn right_value<'a>(
        &self,
        op: &'a Operand,
        _seq: &str,
        region: &Region,
    ) -> Result<EvalValue<'a>, EngineError> {
        let cmp = self.comparator;
        Ok(match op {
            Operand::Number(n) => EvalValue::Number(*n),
            // Map operands are keyed by the kind of the region under test.
            Operand::NumericMap(m) => EvalValue::Number(m.value(&region.kind)),
            Operand::TextMap(m) => EvalValue::Texts(m.value(&region.kind).to_vec()),
            Operand::Text(t) => EvalValue::Texts(vec![t.clone()]),
            Operand::TextSet(v) => EvalValue::Texts(v.clone()),
            Operand::Collection(c) => EvalValue::Set(&c.members),
            Operand::Partition(p) => EvalValue::Partition(p),
            Operand::RegionProperty(name) => property_value(region, name),
            Operand::Track(_) | Operand::Regions(_) | Operand::Dna(_) => {
                return Err(eval_err(
                    cmp,
                    "track operands are not valid here".to_string(),
                ))
            }
        })
    }
}

fn property_value<'a>(region: &Region, name: &str) -> EvalValue<'a> {
    match region.property(name) {
        None => EvalValue::Missing,
        Some(pv) => match pv.as_number() {
            Some(n) => EvalValue::Number(n),
            None => EvalValue::Texts(vec![pv.as_text()]),
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AndOr {
    And,
    Or,
}

/// A predicate tree: a leaf comparison or a boolean combination of subtrees.
/// Negation is applied by De Morgan's law at each level, so short-circuiting
/// still works under negation: a negated AND returns true as soon as one
/// child is false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConditionTree<C> {
    Leaf(C),
    Compound {
        op: AndOr,
        children: Vec<ConditionTree<C>>,
        negate: bool,
    },
}

impl<C> ConditionTree<C> {
    pub fn all(children: Vec<ConditionTree<C>>) -> Self {
        ConditionTree::Compound {
            op: AndOr::And,
            children,
            negate: false,
        }
    }

    pub fn any(children: Vec<ConditionTree<C>>) -> Self {
        ConditionTree::Compound {
            op: AndOr::Or,
            children,
            negate: false,
        }
    }

    pub fn compound(op: AndOr, children: Vec<ConditionTree<C>>, negate: bool) -> Self {
        ConditionTree::Compound {
            op,
            children,
            negate,
        }
    }

    fn eval_with<F>(&self, negate: bool, eval_leaf: &F) -> Result<bool, EngineError>
    where
        F: Fn(&C) -> Result<bool, EngineError>,
    {
        match self {
            ConditionTree::Leaf(c) => Ok(eval_leaf(c)? != negate),
            ConditionTree::Compound {
                op,
                children,
                negate: own,
            } => {
                if children.is_empty() {
                    return Ok(true);
                }
                let negate = negate != *own;
                let op = match (op, negate) {
                    (AndOr::And, true) => AndOr::Or,
                    (AndOr::Or, true) => AndOr::And,
                    (op, false) => *op,
                };
                for child in children {
                    let value = child.eval_with(negate, eval_leaf)?;
                    match op {
                        AndOr::And if !value => return Ok(false),
                        AndOr::Or if value => return Ok(true),
                        _ => {}
                    }
                }
                Ok(op == AndOr::And)
            }
        }
    }

    fn try_map<D, F>(&self, f: &F) -> Result<ConditionTree<D>, EngineError>
    where
        F: Fn(&C) -> Result<D, EngineError>,
    {
        Ok(match self {
            ConditionTree::Leaf(c) => ConditionTree::Leaf(f(c)?),
            ConditionTree::Compound {
                op,
                children,
                negate,
            } => ConditionTree::Compound {
                op: *op,
                children: children
                    .iter()
                    .map(|c| c.try_map(f))
                    .collect::<Result<_, _>>()?,
                negate: *negate,
            },
        })
    }
}

impl ConditionTree<PositionCondition> {
    pub fn resolve(
        &self,
        ctx: &dyn DataContext,
    ) -> Result<ConditionTree<ResolvedPositionCondition>, EngineError> {
        self.try_map(&|c| c.resolve(ctx))
    }
}

impl ConditionTree<ResolvedPositionCondition> {
    pub fn is_satisfied(&self, seq: &str, pos: usize) -> Result<bool, EngineError> {
        self.eval_with(false, &|c| c.is_satisfied(seq, pos))
    }
}

impl ConditionTree<RegionCondition> {
    pub fn resolve(
        &self,
        ctx: &dyn DataContext,
        motifs: &MotifRegistry,
    ) -> Result<ConditionTree<ResolvedRegionCondition>, EngineError> {
        self.try_map(&|c| c.resolve(ctx, motifs))
    }
}

impl ConditionTree<ResolvedRegionCondition> {
    pub fn is_satisfied(&self, seq: &str, region: &Region) -> Result<bool, EngineError> {
        self.eval_with(false, &|c| c.is_satisfied(seq, region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{Collection, DataItem, DataStore, NumericMap};
    use crate::feature::{FeatureDataset, Strand};
    use crate::motif::Motif;

    fn store() -> DataStore {
        let mut store = DataStore::new();
        let mut scores = NumericDataset::new();
        scores.add_sequence("chr1", vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0]);
        store.insert("scores", DataItem::Feature(FeatureDataset::Numeric(scores)));

        let mut cutoffs = NumericMap::new(10.0);
        cutoffs.insert("chr1", 2.5);
        store.insert("cutoffs", DataItem::NumericMap(cutoffs));

        let mut sites = RegionDataset::new();
        sites.add_sequence("chr1", 1000);
        sites.add_region("chr1", Region::new(100, 110, "tfbs", 1.0));
        sites.add_region("chr1", Region::new(200, 240, "repeat", 0.5));
        store.insert("sites", DataItem::Feature(FeatureDataset::Regions(sites)));

        store.insert(
            "ab",
            DataItem::Collection(Collection::from_members(["a", "b"])),
        );
        store.insert(
            "abc",
            DataItem::Collection(Collection::from_members(["a", "b", "c"])),
        );
        store
    }

    fn leaf(truth: bool) -> ConditionTree<PositionCondition> {
        let right = if truth { "1" } else { "2" };
        ConditionTree::Leaf(PositionCondition::new("1", Comparator::Eq, right))
    }

    #[test]
    fn test_comparator_parsing() {
        assert_eq!("!=".parse::<Comparator>().unwrap(), Comparator::Ne);
        assert_eq!("<>".parse::<Comparator>().unwrap(), Comparator::Ne);
        assert_eq!(
            "distance to closest".parse::<Comparator>().unwrap(),
            Comparator::DistanceToClosest
        );
        match "almost".parse::<Comparator>() {
            Err(EngineError::Evaluation { comparator, .. }) => assert_eq!(comparator, "almost"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_track_against_map_threshold() -> Result<(), EngineError> {
        let store = store();
        let cond = PositionCondition::new("scores", Comparator::Gt, "cutoffs").resolve(&store)?;
        assert!(!cond.is_satisfied("chr1", 2)?); // 2.0 > 2.5 is false
        assert!(cond.is_satisfied("chr1", 3)?); // 3.0 > 2.5
        Ok(())
    }

    #[test]
    fn test_range_comparator() -> Result<(), EngineError> {
        let store = store();
        let cond = PositionCondition::with_range("scores", "1", "3").resolve(&store)?;
        assert!(!cond.is_satisfied("chr1", 0)?);
        assert!(cond.is_satisfied("chr1", 1)?);
        assert!(cond.is_satisfied("chr1", 3)?);
        assert!(!cond.is_satisfied("chr1", 4)?);
        Ok(())
    }

    #[test]
    fn test_collection_subset_comparators() -> Result<(), EngineError> {
        let store = store();
        let strict = PositionCondition::new("ab", Comparator::Lt, "abc").resolve(&store)?;
        assert!(strict.is_satisfied("chr1", 0)?);
        let reflexive = PositionCondition::new("abc", Comparator::Lt, "abc").resolve(&store)?;
        assert!(!reflexive.is_satisfied("chr1", 0)?);
        let superset = PositionCondition::new("abc", Comparator::Ge, "ab").resolve(&store)?;
        assert!(superset.is_satisfied("chr1", 0)?);
        Ok(())
    }

    #[test]
    fn test_unsupported_collection_comparator_is_an_error() {
        let store = store();
        let cond = PositionCondition::new("ab", Comparator::Matches, "abc")
            .resolve(&store)
            .unwrap();
        match cond.is_satisfied("chr1", 0) {
            Err(EngineError::Evaluation { comparator, .. }) => assert_eq!(comparator, "matches"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_matches_regex() -> Result<(), EngineError> {
        let store = store();
        let cond =
            PositionCondition::new("'tfbs_site'", Comparator::Matches, "'^tfbs'").resolve(&store)?;
        assert!(cond.is_satisfied("chr1", 0)?);
        let cond =
            PositionCondition::new("'other'", Comparator::Matches, "'^tfbs'").resolve(&store)?;
        assert!(!cond.is_satisfied("chr1", 0)?);
        Ok(())
    }

    #[test]
    fn test_de_morgan_equivalence() -> Result<(), EngineError> {
        let store = DataStore::new();
        for op in [AndOr::And, AndOr::Or] {
            for a in [false, true] {
                for b in [false, true] {
                    for c in [false, true] {
                        let children = vec![leaf(a), leaf(b), leaf(c)];
                        let plain = ConditionTree::compound(op, children.clone(), false)
                            .resolve(&store)?
                            .is_satisfied("chr1", 0)?;
                        let negated = ConditionTree::compound(op, children, true)
                            .resolve(&store)?
                            .is_satisfied("chr1", 0)?;
                        assert_eq!(negated, !plain, "op {op:?} children {a} {b} {c}");
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn test_nested_negation() -> Result<(), EngineError> {
        let store = DataStore::new();
        // not(A and not(B or C)) with A=true, B=false, C=false -> not(true and true) -> false
        let inner = ConditionTree::compound(AndOr::Or, vec![leaf(false), leaf(false)], true);
        let tree = ConditionTree::compound(AndOr::And, vec![leaf(true), inner], true);
        assert!(!tree.resolve(&store)?.is_satisfied("chr1", 0)?);
        Ok(())
    }

    #[test]
    fn test_empty_compound_is_vacuously_true() -> Result<(), EngineError> {
        let store = DataStore::new();
        let tree: ConditionTree<PositionCondition> = ConditionTree::all(vec![]);
        assert!(tree.resolve(&store)?.is_satisfied("chr1", 0)?);
        Ok(())
    }

    #[test]
    fn test_distance_window_round_trip() -> Result<(), EngineError> {
        let w = distance_window(Comparator::Eq, 7, None)?;
        assert_eq!(
            w,
            DistanceWindow {
                min: 7,
                max: 7,
                negate: false
            }
        );
        let w = distance_window(Comparator::Ne, 7, None)?;
        for d in [-1i64, 0, 6, 7, 8, 100] {
            assert_eq!(w.matches(d), d != 7, "distance {d}");
        }
        let w = distance_window(Comparator::Lt, 5, None)?;
        assert!(w.matches(-1)); // overlap admitted: lower bound is negative
        assert!(w.matches(4));
        assert!(!w.matches(5));
        let w = distance_window(Comparator::Ge, 0, None)?;
        assert!(!w.matches(-1)); // overlap excluded: lower bound is not negative
        Ok(())
    }

    #[test]
    fn test_region_score_and_kind() -> Result<(), EngineError> {
        let store = store();
        let motifs = MotifRegistry::new();
        let region = Region::new(10, 19, "tfbs", 0.8);
        let cond = RegionCondition::new(RegionField::Score, Comparator::Ge, "0.5")
            .resolve(&store, &motifs)?;
        assert!(cond.is_satisfied("chr1", &region)?);
        let cond = RegionCondition::new(RegionField::Kind, Comparator::Eq, "'tfbs'")
            .resolve(&store, &motifs)?;
        assert!(cond.is_satisfied("chr1", &region)?);
        let cond = RegionCondition::new(RegionField::Length, Comparator::Eq, "10")
            .resolve(&store, &motifs)?;
        assert!(cond.is_satisfied("chr1", &region)?);
        Ok(())
    }

    #[test]
    fn test_region_overlap_search() -> Result<(), EngineError> {
        let store = store();
        let motifs = MotifRegistry::new();
        let cond = RegionCondition::new(RegionField::Kind, Comparator::Overlaps, "sites")
            .resolve(&store, &motifs)?;
        assert!(cond.is_satisfied("chr1", &Region::new(105, 120, "x", 0.0))?);
        assert!(!cond.is_satisfied("chr1", &Region::new(120, 150, "x", 0.0))?);
        Ok(())
    }

    #[test]
    fn test_present_and_similar() -> Result<(), EngineError> {
        let store = store();
        let motifs = MotifRegistry::new();
        let present = RegionCondition::new(RegionField::Kind, Comparator::PresentIn, "sites")
            .resolve(&store, &motifs)?;
        assert!(present.is_satisfied("chr1", &Region::new(100, 110, "tfbs", 0.0))?);
        assert!(!present.is_satisfied("chr1", &Region::new(101, 110, "tfbs", 0.0))?);
        let similar = RegionCondition::new(RegionField::Kind, Comparator::SimilarIn, "sites")
            .resolve(&store, &motifs)?;
        assert!(similar.is_satisfied("chr1", &Region::new(101, 112, "tfbs", 0.0))?);
        assert!(!similar.is_satisfied("chr1", &Region::new(120, 130, "tfbs", 0.0))?);
        Ok(())
    }

    #[test]
    fn test_distance_to_closest_comparison() -> Result<(), EngineError> {
        let store = store();
        let motifs = MotifRegistry::new();
        // Gap between [120, 130] and [100, 110] is 9.
        let region = Region::new(120, 130, "x", 0.0);
        let cond =
            RegionCondition::distance(Comparator::DistanceToClosest, "sites", Comparator::Eq, "9")
                .resolve(&store, &motifs)?;
        assert!(cond.is_satisfied("chr1", &region)?);
        let cond =
            RegionCondition::distance(Comparator::DistanceToClosest, "sites", Comparator::Lt, "9")
                .resolve(&store, &motifs)?;
        assert!(!cond.is_satisfied("chr1", &region)?);
        Ok(())
    }

    #[test]
    fn test_distance_to_any_window() -> Result<(), EngineError> {
        let store = store();
        let motifs = MotifRegistry::new();
        let region = Region::new(120, 130, "x", 0.0);
        // Regions at gap 9 ([100,110]) and gap 69 ([200,240]).
        let cond =
            RegionCondition::distance(Comparator::DistanceToAny, "sites", Comparator::Le, "10")
                .resolve(&store, &motifs)?;
        assert!(cond.is_satisfied("chr1", &region)?);
        let cond =
            RegionCondition::distance(Comparator::DistanceToAny, "sites", Comparator::In, "20")
                .resolve(&store, &motifs)?;
        // No upper bound provided: the range form must be rejected.
        assert!(cond.is_satisfied("chr1", &region).is_err());
        Ok(())
    }

    #[test]
    fn test_weighted_stat_falls_back_without_motif() -> Result<(), EngineError> {
        let store = store();
        let mut motifs = MotifRegistry::new();
        motifs.insert(Motif::new(
            "M1",
            None,
            vec![
                [8.0, 0.0, 0.0, 0.0],
                [2.0, 2.0, 2.0, 2.0],
                [8.0, 0.0, 0.0, 0.0],
            ],
        ));
        let field = RegionField::TrackStat {
            track: "scores".to_string(),
            stat: RegionStat::WeightedSum,
        };
        // chr1 scores over [1, 3] are [1, 2, 3]; IC weights are [2, 0, 2].
        let mut with_motif = Region::new(1, 3, "tfbs", 0.0);
        with_motif.motif = Some("M1".to_string());
        let cond = RegionCondition::new(field.clone(), Comparator::Eq, "8")
            .resolve(&store, &motifs)?;
        assert!(cond.is_satisfied("chr1", &with_motif)?);

        // Reverse strand reads the weights back to front: same symmetric sum.
        with_motif.strand = Strand::Reverse;
        assert!(cond.is_satisfied("chr1", &with_motif)?);

        // Without a motif the stat falls back to the plain sum 6.
        let plain = Region::new(1, 3, "tfbs", 0.0);
        let cond = RegionCondition::new(field, Comparator::Eq, "6").resolve(&store, &motifs)?;
        assert!(cond.is_satisfied("chr1", &plain)?);
        Ok(())
    }

    #[test]
    fn test_missing_property_is_unsatisfied_not_an_error() -> Result<(), EngineError> {
        let store = store();
        let motifs = MotifRegistry::new();
        let region = Region::new(0, 5, "tfbs", 0.0);
        let cond = RegionCondition::new(
            RegionField::Property("conservation".to_string()),
            Comparator::Gt,
            "0.5",
        )
        .resolve(&store, &motifs)?;
        assert!(!cond.is_satisfied("chr1", &region)?);
        Ok(())
    }
}
