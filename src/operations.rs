use serde::{Deserialize, Serialize};

use crate::condition::{
    ConditionTree, PositionCondition, RegionCondition, ResolvedPositionCondition,
    ResolvedRegionCondition,
};
use crate::data::{DataItem, DataStore, NumericMap};
use crate::error::EngineError;
use crate::executor::{run_sequence_tasks, RunStatus};
use crate::feature::{
    DnaDataset, FeatureDataset, KindMatch, NumericDataset, Region, RegionDataset, RegionFilter,
};
use crate::motif::MotifRegistry;
use crate::operand::Operand;
use crate::task::{NullMonitor, TaskMonitor};

pub type OpId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountMode {
    Overlapping,
    Within,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaskMode {
    Letter(char),
    Lowercase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvertValue {
    Score,
    Count,
    One,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformFunction {
    Add,
    Subtract,
    Multiply,
    Divide,
    Min,
    Max,
    Power,
    Abs,
    Log,
    Log2,
    Sqrt,
}

impl TransformFunction {
    fn needs_argument(&self) -> bool {
        matches!(
            self,
            TransformFunction::Add
                | TransformFunction::Subtract
                | TransformFunction::Multiply
                | TransformFunction::Divide
                | TransformFunction::Min
                | TransformFunction::Max
                | TransformFunction::Power
        )
    }

    fn name(&self) -> &'static str {
        match self {
            TransformFunction::Add => "add",
            TransformFunction::Subtract => "subtract",
            TransformFunction::Multiply => "multiply",
            TransformFunction::Divide => "divide",
            TransformFunction::Min => "min",
            TransformFunction::Max => "max",
            TransformFunction::Power => "power",
            TransformFunction::Abs => "abs",
            TransformFunction::Log => "log",
            TransformFunction::Log2 => "log2",
            TransformFunction::Sqrt => "sqrt",
        }
    }

    fn apply(&self, value: f64, argument: f64) -> f64 {
        match self {
            TransformFunction::Add => value + argument,
            TransformFunction::Subtract => value - argument,
            TransformFunction::Multiply => value * argument,
            TransformFunction::Divide => value / argument,
            TransformFunction::Min => value.min(argument),
            TransformFunction::Max => value.max(argument),
            TransformFunction::Power => value.powf(argument),
            TransformFunction::Abs => value.abs(),
            TransformFunction::Log => value.ln(),
            TransformFunction::Log2 => value.log2(),
            TransformFunction::Sqrt => value.sqrt(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DatasetStat {
    Min,
    Max,
    Avg,
    Sum,
    Median,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombineMethod {
    Sum,
    Product,
    Min,
    Max,
    Avg,
}

/// A feature-transform request over named datasets. The `condition` and
/// `within` fields restrict where the transform applies; positions and
/// regions that do not qualify pass through unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    /// Writes, at every qualifying position, the number of source regions
    /// overlapping (or contained in) the window centered on that position.
    Count {
        source: String,
        target: String,
        window_size: usize,
        mode: CountMode,
        #[serde(default)]
        condition: Option<ConditionTree<PositionCondition>>,
        #[serde(default)]
        within: Option<String>,
    },
    /// Grows qualifying regions by a fixed number of positions on each side.
    Extend {
        source: String,
        target: String,
        upstream: usize,
        downstream: usize,
        #[serde(default)]
        condition: Option<ConditionTree<RegionCondition>>,
    },
    /// Coalesces qualifying regions whose start-to-end distance does not
    /// exceed `distance`, left to right.
    Merge {
        source: String,
        target: String,
        distance: usize,
        #[serde(default)]
        condition: Option<ConditionTree<RegionCondition>>,
    },
    /// Overwrites the bases covered by qualifying regions of a region track.
    Mask {
        source: String,
        target: String,
        regions: String,
        mode: MaskMode,
        #[serde(default)]
        condition: Option<ConditionTree<RegionCondition>>,
    },
    /// Region track to numeric track.
    ConvertToNumeric {
        source: String,
        target: String,
        value: ConvertValue,
        #[serde(default)]
        condition: Option<ConditionTree<RegionCondition>>,
    },
    /// Numeric track to region track: maximal runs of qualifying positions
    /// become regions scored by the run's mean value.
    ConvertToRegions {
        source: String,
        target: String,
        kind: String,
        condition: ConditionTree<PositionCondition>,
    },
    /// Per-position arithmetic on a numeric track.
    Transform {
        source: String,
        target: String,
        function: TransformFunction,
        #[serde(default)]
        argument: Option<String>,
        #[serde(default)]
        condition: Option<ConditionTree<PositionCondition>>,
        #[serde(default)]
        within: Option<String>,
    },
    /// Collapses a numeric track into a number, or into a per-sequence
    /// numeric map.
    Statistic {
        source: String,
        target: String,
        stat: DatasetStat,
        per_sequence: bool,
    },
    /// Position-wise combination of several numeric tracks.
    Combine {
        sources: Vec<String>,
        target: String,
        method: CombineMethod,
    },
    /// Numeric track of distances to the closest region of a track: 0 inside
    /// a region, -1 where the sequence has no qualifying region at all.
    Distance {
        regions: String,
        target: String,
        #[serde(default)]
        kind_filter: Option<KindMatch>,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::Count { .. } => "count",
            Operation::Extend { .. } => "extend",
            Operation::Merge { .. } => "merge",
            Operation::Mask { .. } => "mask",
            Operation::ConvertToNumeric { .. } => "convert",
            Operation::ConvertToRegions { .. } => "convert",
            Operation::Transform { .. } => "transform",
            Operation::Statistic { .. } => "statistic",
            Operation::Combine { .. } => "combine",
            Operation::Distance { .. } => "distance",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpResult {
    pub op_id: OpId,
    pub created: Vec<String>,
    pub changed: Vec<String>,
    pub warnings: Vec<String>,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRecord {
    pub op: Operation,
    pub result: OpResult,
}

/// The transform engine: a data store, a motif registry, and an operation
/// journal.
#[derive(Debug, Default)]
pub struct MotifEngine {
    store: DataStore,
    motifs: MotifRegistry,
    journal: Vec<OperationRecord>,
    op_counter: u64,
    status: RunStatus,
}

/// Resolved transform argument: a constant or a per-sequence map.
enum TransformArg {
    None,
    Number(f64),
    Map(NumericMap),
}

impl TransformArg {
    fn for_sequence(&self, seq: &str) -> f64 {
        match self {
            TransformArg::None => 0.0,
            TransformArg::Number(n) => *n,
            TransformArg::Map(m) => m.value(seq),
        }
    }
}

impl MotifEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_store(store: DataStore) -> Self {
        MotifEngine {
            store,
            ..Self::default()
        }
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut DataStore {
        &mut self.store
    }

    pub fn motifs(&self) -> &MotifRegistry {
        &self.motifs
    }

    pub fn motifs_mut(&mut self) -> &mut MotifRegistry {
        &mut self.motifs
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn operation_log(&self) -> &[OperationRecord] {
        &self.journal
    }

    fn next_op_id(&mut self) -> OpId {
        self.op_counter += 1;
        format!("op-{}", self.op_counter)
    }

    pub fn apply(&mut self, op: Operation) -> Result<OpResult, EngineError> {
        self.apply_with_monitor(op, &NullMonitor)
    }

    pub fn apply_with_monitor(
        &mut self,
        op: Operation,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        self.status = RunStatus::Resolving;
        let outcome = self.execute(&op, monitor);
        self.status = match &outcome {
            Ok(_) => RunStatus::Completed,
            Err(EngineError::Interrupted) => RunStatus::Aborted,
            Err(_) => RunStatus::Failed,
        };
        let result = outcome?;
        self.journal.push(OperationRecord {
            op,
            result: result.clone(),
        });
        Ok(result)
    }

    fn execute(
        &mut self,
        op: &Operation,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        match op {
            Operation::Count {
                source,
                target,
                window_size,
                mode,
                condition,
                within,
            } => self.run_count(source, target, *window_size, *mode, condition, within, monitor),
            Operation::Extend {
                source,
                target,
                upstream,
                downstream,
                condition,
            } => self.run_extend(source, target, *upstream, *downstream, condition, monitor),
            Operation::Merge {
                source,
                target,
                distance,
                condition,
            } => self.run_merge(source, target, *distance, condition, monitor),
            Operation::Mask {
                source,
                target,
                regions,
                mode,
                condition,
            } => self.run_mask(source, target, regions, *mode, condition, monitor),
            Operation::ConvertToNumeric {
                source,
                target,
                value,
                condition,
            } => self.run_convert_to_numeric(source, target, *value, condition, monitor),
            Operation::ConvertToRegions {
                source,
                target,
                kind,
                condition,
            } => self.run_convert_to_regions(source, target, kind, condition, monitor),
            Operation::Transform {
                source,
                target,
                function,
                argument,
                condition,
                within,
            } => self.run_transform(
                source, target, *function, argument, condition, within, monitor,
            ),
            Operation::Statistic {
                source,
                target,
                stat,
                per_sequence,
            } => self.run_statistic(source, target, *stat, *per_sequence, monitor),
            Operation::Combine {
                sources,
                target,
                method,
            } => self.run_combine(sources, target, *method, monitor),
            Operation::Distance {
                regions,
                target,
                kind_filter,
            } => self.run_distance(regions, target, kind_filter, monitor),
        }
    }

    fn numeric_source(&self, name: &str) -> Result<NumericDataset, EngineError> {
        match self.store.get_feature(name)? {
            FeatureDataset::Numeric(d) => Ok(d.clone()),
            other => Err(EngineError::Resolution {
                token: name.to_string(),
                line: 0,
                reason: format!("expected a numeric dataset, found a {} dataset", other.kind_name()),
            }),
        }
    }

    fn region_source(&self, name: &str) -> Result<RegionDataset, EngineError> {
        match self.store.get_feature(name)? {
            FeatureDataset::Regions(d) => Ok(d.clone()),
            other => Err(EngineError::Resolution {
                token: name.to_string(),
                line: 0,
                reason: format!("expected a region dataset, found a {} dataset", other.kind_name()),
            }),
        }
    }

    fn dna_source(&self, name: &str) -> Result<DnaDataset, EngineError> {
        match self.store.get_feature(name)? {
            FeatureDataset::Dna(d) => Ok(d.clone()),
            other => Err(EngineError::Resolution {
                token: name.to_string(),
                line: 0,
                reason: format!("expected a dna dataset, found a {} dataset", other.kind_name()),
            }),
        }
    }

    fn resolve_position_condition(
        &self,
        condition: &Option<ConditionTree<PositionCondition>>,
    ) -> Result<Option<ConditionTree<ResolvedPositionCondition>>, EngineError> {
        condition.as_ref().map(|c| c.resolve(&self.store)).transpose()
    }

    fn resolve_region_condition(
        &self,
        condition: &Option<ConditionTree<RegionCondition>>,
    ) -> Result<Option<ConditionTree<ResolvedRegionCondition>>, EngineError> {
        condition
            .as_ref()
            .map(|c| c.resolve(&self.store, &self.motifs))
            .transpose()
    }

    fn resolve_within(&self, within: &Option<String>) -> Result<Option<RegionDataset>, EngineError> {
        within.as_ref().map(|name| self.region_source(name)).transpose()
    }

    /// Commits a fully built double-buffer under the target name.
    fn commit(&mut self, target: &str, item: DataItem, op_name: &str) -> OpResult {
        let existed = self.store.contains(target);
        self.store.insert(target, item);
        let op_id = self.next_op_id();
        OpResult {
            op_id,
            created: if existed {
                vec![]
            } else {
                vec![target.to_string()]
            },
            changed: if existed {
                vec![target.to_string()]
            } else {
                vec![]
            },
            warnings: vec![],
            messages: vec![format!("{op_name}: committed '{target}'")],
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn run_count(
        &mut self,
        source: &str,
        target: &str,
        window_size: usize,
        mode: CountMode,
        condition: &Option<ConditionTree<PositionCondition>>,
        within: &Option<String>,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        let regions = self.region_source(source)?;
        let cond = self.resolve_position_condition(condition)?;
        let within = self.resolve_within(within)?;
        self.status = RunStatus::Running;

        let half = window_size / 2;
        let no_filter = RegionFilter::default();
        let slots: Vec<(String, Vec<f64>)> = regions
            .sequence_names()
            .into_iter()
            .map(|name| {
                let len = regions.sequence_length(&name).unwrap_or(0);
                (name, vec![0.0; len])
            })
            .collect();

        let slots = run_sequence_tasks("count", slots, monitor, |name, slot, ctx| {
            let len = slot.len();
            for p in 0..len {
                ctx.checkpoint(p)?;
                if let Some(w) = &within {
                    if !w.any_overlapping(name, p, p, &no_filter) {
                        continue;
                    }
                }
                if let Some(cond) = &cond {
                    if !cond.is_satisfied(name, p)? {
                        continue;
                    }
                }
                let lo = p.saturating_sub(half);
                let hi = (p + half).min(len - 1);
                let n = match mode {
                    CountMode::Overlapping => regions.regions_overlapping(name, lo, hi).len(),
                    CountMode::Within => regions
                        .regions(name)
                        .iter()
                        .filter(|r| r.within_range(lo, hi))
                        .count(),
                };
                slot[p] = n as f64;
            }
            Ok(())
        })?;

        let mut out = NumericDataset::new();
        for (name, values) in slots {
            out.add_sequence(&name, values);
        }
        out.recompute_range();
        Ok(self.commit(target, DataItem::Feature(FeatureDataset::Numeric(out)), "count"))
    }

    fn run_extend(
        &mut self,
        source: &str,
        target: &str,
        upstream: usize,
        downstream: usize,
        condition: &Option<ConditionTree<RegionCondition>>,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        let regions = self.region_source(source)?;
        let cond = self.resolve_region_condition(condition)?;
        self.status = RunStatus::Running;

        let slots: Vec<(String, Vec<Region>)> = regions
            .sequence_names()
            .into_iter()
            .map(|name| (name, Vec::new()))
            .collect();

        let slots = run_sequence_tasks("extend", slots, monitor, |name, slot, ctx| {
            let len = regions.sequence_length(name).unwrap_or(usize::MAX);
            for (i, region) in regions.regions(name).iter().enumerate() {
                ctx.checkpoint(i)?;
                let qualifies = match &cond {
                    Some(cond) => cond.is_satisfied(name, region)?,
                    None => true,
                };
                let mut region = region.clone();
                if qualifies {
                    region.start = region.start.saturating_sub(upstream);
                    region.end = (region.end + downstream).min(len.saturating_sub(1));
                }
                slot.push(region);
            }
            Ok(())
        })?;

        let mut out = RegionDataset::new();
        for name in regions.sequence_names() {
            out.add_sequence(&name, regions.sequence_length(&name).unwrap_or(0));
        }
        for (name, list) in slots {
            out.set_regions(&name, list);
        }
        Ok(self.commit(target, DataItem::Feature(FeatureDataset::Regions(out)), "extend"))
    }

    fn run_merge(
        &mut self,
        source: &str,
        target: &str,
        distance: usize,
        condition: &Option<ConditionTree<RegionCondition>>,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        let regions = self.region_source(source)?;
        let cond = self.resolve_region_condition(condition)?;
        self.status = RunStatus::Running;

        let slots: Vec<(String, Vec<Region>)> = regions
            .sequence_names()
            .into_iter()
            .map(|name| (name, Vec::new()))
            .collect();

        let slots = run_sequence_tasks("merge", slots, monitor, |name, slot, ctx| {
            // Left-to-right coalescing over the sorted region list.
            let mut current: Option<Region> = None;
            for (i, region) in regions.regions(name).iter().enumerate() {
                ctx.checkpoint(i)?;
                let qualifies = match &cond {
                    Some(cond) => cond.is_satisfied(name, region)?,
                    None => true,
                };
                if !qualifies {
                    slot.push(region.clone());
                    continue;
                }
                match current.as_mut() {
                    Some(last) if region.start as i64 - last.end as i64 <= distance as i64 => {
                        last.end = last.end.max(region.end);
                        last.score = last.score.max(region.score);
                    }
                    _ => {
                        if let Some(done) = current.take() {
                            slot.push(done);
                        }
                        current = Some(region.clone());
                    }
                }
            }
            if let Some(done) = current.take() {
                slot.push(done);
            }
            Ok(())
        })?;

        let mut out = RegionDataset::new();
        for name in regions.sequence_names() {
            out.add_sequence(&name, regions.sequence_length(&name).unwrap_or(0));
        }
        for (name, list) in slots {
            out.set_regions(&name, list);
        }
        Ok(self.commit(target, DataItem::Feature(FeatureDataset::Regions(out)), "merge"))
    }

    fn run_mask(
        &mut self,
        source: &str,
        target: &str,
        regions: &str,
        mode: MaskMode,
        condition: &Option<ConditionTree<RegionCondition>>,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        let dna = self.dna_source(source)?;
        let mask_track = self.region_source(regions)?;
        let cond = self.resolve_region_condition(condition)?;
        self.status = RunStatus::Running;

        let slots: Vec<(String, Vec<u8>)> = dna
            .sequence_names()
            .into_iter()
            .map(|name| {
                let bases = dna.bases(&name).unwrap_or(&[]).to_vec();
                (name, bases)
            })
            .collect();

        let slots = run_sequence_tasks("mask", slots, monitor, |name, slot, ctx| {
            let len = slot.len();
            for (i, region) in mask_track.regions(name).iter().enumerate() {
                ctx.checkpoint(i)?;
                if let Some(cond) = &cond {
                    if !cond.is_satisfied(name, region)? {
                        continue;
                    }
                }
                if region.start >= len {
                    continue;
                }
                for pos in region.start..=region.end.min(len - 1) {
                    slot[pos] = match mode {
                        MaskMode::Letter(c) => c as u8,
                        MaskMode::Lowercase => slot[pos].to_ascii_lowercase(),
                    };
                }
            }
            Ok(())
        })?;

        let mut out = DnaDataset::new();
        for (name, bases) in slots {
            out.set_bases(&name, bases);
        }
        Ok(self.commit(target, DataItem::Feature(FeatureDataset::Dna(out)), "mask"))
    }

    fn run_convert_to_numeric(
        &mut self,
        source: &str,
        target: &str,
        value: ConvertValue,
        condition: &Option<ConditionTree<RegionCondition>>,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        let regions = self.region_source(source)?;
        let cond = self.resolve_region_condition(condition)?;
        self.status = RunStatus::Running;

        let slots: Vec<(String, Vec<f64>)> = regions
            .sequence_names()
            .into_iter()
            .map(|name| {
                let len = regions.sequence_length(&name).unwrap_or(0);
                (name, vec![0.0; len])
            })
            .collect();

        let slots = run_sequence_tasks("convert", slots, monitor, |name, slot, ctx| {
            let len = slot.len();
            for (i, region) in regions.regions(name).iter().enumerate() {
                ctx.checkpoint(i)?;
                if let Some(cond) = &cond {
                    if !cond.is_satisfied(name, region)? {
                        continue;
                    }
                }
                if region.start >= len {
                    continue;
                }
                for pos in region.start..=region.end.min(len - 1) {
                    slot[pos] = match value {
                        ConvertValue::Score => slot[pos].max(region.score),
                        ConvertValue::Count => slot[pos] + 1.0,
                        ConvertValue::One => 1.0,
                    };
                }
            }
            Ok(())
        })?;

        let mut out = NumericDataset::new();
        for (name, values) in slots {
            out.add_sequence(&name, values);
        }
        out.recompute_range();
        Ok(self.commit(target, DataItem::Feature(FeatureDataset::Numeric(out)), "convert"))
    }

    fn run_convert_to_regions(
        &mut self,
        source: &str,
        target: &str,
        kind: &str,
        condition: &ConditionTree<PositionCondition>,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        let track = self.numeric_source(source)?;
        let cond = condition.resolve(&self.store)?;
        self.status = RunStatus::Running;

        let slots: Vec<(String, Vec<Region>)> = track
            .sequence_names()
            .into_iter()
            .map(|name| (name, Vec::new()))
            .collect();

        let slots = run_sequence_tasks("convert", slots, monitor, |name, slot, ctx| {
            let values = track.values(name).unwrap_or(&[]);
            let mut run_start: Option<usize> = None;
            for p in 0..=values.len() {
                ctx.checkpoint(p)?;
                let qualifies = p < values.len() && cond.is_satisfied(name, p)?;
                match (qualifies, run_start) {
                    (true, None) => run_start = Some(p),
                    (false, Some(start)) => {
                        let span = &values[start..p];
                        let score = span.iter().sum::<f64>() / span.len() as f64;
                        slot.push(Region::new(start, p - 1, kind, score));
                        run_start = None;
                    }
                    _ => {}
                }
            }
            Ok(())
        })?;

        let mut out = RegionDataset::new();
        for name in track.sequence_names() {
            out.add_sequence(&name, track.sequence_length(&name).unwrap_or(0));
        }
        for (name, list) in slots {
            out.set_regions(&name, list);
        }
        Ok(self.commit(target, DataItem::Feature(FeatureDataset::Regions(out)), "convert"))
    }

    #[allow(clippy::too_many_arguments)]
    fn run_transform(
        &mut self,
        source: &str,
        target: &str,
        function: TransformFunction,
        argument: &Option<String>,
        condition: &Option<ConditionTree<PositionCondition>>,
        within: &Option<String>,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        let track = self.numeric_source(source)?;
        let cond = self.resolve_position_condition(condition)?;
        let within = self.resolve_within(within)?;
        let arg = match argument {
            None => {
                if function.needs_argument() {
                    return Err(EngineError::Evaluation {
                        comparator: function.name().to_string(),
                        detail: "transform function requires an argument".to_string(),
                    });
                }
                TransformArg::None
            }
            Some(token) => match crate::operand::resolve_token(token, 0, &self.store)? {
                Operand::Number(n) => TransformArg::Number(n),
                Operand::NumericMap(m) => TransformArg::Map((*m).clone()),
                other => {
                    return Err(EngineError::Resolution {
                        token: token.clone(),
                        line: 0,
                        reason: format!(
                            "transform argument must be a number or numeric map, found a {}",
                            other.describe()
                        ),
                    })
                }
            },
        };
        self.status = RunStatus::Running;

        let no_filter = RegionFilter::default();
        let slots: Vec<(String, Vec<f64>)> = track
            .sequence_names()
            .into_iter()
            .map(|name| {
                let values = track.values(&name).unwrap_or(&[]).to_vec();
                (name, values)
            })
            .collect();

        let slots = run_sequence_tasks("transform", slots, monitor, |name, slot, ctx| {
            let argument = arg.for_sequence(name);
            for p in 0..slot.len() {
                ctx.checkpoint(p)?;
                if let Some(w) = &within {
                    if !w.any_overlapping(name, p, p, &no_filter) {
                        continue;
                    }
                }
                if let Some(cond) = &cond {
                    if !cond.is_satisfied(name, p)? {
                        continue;
                    }
                }
                slot[p] = function.apply(slot[p], argument);
            }
            Ok(())
        })?;

        let mut out = NumericDataset::new();
        for (name, values) in slots {
            out.add_sequence(&name, values);
        }
        out.recompute_range();
        Ok(self.commit(target, DataItem::Feature(FeatureDataset::Numeric(out)), "transform"))
    }

    fn run_statistic(
        &mut self,
        source: &str,
        target: &str,
        stat: DatasetStat,
        per_sequence: bool,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        let track = self.numeric_source(source)?;
        self.status = RunStatus::Running;

        #[derive(Default)]
        struct Partial {
            sum: f64,
            count: usize,
            min: f64,
            max: f64,
            values: Vec<f64>,
        }

        let collect_values = stat == DatasetStat::Median;
        let slots: Vec<(String, Partial)> = track
            .sequence_names()
            .into_iter()
            .map(|name| (name, Partial::default()))
            .collect();

        let slots = run_sequence_tasks("statistic", slots, monitor, |name, slot, ctx| {
            let values = track.values(name).unwrap_or(&[]);
            slot.min = f64::INFINITY;
            slot.max = f64::NEG_INFINITY;
            for (p, v) in values.iter().enumerate() {
                ctx.checkpoint(p)?;
                slot.sum += v;
                slot.count += 1;
                slot.min = slot.min.min(*v);
                slot.max = slot.max.max(*v);
            }
            if collect_values {
                slot.values = values.to_vec();
            }
            Ok(())
        })?;

        let finish = |partial: &Partial| -> f64 {
            if partial.count == 0 {
                return 0.0;
            }
            match stat {
                DatasetStat::Sum => partial.sum,
                DatasetStat::Avg => partial.sum / partial.count as f64,
                DatasetStat::Min => partial.min,
                DatasetStat::Max => partial.max,
                DatasetStat::Median => {
                    let mut values = partial.values.clone();
                    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                    let mid = values.len() / 2;
                    if values.len() % 2 == 1 {
                        values[mid]
                    } else {
                        (values[mid - 1] + values[mid]) / 2.0
                    }
                }
            }
        };

        let item = if per_sequence {
            let mut map = NumericMap::new(0.0);
            for (name, partial) in &slots {
                map.insert(name, finish(partial));
            }
            DataItem::NumericMap(map)
        } else {
            let mut total = Partial {
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
                ..Partial::default()
            };
            for (_, partial) in &slots {
                total.sum += partial.sum;
                total.count += partial.count;
                total.min = total.min.min(partial.min);
                total.max = total.max.max(partial.max);
                total.values.extend_from_slice(&partial.values);
            }
            DataItem::Number(finish(&total))
        };
        Ok(self.commit(target, item, "statistic"))
    }

    fn run_combine(
        &mut self,
        sources: &[String],
        target: &str,
        method: CombineMethod,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        if sources.is_empty() {
            return Err(EngineError::Resolution {
                token: "combine".to_string(),
                line: 0,
                reason: "at least one source dataset is required".to_string(),
            });
        }
        let tracks: Vec<NumericDataset> = sources
            .iter()
            .map(|name| self.numeric_source(name))
            .collect::<Result<_, _>>()?;
        let first = &tracks[0];
        for (name, track) in sources.iter().zip(&tracks) {
            for seq in first.sequence_names() {
                if track.sequence_length(&seq) != first.sequence_length(&seq) {
                    return Err(EngineError::Resolution {
                        token: name.clone(),
                        line: 0,
                        reason: format!("sequence layout differs from '{}' on '{seq}'", sources[0]),
                    });
                }
            }
        }
        self.status = RunStatus::Running;

        let slots: Vec<(String, Vec<f64>)> = first
            .sequence_names()
            .into_iter()
            .map(|name| {
                let len = first.sequence_length(&name).unwrap_or(0);
                (name, vec![0.0; len])
            })
            .collect();

        let tracks = &tracks;
        let slots = run_sequence_tasks("combine", slots, monitor, |name, slot, ctx| {
            let slices: Vec<&[f64]> = tracks
                .iter()
                .map(|t| {
                    t.values(name).ok_or_else(|| {
                        EngineError::Invariant(format!("combine lost sequence '{name}'"))
                    })
                })
                .collect::<Result<_, _>>()?;
            for p in 0..slot.len() {
                ctx.checkpoint(p)?;
                let mut acc = slices[0][p];
                for s in &slices[1..] {
                    let v = s[p];
                    acc = match method {
                        CombineMethod::Sum | CombineMethod::Avg => acc + v,
                        CombineMethod::Product => acc * v,
                        CombineMethod::Min => acc.min(v),
                        CombineMethod::Max => acc.max(v),
                    };
                }
                if method == CombineMethod::Avg {
                    acc /= slices.len() as f64;
                }
                slot[p] = acc;
            }
            Ok(())
        })?;

        let mut out = NumericDataset::new();
        for (name, values) in slots {
            out.add_sequence(&name, values);
        }
        out.recompute_range();
        Ok(self.commit(target, DataItem::Feature(FeatureDataset::Numeric(out)), "combine"))
    }

    fn run_distance(
        &mut self,
        regions: &str,
        target: &str,
        kind_filter: &Option<KindMatch>,
        monitor: &dyn TaskMonitor,
    ) -> Result<OpResult, EngineError> {
        let track = self.region_source(regions)?;
        self.status = RunStatus::Running;

        let filter = RegionFilter {
            kind: kind_filter.clone(),
            motifs: None,
        };
        let slots: Vec<(String, Vec<f64>)> = track
            .sequence_names()
            .into_iter()
            .map(|name| {
                let len = track.sequence_length(&name).unwrap_or(0);
                (name, vec![0.0; len])
            })
            .collect();

        let slots = run_sequence_tasks("distance", slots, monitor, |name, slot, ctx| {
            for p in 0..slot.len() {
                ctx.checkpoint(p)?;
                slot[p] = match track.distance_to_closest(name, p, p, &filter) {
                    None => -1.0,
                    Some(d) if d < 0 => 0.0,
                    Some(d) => d as f64,
                };
            }
            Ok(())
        })?;

        let mut out = NumericDataset::new();
        for (name, values) in slots {
            out.add_sequence(&name, values);
        }
        out.recompute_range();
        Ok(self.commit(target, DataItem::Feature(FeatureDataset::Numeric(out)), "distance"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Comparator;
    use crate::data::DataContext;

    fn engine_with_regions() -> MotifEngine {
        let mut store = DataStore::new();
        let mut regions = RegionDataset::new();
        for name in ["chr1", "chr2", "chr3"] {
            regions.add_sequence(name, 40);
        }
        regions.add_region("chr1", Region::new(10, 14, "tfbs", 1.0));
        regions.add_region("chr1", Region::new(20, 24, "tfbs", 2.0));
        store.insert("sites", DataItem::Feature(FeatureDataset::Regions(regions)));
        MotifEngine::from_store(store)
    }

    fn expected_count(regions: &[(usize, usize)], len: usize, half: usize) -> Vec<f64> {
        (0..len)
            .map(|p| {
                let lo = p.saturating_sub(half);
                let hi = (p + half).min(len - 1);
                regions
                    .iter()
                    .filter(|(s, e)| *s <= hi && *e >= lo)
                    .count() as f64
            })
            .collect()
    }

    fn count_op() -> Operation {
        Operation::Count {
            source: "sites".to_string(),
            target: "coverage".to_string(),
            window_size: 5,
            mode: CountMode::Overlapping,
            condition: None,
            within: None,
        }
    }

    fn numeric_values(engine: &MotifEngine, name: &str, seq: &str) -> Vec<f64> {
        match engine.store().lookup(name) {
            Some(DataItem::Feature(FeatureDataset::Numeric(d))) => {
                d.values(seq).unwrap_or(&[]).to_vec()
            }
            other => panic!("expected numeric dataset, found {other:?}"),
        }
    }

    fn region_list(engine: &MotifEngine, name: &str, seq: &str) -> Vec<(usize, usize)> {
        match engine.store().lookup(name) {
            Some(DataItem::Feature(FeatureDataset::Regions(d))) => {
                d.regions(seq).iter().map(|r| (r.start, r.end)).collect()
            }
            other => panic!("expected region dataset, found {other:?}"),
        }
    }

    #[test]
    fn test_count_matches_hand_computed_values() -> Result<(), EngineError> {
        let mut engine = engine_with_regions();
        engine.apply(count_op())?;
        let expected = expected_count(&[(10, 14), (20, 24)], 40, 2);
        assert_eq!(numeric_values(&engine, "coverage", "chr1"), expected);
        assert_eq!(numeric_values(&engine, "coverage", "chr2"), vec![0.0; 40]);
        Ok(())
    }

    #[test]
    fn test_count_is_deterministic_across_pool_sizes() -> Result<(), EngineError> {
        let mut parallel = engine_with_regions();
        parallel.apply(count_op())?;
        let wide = numeric_values(&parallel, "coverage", "chr1");

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .map_err(|e| EngineError::Invariant(e.to_string()))?;
        let mut sequential = engine_with_regions();
        pool.install(|| sequential.apply(count_op()))?;
        let narrow = numeric_values(&sequential, "coverage", "chr1");

        assert_eq!(wide, narrow);
        Ok(())
    }

    #[test]
    fn test_merge_distance_threshold() -> Result<(), EngineError> {
        let mut store = DataStore::new();
        let mut regions = RegionDataset::new();
        regions.add_sequence("chr1", 500);
        regions.add_region("chr1", Region::new(100, 110, "site", 1.0));
        regions.add_region("chr1", Region::new(115, 130, "site", 2.0));
        store.insert("sites", DataItem::Feature(FeatureDataset::Regions(regions)));

        let mut engine = MotifEngine::from_store(store.clone());
        engine.apply(Operation::Merge {
            source: "sites".to_string(),
            target: "merged".to_string(),
            distance: 5,
            condition: None,
        })?;
        assert_eq!(region_list(&engine, "merged", "chr1"), vec![(100, 130)]);

        let mut engine = MotifEngine::from_store(store);
        engine.apply(Operation::Merge {
            source: "sites".to_string(),
            target: "merged".to_string(),
            distance: 4,
            condition: None,
        })?;
        assert_eq!(
            region_list(&engine, "merged", "chr1"),
            vec![(100, 110), (115, 130)]
        );
        Ok(())
    }

    #[test]
    fn test_extend_clamps_to_sequence() -> Result<(), EngineError> {
        let mut store = DataStore::new();
        let mut regions = RegionDataset::new();
        regions.add_sequence("chr1", 30);
        regions.add_region("chr1", Region::new(2, 5, "site", 1.0));
        regions.add_region("chr1", Region::new(25, 28, "site", 1.0));
        store.insert("sites", DataItem::Feature(FeatureDataset::Regions(regions)));
        let mut engine = MotifEngine::from_store(store);
        engine.apply(Operation::Extend {
            source: "sites".to_string(),
            target: "wide".to_string(),
            upstream: 5,
            downstream: 5,
            condition: None,
        })?;
        assert_eq!(region_list(&engine, "wide", "chr1"), vec![(0, 10), (20, 29)]);
        Ok(())
    }

    #[test]
    fn test_transform_is_gated_by_condition() -> Result<(), EngineError> {
        let mut store = DataStore::new();
        let mut track = NumericDataset::new();
        track.add_sequence("chr1", vec![1.0, 2.0, 3.0, 4.0]);
        store.insert("scores", DataItem::Feature(FeatureDataset::Numeric(track)));
        let mut engine = MotifEngine::from_store(store);
        engine.apply(Operation::Transform {
            source: "scores".to_string(),
            target: "boosted".to_string(),
            function: TransformFunction::Multiply,
            argument: Some("10".to_string()),
            condition: Some(ConditionTree::Leaf(PositionCondition::new(
                "scores",
                Comparator::Ge,
                "3",
            ))),
            within: None,
        })?;
        assert_eq!(
            numeric_values(&engine, "boosted", "chr1"),
            vec![1.0, 2.0, 30.0, 40.0]
        );
        Ok(())
    }

    #[test]
    fn test_transform_requires_argument() {
        let mut store = DataStore::new();
        let mut track = NumericDataset::new();
        track.add_sequence("chr1", vec![1.0]);
        store.insert("scores", DataItem::Feature(FeatureDataset::Numeric(track)));
        let mut engine = MotifEngine::from_store(store);
        let result = engine.apply(Operation::Transform {
            source: "scores".to_string(),
            target: "out".to_string(),
            function: TransformFunction::Add,
            argument: None,
            condition: None,
            within: None,
        });
        assert!(matches!(result, Err(EngineError::Evaluation { .. })));
        assert_eq!(engine.status(), RunStatus::Failed);
        assert!(engine.store().lookup("out").is_none());
    }

    #[test]
    fn test_mask_letter_and_condition() -> Result<(), EngineError> {
        let mut store = DataStore::new();
        let mut dna = DnaDataset::new();
        dna.add_sequence("chr1", "ACGTACGTAC");
        store.insert("genome", DataItem::Feature(FeatureDataset::Dna(dna)));
        let mut regions = RegionDataset::new();
        regions.add_sequence("chr1", 10);
        regions.add_region("chr1", Region::new(2, 4, "repeat", 1.0));
        regions.add_region("chr1", Region::new(7, 8, "tfbs", 1.0));
        store.insert("annot", DataItem::Feature(FeatureDataset::Regions(regions)));
        let mut engine = MotifEngine::from_store(store);
        engine.apply(Operation::Mask {
            source: "genome".to_string(),
            target: "masked".to_string(),
            regions: "annot".to_string(),
            mode: MaskMode::Letter('N'),
            condition: Some(ConditionTree::Leaf(RegionCondition::new(
                crate::condition::RegionField::Kind,
                Comparator::Eq,
                "'repeat'",
            ))),
        })?;
        match engine.store().lookup("masked") {
            Some(DataItem::Feature(FeatureDataset::Dna(d))) => {
                assert_eq!(d.sequence_string("chr1").as_deref(), Some("ACNNNCGTAC"));
            }
            other => panic!("expected dna dataset, found {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_convert_round_trip() -> Result<(), EngineError> {
        let mut store = DataStore::new();
        let mut regions = RegionDataset::new();
        regions.add_sequence("chr1", 20);
        regions.add_region("chr1", Region::new(3, 6, "site", 2.0));
        regions.add_region("chr1", Region::new(12, 13, "site", 4.0));
        store.insert("sites", DataItem::Feature(FeatureDataset::Regions(regions)));
        let mut engine = MotifEngine::from_store(store);

        engine.apply(Operation::ConvertToNumeric {
            source: "sites".to_string(),
            target: "track".to_string(),
            value: ConvertValue::Score,
            condition: None,
        })?;
        let values = numeric_values(&engine, "track", "chr1");
        assert_eq!(values[3], 2.0);
        assert_eq!(values[12], 4.0);
        assert_eq!(values[0], 0.0);

        engine.apply(Operation::ConvertToRegions {
            source: "track".to_string(),
            target: "recovered".to_string(),
            kind: "site".to_string(),
            condition: ConditionTree::Leaf(PositionCondition::new("track", Comparator::Gt, "0")),
        })?;
        assert_eq!(
            region_list(&engine, "recovered", "chr1"),
            vec![(3, 6), (12, 13)]
        );
        Ok(())
    }

    #[test]
    fn test_statistic_and_combine() -> Result<(), EngineError> {
        let mut store = DataStore::new();
        let mut a = NumericDataset::new();
        a.add_sequence("chr1", vec![1.0, 2.0]);
        a.add_sequence("chr2", vec![3.0, 4.0]);
        let mut b = NumericDataset::new();
        b.add_sequence("chr1", vec![10.0, 20.0]);
        b.add_sequence("chr2", vec![30.0, 40.0]);
        store.insert("a", DataItem::Feature(FeatureDataset::Numeric(a)));
        store.insert("b", DataItem::Feature(FeatureDataset::Numeric(b)));
        let mut engine = MotifEngine::from_store(store);

        engine.apply(Operation::Statistic {
            source: "a".to_string(),
            target: "a_sum".to_string(),
            stat: DatasetStat::Sum,
            per_sequence: false,
        })?;
        assert!(matches!(
            engine.store().lookup("a_sum"),
            Some(DataItem::Number(n)) if *n == 10.0
        ));

        engine.apply(Operation::Statistic {
            source: "a".to_string(),
            target: "a_max".to_string(),
            stat: DatasetStat::Max,
            per_sequence: true,
        })?;
        match engine.store().lookup("a_max") {
            Some(DataItem::NumericMap(m)) => {
                assert_eq!(m.value("chr1"), 2.0);
                assert_eq!(m.value("chr2"), 4.0);
            }
            other => panic!("expected numeric map, found {other:?}"),
        }

        engine.apply(Operation::Combine {
            sources: vec!["a".to_string(), "b".to_string()],
            target: "ab".to_string(),
            method: CombineMethod::Sum,
        })?;
        assert_eq!(numeric_values(&engine, "ab", "chr1"), vec![11.0, 22.0]);
        assert_eq!(numeric_values(&engine, "ab", "chr2"), vec![33.0, 44.0]);
        Ok(())
    }

    #[test]
    fn test_combine_rejects_mismatched_layout() {
        let mut store = DataStore::new();
        let mut a = NumericDataset::new();
        a.add_sequence("chr1", vec![1.0, 2.0]);
        let mut b = NumericDataset::new();
        b.add_sequence("chr1", vec![10.0]);
        store.insert("a", DataItem::Feature(FeatureDataset::Numeric(a)));
        store.insert("b", DataItem::Feature(FeatureDataset::Numeric(b)));
        let mut engine = MotifEngine::from_store(store);
        let result = engine.apply(Operation::Combine {
            sources: vec!["a".to_string(), "b".to_string()],
            target: "ab".to_string(),
            method: CombineMethod::Sum,
        });
        match result {
            Err(EngineError::Resolution { token, .. }) => assert_eq!(token, "b"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_distance_track() -> Result<(), EngineError> {
        let mut store = DataStore::new();
        let mut regions = RegionDataset::new();
        regions.add_sequence("chr1", 12);
        regions.add_region("chr1", Region::new(4, 6, "site", 1.0));
        store.insert("sites", DataItem::Feature(FeatureDataset::Regions(regions)));
        let mut engine = MotifEngine::from_store(store);
        engine.apply(Operation::Distance {
            regions: "sites".to_string(),
            target: "dist".to_string(),
            kind_filter: None,
        })?;
        assert_eq!(
            numeric_values(&engine, "dist", "chr1"),
            vec![3.0, 2.0, 1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 2.0, 3.0, 4.0]
        );
        Ok(())
    }

    #[test]
    fn test_journal_records_completed_operations() -> Result<(), EngineError> {
        let mut engine = engine_with_regions();
        engine.apply(count_op())?;
        assert_eq!(engine.operation_log().len(), 1);
        assert_eq!(engine.operation_log()[0].result.op_id, "op-1");
        assert_eq!(
            engine.operation_log()[0].result.created,
            vec!["coverage".to_string()]
        );
        assert_eq!(engine.status(), RunStatus::Completed);

        // A failed operation is not journaled.
        let result = engine.apply(Operation::Count {
            source: "missing".to_string(),
            target: "x".to_string(),
            window_size: 5,
            mode: CountMode::Overlapping,
            condition: None,
            within: None,
        });
        assert!(result.is_err());
        assert_eq!(engine.operation_log().len(), 1);
        Ok(())
    }

    #[test]
    fn test_abort_leaves_store_untouched() {
        let handle = crate::task::TaskHandle::new();
        handle.abort();
        let mut engine = engine_with_regions();
        let result = engine.apply_with_monitor(count_op(), handle.as_ref());
        assert!(matches!(result, Err(EngineError::Interrupted)));
        assert_eq!(engine.status(), RunStatus::Aborted);
        assert!(engine.store().lookup("coverage").is_none());
    }
}
