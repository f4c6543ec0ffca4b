use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

pub type SeqName = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Strand {
    Forward,
    Reverse,
    Unknown,
}

impl Default for Strand {
    fn default() -> Self {
        Strand::Unknown
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PropertyValue {
    Number(f64),
    Text(String),
    Boolean(bool),
}

impl PropertyValue {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            PropertyValue::Number(n) => Some(*n),
            PropertyValue::Boolean(b) => Some(if *b { 1.0 } else { 0.0 }),
            PropertyValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> String {
        match self {
            PropertyValue::Number(n) => n.to_string(),
            PropertyValue::Text(t) => t.clone(),
            PropertyValue::Boolean(b) => b.to_string(),
        }
    }
}

/// A labeled interval on a sequence. Coordinates are 0-based and inclusive on
/// both ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub start: usize,
    pub end: usize,
    pub kind: String,
    pub score: f64,
    #[serde(default)]
    pub strand: Strand,
    #[serde(default)]
    pub properties: HashMap<String, PropertyValue>,
    #[serde(default)]
    pub motif: Option<String>,
}

impl Region {
    pub fn new(start: usize, end: usize, kind: &str, score: f64) -> Self {
        Region {
            start,
            end,
            kind: kind.to_string(),
            score,
            strand: Strand::Unknown,
            properties: HashMap::new(),
            motif: None,
        }
    }

    pub fn length(&self) -> usize {
        self.end - self.start + 1
    }

    pub fn overlaps_range(&self, start: usize, end: usize) -> bool {
        self.start <= end && self.end >= start
    }

    /// True if this region lies entirely within [start, end].
    pub fn within_range(&self, start: usize, end: usize) -> bool {
        self.start >= start && self.end <= end
    }

    /// True if this region spans all of [start, end].
    pub fn spans_range(&self, start: usize, end: usize) -> bool {
        self.start <= start && self.end >= end
    }

    /// Gap between this region and [start, end]: 0 when they touch,
    /// -1 when they overlap, otherwise the number of positions in between.
    pub fn distance_to_range(&self, start: usize, end: usize) -> i64 {
        if self.overlaps_range(start, end) {
            return -1;
        }
        if self.end < start {
            (start - self.end - 1) as i64
        } else {
            (self.start - end - 1) as i64
        }
    }

    pub fn property(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn set_property(&mut self, name: &str, value: PropertyValue) {
        self.properties.insert(name.to_string(), value);
    }
}

/// How region kinds are matched when a query carries a kind filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KindMatch {
    Exact(String),
    Contains(String),
}

impl KindMatch {
    pub fn accepts(&self, kind: &str) -> bool {
        match self {
            KindMatch::Exact(k) => kind == k,
            KindMatch::Contains(k) => kind.contains(k.as_str()),
        }
    }
}

/// Restricts which regions of a reference track participate in a search.
#[derive(Debug, Clone, Default)]
pub struct RegionFilter {
    pub kind: Option<KindMatch>,
    /// When set, only regions whose motif id is in this set qualify.
    pub motifs: Option<std::collections::BTreeSet<String>>,
}

impl RegionFilter {
    pub fn accepts(&self, region: &Region) -> bool {
        if let Some(kind) = &self.kind {
            if !kind.accepts(&region.kind) {
                return false;
            }
        }
        if let Some(motifs) = &self.motifs {
            match &region.motif {
                Some(id) => {
                    if !motifs.contains(id) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// An admissible-distance window with an explicit negation flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistanceWindow {
    pub min: i64,
    pub max: i64,
    pub negate: bool,
}

impl DistanceWindow {
    pub fn matches(&self, distance: i64) -> bool {
        let inside = distance >= self.min && distance <= self.max;
        inside != self.negate
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegionList {
    length: usize,
    regions: Vec<Region>,
}

/// A region track: per-sequence lists of labeled intervals, kept sorted by
/// ascending start (then end) coordinate.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegionDataset {
    sequences: BTreeMap<SeqName, RegionList>,
}

impl RegionDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sequence(&mut self, name: &str, length: usize) {
        self.sequences.entry(name.to_string()).or_default().length = length;
    }

    pub fn add_region(&mut self, name: &str, region: Region) {
        let list = self.sequences.entry(name.to_string()).or_default();
        let at = list
            .regions
            .partition_point(|r| (r.start, r.end) <= (region.start, region.end));
        list.regions.insert(at, region);
    }

    /// Replaces the region list of a sequence, restoring sort order.
    pub fn set_regions(&mut self, name: &str, mut regions: Vec<Region>) {
        regions.sort_by_key(|r| (r.start, r.end));
        let list = self.sequences.entry(name.to_string()).or_default();
        list.regions = regions;
    }

    pub fn sequence_names(&self) -> Vec<SeqName> {
        self.sequences.keys().cloned().collect()
    }

    pub fn has_sequence(&self, name: &str) -> bool {
        self.sequences.contains_key(name)
    }

    pub fn sequence_length(&self, name: &str) -> Option<usize> {
        self.sequences.get(name).map(|list| list.length)
    }

    /// Regions of a sequence in ascending genomic coordinate order.
    pub fn regions(&self, name: &str) -> &[Region] {
        self.sequences
            .get(name)
            .map(|list| list.regions.as_slice())
            .unwrap_or(&[])
    }

    pub fn region_count(&self) -> usize {
        self.sequences.values().map(|list| list.regions.len()).sum()
    }

    pub fn regions_overlapping(&self, name: &str, start: usize, end: usize) -> Vec<&Region> {
        let regions = self.regions(name);
        let upper = regions.partition_point(|r| r.start <= end);
        regions[..upper]
            .iter()
            .filter(|r| r.end >= start)
            .collect()
    }

    pub fn any_overlapping(
        &self,
        name: &str,
        start: usize,
        end: usize,
        filter: &RegionFilter,
    ) -> bool {
        let regions = self.regions(name);
        let upper = regions.partition_point(|r| r.start <= end);
        regions[..upper]
            .iter()
            .any(|r| r.end >= start && filter.accepts(r))
    }

    /// Any reference region lying entirely within [start, end]?
    pub fn any_within(&self, name: &str, start: usize, end: usize, filter: &RegionFilter) -> bool {
        let regions = self.regions(name);
        let upper = regions.partition_point(|r| r.start <= end);
        regions[..upper]
            .iter()
            .any(|r| r.within_range(start, end) && filter.accepts(r))
    }

    /// Any reference region spanning all of [start, end]?
    pub fn any_spanning(&self, name: &str, start: usize, end: usize, filter: &RegionFilter) -> bool {
        let regions = self.regions(name);
        let upper = regions.partition_point(|r| r.start <= start);
        regions[..upper]
            .iter()
            .any(|r| r.end >= end && filter.accepts(r))
    }

    /// Exact structural membership: same coordinates and kind.
    pub fn contains_region(&self, name: &str, region: &Region) -> bool {
        self.regions(name)
            .iter()
            .any(|r| r.start == region.start && r.end == region.end && r.kind == region.kind)
    }

    /// Fuzzy structural membership: same kind, endpoints within `slack`.
    pub fn contains_similar_region(&self, name: &str, region: &Region, slack: usize) -> bool {
        self.regions(name).iter().any(|r| {
            r.kind == region.kind
                && r.start.abs_diff(region.start) <= slack
                && r.end.abs_diff(region.end) <= slack
        })
    }

    /// Minimal gap between [start, end] and any qualifying reference region.
    /// Returns -1 when the closest qualifying region overlaps, None when no
    /// region qualifies. Regions after the query interval are scanned in
    /// ascending start order, so the scan stops as soon as gaps can only grow.
    pub fn distance_to_closest(
        &self,
        name: &str,
        start: usize,
        end: usize,
        filter: &RegionFilter,
    ) -> Option<i64> {
        let regions = self.regions(name);
        let split = regions.partition_point(|r| r.start <= end);
        let mut best: Option<i64> = None;
        for r in &regions[..split] {
            if !filter.accepts(r) {
                continue;
            }
            let d = r.distance_to_range(start, end);
            if best.map_or(true, |b| d < b) {
                best = Some(d);
            }
            if d < 0 {
                return Some(-1);
            }
        }
        for r in &regions[split..] {
            let d = r.distance_to_range(start, end);
            if let Some(b) = best {
                if d > b {
                    break;
                }
            }
            if filter.accepts(r) && best.map_or(true, |b| d < b) {
                best = Some(d);
            }
        }
        best
    }

    /// Does any qualifying region lie within the admissible-distance window?
    pub fn any_within_distance(
        &self,
        name: &str,
        start: usize,
        end: usize,
        window: &DistanceWindow,
        filter: &RegionFilter,
    ) -> bool {
        self.regions(name)
            .iter()
            .any(|r| filter.accepts(r) && window.matches(r.distance_to_range(start, end)))
    }
}

/// A per-position numeric track with a dataset-wide value range.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NumericDataset {
    sequences: BTreeMap<SeqName, Vec<f64>>,
    min: f64,
    max: f64,
}

impl NumericDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sequence(&mut self, name: &str, values: Vec<f64>) {
        self.sequences.insert(name.to_string(), values);
    }

    pub fn add_flat_sequence(&mut self, name: &str, length: usize, value: f64) {
        self.sequences.insert(name.to_string(), vec![value; length]);
    }

    pub fn sequence_names(&self) -> Vec<SeqName> {
        self.sequences.keys().cloned().collect()
    }

    pub fn has_sequence(&self, name: &str) -> bool {
        self.sequences.contains_key(name)
    }

    pub fn sequence_length(&self, name: &str) -> Option<usize> {
        self.sequences.get(name).map(|v| v.len())
    }

    pub fn values(&self, name: &str) -> Option<&[f64]> {
        self.sequences.get(name).map(|v| v.as_slice())
    }

    pub fn get(&self, name: &str, pos: usize) -> Option<f64> {
        self.sequences.get(name).and_then(|v| v.get(pos)).copied()
    }

    pub fn set(&mut self, name: &str, pos: usize, value: f64) {
        if let Some(v) = self.sequences.get_mut(name) {
            if let Some(slot) = v.get_mut(pos) {
                *slot = value;
            }
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    /// Recomputes the dataset-wide min/max after the track has been fully
    /// populated. Called once on commit, never during parallel writes.
    pub fn recompute_range(&mut self) {
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for values in self.sequences.values() {
            for v in values {
                if *v < min {
                    min = *v;
                }
                if *v > max {
                    max = *v;
                }
            }
        }
        if min.is_finite() {
            self.min = min;
            self.max = max;
        } else {
            self.min = 0.0;
            self.max = 0.0;
        }
    }
}

/// A per-position DNA base track.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnaDataset {
    sequences: BTreeMap<SeqName, Vec<u8>>,
}

impl DnaDataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sequence(&mut self, name: &str, bases: &str) {
        self.sequences
            .insert(name.to_string(), bases.as_bytes().to_vec());
    }

    pub fn sequence_names(&self) -> Vec<SeqName> {
        self.sequences.keys().cloned().collect()
    }

    pub fn sequence_length(&self, name: &str) -> Option<usize> {
        self.sequences.get(name).map(|v| v.len())
    }

    pub fn bases(&self, name: &str) -> Option<&[u8]> {
        self.sequences.get(name).map(|v| v.as_slice())
    }

    pub fn base(&self, name: &str, pos: usize) -> Option<u8> {
        self.sequences.get(name).and_then(|v| v.get(pos)).copied()
    }

    pub fn sequence_string(&self, name: &str) -> Option<String> {
        self.sequences
            .get(name)
            .map(|v| String::from_utf8_lossy(v).to_string())
    }

    pub fn set_bases(&mut self, name: &str, bases: Vec<u8>) {
        self.sequences.insert(name.to_string(), bases);
    }
}

/// A feature dataset: one of the three track shapes the engine transforms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum FeatureDataset {
    Numeric(NumericDataset),
    Regions(RegionDataset),
    Dna(DnaDataset),
}

impl FeatureDataset {
    pub fn sequence_names(&self) -> Vec<SeqName> {
        match self {
            FeatureDataset::Numeric(d) => d.sequence_names(),
            FeatureDataset::Regions(d) => d.sequence_names(),
            FeatureDataset::Dna(d) => d.sequence_names(),
        }
    }

    pub fn sequence_length(&self, name: &str) -> Option<usize> {
        match self {
            FeatureDataset::Numeric(d) => d.sequence_length(name),
            FeatureDataset::Regions(d) => d.sequence_length(name),
            FeatureDataset::Dna(d) => d.sequence_length(name),
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            FeatureDataset::Numeric(_) => "numeric",
            FeatureDataset::Regions(_) => "region",
            FeatureDataset::Dna(_) => "dna",
        }
    }
}
