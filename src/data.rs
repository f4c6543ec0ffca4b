use crate::error::EngineError;
use crate::feature::FeatureDataset;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Assigns a number to named keys, with a default for keys it does not list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NumericMap {
    pub values: HashMap<String, f64>,
    pub default: f64,
}

impl NumericMap {
    pub fn new(default: f64) -> Self {
        NumericMap {
            values: HashMap::new(),
            default,
        }
    }

    pub fn insert(&mut self, key: &str, value: f64) {
        self.values.insert(key.to_string(), value);
    }

    pub fn value(&self, key: &str) -> f64 {
        self.values.get(key).copied().unwrap_or(self.default)
    }
}

/// Assigns one or more text values to named keys.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TextMap {
    pub values: HashMap<String, Vec<String>>,
    pub default: Vec<String>,
}

impl TextMap {
    pub fn insert(&mut self, key: &str, values: Vec<String>) {
        self.values.insert(key.to_string(), values);
    }

    pub fn value(&self, key: &str) -> &[String] {
        self.values
            .get(key)
            .map(|v| v.as_slice())
            .unwrap_or(&self.default)
    }
}

/// An unordered set of member names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub members: BTreeSet<String>,
}

impl Collection {
    pub fn from_members<I: IntoIterator<Item = S>, S: Into<String>>(members: I) -> Self {
        Collection {
            members: members.into_iter().map(Into::into).collect(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.members.contains(name)
    }

    pub fn is_subset_of(&self, other: &Collection) -> bool {
        self.members.is_subset(&other.members)
    }

    pub fn overlaps(&self, other: &Collection) -> bool {
        self.members.intersection(&other.members).next().is_some()
    }
}

/// Maps each key to the name of the cluster it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub cluster_of: HashMap<String, String>,
}

impl Partition {
    pub fn assign(&mut self, key: &str, cluster: &str) {
        self.cluster_of.insert(key.to_string(), cluster.to_string());
    }

    pub fn cluster(&self, key: &str) -> Option<&str> {
        self.cluster_of.get(key).map(|s| s.as_str())
    }

    pub fn members_of(&self, cluster: &str) -> BTreeSet<String> {
        self.cluster_of
            .iter()
            .filter(|(_, c)| c.as_str() == cluster)
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// A named data item as stored in the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DataItem {
    Number(f64),
    Text(String),
    NumericMap(NumericMap),
    TextMap(TextMap),
    Collection(Collection),
    Partition(Partition),
    Feature(FeatureDataset),
}

impl DataItem {
    pub fn kind_name(&self) -> &'static str {
        match self {
            DataItem::Number(_) => "number",
            DataItem::Text(_) => "text",
            DataItem::NumericMap(_) => "numeric map",
            DataItem::TextMap(_) => "text map",
            DataItem::Collection(_) => "collection",
            DataItem::Partition(_) => "partition",
            DataItem::Feature(d) => d.kind_name(),
        }
    }
}

/// Read-only lookup of named data items. Operand resolution receives this,
/// never a global registry.
pub trait DataContext {
    fn lookup(&self, name: &str) -> Option<&DataItem>;
}

/// The engine's key-value store of user-visible data items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DataStore {
    items: HashMap<String, DataItem>,
}

impl DataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, item: DataItem) {
        self.items.insert(name.to_string(), item);
    }

    pub fn remove(&mut self, name: &str) -> Option<DataItem> {
        self.items.remove(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.items.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn get_feature(&self, name: &str) -> Result<&FeatureDataset, EngineError> {
        match self.items.get(name) {
            Some(DataItem::Feature(ds)) => Ok(ds),
            Some(other) => Err(EngineError::Resolution {
                token: name.to_string(),
                line: 0,
                reason: format!("expected a feature dataset, found a {}", other.kind_name()),
            }),
            None => Err(EngineError::NotFound(name.to_string())),
        }
    }

    pub fn load_from_path(path: &str) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn save_to_path(&self, path: &str) -> Result<(), EngineError> {
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

impl DataContext for DataStore {
    fn lookup(&self, name: &str) -> Option<&DataItem> {
        self.items.get(name)
    }
}
