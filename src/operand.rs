use std::sync::Arc;

use crate::data::{Collection, DataContext, DataItem, NumericMap, Partition, TextMap};
use crate::error::EngineError;
use crate::feature::{DnaDataset, FeatureDataset, NumericDataset, RegionDataset};

/// A resolved operand. Resolution happens exactly once per operand slot,
/// before any evaluation; the named items are snapshotted behind `Arc` so a
/// resolved operand is an immutable value that can be shared across worker
/// threads.
#[derive(Debug, Clone)]
pub enum Operand {
    Number(f64),
    Text(String),
    TextSet(Vec<String>),
    NumericMap(Arc<NumericMap>),
    TextMap(Arc<TextMap>),
    Collection(Arc<Collection>),
    Partition(Arc<Partition>),
    Track(Arc<NumericDataset>),
    Regions(Arc<RegionDataset>),
    Dna(Arc<DnaDataset>),
    /// Sentinel: read the named user-defined property off the region under
    /// test instead of looking anything up.
    RegionProperty(String),
}

/// The broad comparison class an operand contributes values to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandClass {
    Numeric,
    Textual,
    Collection,
    Partition,
    Regions,
}

impl Operand {
    pub fn class(&self) -> OperandClass {
        match self {
            Operand::Number(_) | Operand::NumericMap(_) | Operand::Track(_) => {
                OperandClass::Numeric
            }
            Operand::Text(_)
            | Operand::TextSet(_)
            | Operand::TextMap(_)
            | Operand::Dna(_)
            | Operand::RegionProperty(_) => OperandClass::Textual,
            Operand::Collection(_) => OperandClass::Collection,
            Operand::Partition(_) => OperandClass::Partition,
            Operand::Regions(_) => OperandClass::Regions,
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Operand::Number(_) => "number",
            Operand::Text(_) => "text",
            Operand::TextSet(_) => "text set",
            Operand::NumericMap(_) => "numeric map",
            Operand::TextMap(_) => "text map",
            Operand::Collection(_) => "collection",
            Operand::Partition(_) => "partition",
            Operand::Track(_) => "numeric track",
            Operand::Regions(_) => "region track",
            Operand::Dna(_) => "dna track",
            Operand::RegionProperty(_) => "region property",
        }
    }
}

fn strip_quotes(token: &str) -> Option<&str> {
    let bytes = token.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if first == last && (first == b'"' || first == b'\'') {
            return Some(&token[1..token.len() - 1]);
        }
    }
    None
}

/// Turns an operand token into a typed operand.
///
/// A quoted token is always text, never a name lookup. An unquoted token is
/// first looked up as a named data item, then parsed as a number; anything
/// else is a hard resolution error carrying the token and the script line.
pub fn resolve_token(
    token: &str,
    line: usize,
    ctx: &dyn DataContext,
) -> Result<Operand, EngineError> {
    if let Some(text) = strip_quotes(token) {
        return Ok(Operand::Text(text.to_string()));
    }
    if let Some(item) = ctx.lookup(token) {
        return Ok(match item {
            DataItem::Number(n) => Operand::Number(*n),
            DataItem::Text(t) => Operand::Text(t.clone()),
            DataItem::NumericMap(m) => Operand::NumericMap(Arc::new(m.clone())),
            DataItem::TextMap(m) => Operand::TextMap(Arc::new(m.clone())),
            DataItem::Collection(c) => Operand::Collection(Arc::new(c.clone())),
            DataItem::Partition(p) => Operand::Partition(Arc::new(p.clone())),
            DataItem::Feature(FeatureDataset::Numeric(d)) => Operand::Track(Arc::new(d.clone())),
            DataItem::Feature(FeatureDataset::Regions(d)) => Operand::Regions(Arc::new(d.clone())),
            DataItem::Feature(FeatureDataset::Dna(d)) => Operand::Dna(Arc::new(d.clone())),
        });
    }
    match token.parse::<f64>() {
        Ok(n) => Ok(Operand::Number(n)),
        Err(_) => Err(EngineError::Resolution {
            token: token.to_string(),
            line,
            reason: "not a quoted string, a known data item, or a number".to_string(),
        }),
    }
}

/// Checks the left/right pair rule: a numeric or textual left operand accepts
/// any right-hand shape (coercion happens at comparison time); any other left
/// operand requires the right side to be the same concrete class.
pub fn check_pair(
    left: &Operand,
    right: &Operand,
    right_token: &str,
    line: usize,
) -> Result<(), EngineError> {
    match left.class() {
        OperandClass::Numeric | OperandClass::Textual => Ok(()),
        class => {
            if right.class() == class {
                Ok(())
            } else {
                Err(EngineError::Resolution {
                    token: right_token.to_string(),
                    line,
                    reason: format!(
                        "a {} can only be compared to another {}, found a {}",
                        left.describe(),
                        left.describe(),
                        right.describe()
                    ),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataStore;

    fn store() -> DataStore {
        let mut store = DataStore::new();
        store.insert("cutoff", DataItem::Number(3.5));
        store.insert("3.14", DataItem::Text("pi-lookalike".to_string()));
        let mut map = NumericMap::new(0.0);
        map.insert("chr1", 1.0);
        store.insert("per_seq", DataItem::NumericMap(map));
        store.insert(
            "targets",
            DataItem::Collection(Collection::from_members(["a", "b"])),
        );
        store
    }

    #[test]
    fn test_number_token_resolves_to_number() {
        let store = DataStore::new();
        match resolve_token("3.14", 1, &store) {
            Ok(Operand::Number(n)) => assert_eq!(n, 3.14),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_quoted_token_is_always_text() {
        // Even when the unquoted content names a data item or parses as a
        // number, quotes force text.
        let store = store();
        match resolve_token("\"3.14\"", 1, &store) {
            Ok(Operand::Text(t)) => assert_eq!(t, "3.14"),
            other => panic!("unexpected: {other:?}"),
        }
        match resolve_token("'cutoff'", 1, &store) {
            Ok(Operand::Text(t)) => assert_eq!(t, "cutoff"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_name_lookup_wins_over_number_parse() {
        let store = store();
        match resolve_token("3.14", 1, &store) {
            Ok(Operand::Text(t)) => assert_eq!(t, "pi-lookalike"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_unresolvable_token_names_token_and_line() {
        let store = store();
        match resolve_token("no_such_thing", 42, &store) {
            Err(EngineError::Resolution { token, line, .. }) => {
                assert_eq!(token, "no_such_thing");
                assert_eq!(line, 42);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_pair_compatibility() {
        let store = store();
        let number = resolve_token("1.0", 1, &store).unwrap();
        let collection = resolve_token("targets", 1, &store).unwrap();
        let map = resolve_token("per_seq", 1, &store).unwrap();

        // Numeric left accepts any right shape.
        assert!(check_pair(&number, &collection, "targets", 1).is_ok());
        assert!(check_pair(&number, &map, "per_seq", 1).is_ok());
        // Collection left requires a collection right.
        assert!(check_pair(&collection, &collection, "targets", 1).is_ok());
        assert!(check_pair(&collection, &number, "1.0", 1).is_err());
    }
}
