use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{self, BufRead};

use crate::feature::Strand;

/// A regulatory motif: a count matrix with a derived per-column
/// information-content vector, plus the ids of its known interaction partners.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Motif {
    pub id: String,
    pub name: Option<String>,
    matrix: Vec<[f64; 4]>,
    ic_weights: Vec<f64>,
    #[serde(default)]
    pub partners: BTreeSet<String>,
}

impl Motif {
    pub fn new(id: &str, name: Option<String>, matrix: Vec<[f64; 4]>) -> Self {
        let ic_weights = information_content(&matrix);
        Motif {
            id: id.to_string(),
            name,
            matrix,
            ic_weights,
            partners: BTreeSet::new(),
        }
    }

    pub fn matrix(&self) -> &[[f64; 4]] {
        &self.matrix
    }

    pub fn len(&self) -> usize {
        self.matrix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.matrix.is_empty()
    }

    /// Per-column information content, oriented for the given strand.
    /// Reverse-strand regions read the motif back to front.
    pub fn oriented_ic_weights(&self, strand: Strand) -> Vec<f64> {
        match strand {
            Strand::Reverse => self.ic_weights.iter().rev().copied().collect(),
            _ => self.ic_weights.clone(),
        }
    }

    pub fn add_partner(&mut self, id: &str) {
        self.partners.insert(id.to_string());
    }
}

/// Information content per column: 2 + sum(p * log2 p) over the column's
/// normalized base frequencies. Columns summing to zero contribute 0.
fn information_content(matrix: &[[f64; 4]]) -> Vec<f64> {
    matrix
        .iter()
        .map(|column| {
            let total: f64 = column.iter().sum();
            if total <= 0.0 {
                return 0.0;
            }
            let mut ic = 2.0;
            for count in column {
                let p = count / total;
                if p > 0.0 {
                    ic += p * f64::log2(p);
                }
            }
            ic.max(0.0)
        })
        .collect()
}

/// Motif lookup by id or name, case-insensitive. Injected into region
/// condition resolution, never reached through a global.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MotifRegistry {
    motifs: Vec<Motif>,
    by_key: HashMap<String, usize>,
}

impl MotifRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, motif: Motif) {
        let idx = self.motifs.len();
        let id_key = motif.id.trim().to_ascii_uppercase();
        let name_key = motif.name.as_ref().map(|n| n.trim().to_ascii_uppercase());
        self.motifs.push(motif);
        if !id_key.is_empty() {
            self.by_key.insert(id_key, idx);
        }
        if let Some(name_key) = name_key {
            if !name_key.is_empty() {
                self.by_key.entry(name_key).or_insert(idx);
            }
        }
    }

    pub fn get(&self, token: &str) -> Option<&Motif> {
        let key = token.trim().to_ascii_uppercase();
        let idx = self.by_key.get(&key)?;
        self.motifs.get(*idx)
    }

    pub fn len(&self) -> usize {
        self.motifs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.motifs.is_empty()
    }

    /// Interaction partners of a motif, as a filter set for distance searches.
    pub fn partners_of(&self, token: &str) -> Option<BTreeSet<String>> {
        self.get(token).map(|m| m.partners.clone())
    }

    /// Loads a JASPAR-style motif file: a `>accession name` header followed by
    /// four rows of counts (A, C, G, T order).
    pub fn from_jaspar_file(filename: &str) -> Result<Self> {
        let file = File::open(filename)?;
        let reader = io::BufReader::new(file);
        let mut registry = MotifRegistry::new();
        let mut lines = reader.lines();

        while let Some(line) = lines.next() {
            Self::parse_jaspar_entry(line, &mut lines, &mut registry)?;
        }

        Ok(registry)
    }

    fn parse_jaspar_entry(
        line: std::result::Result<String, io::Error>,
        lines: &mut io::Lines<io::BufReader<File>>,
        registry: &mut MotifRegistry,
    ) -> Result<()> {
        let line = line?;
        if let Some(rest) = line.strip_prefix('>') {
            let mut parts = rest.trim().splitn(2, char::is_whitespace);
            let accession = parts.next().unwrap_or("").to_string();
            let name = parts.next().map(|n| n.trim().to_string());

            let mut rows: Vec<Vec<f64>> = Vec::with_capacity(4);
            for _ in 0..4 {
                let row_line = lines.next().ok_or(anyhow!("Incomplete matrix data"))??;
                let row: Vec<f64> = row_line
                    .split_whitespace()
                    .filter(|v| v.chars().all(|c| c.is_ascii_digit() || c == '.'))
                    .map(|v| v.parse::<f64>())
                    .collect::<std::result::Result<_, _>>()?;
                rows.push(row);
            }
            let len = rows[0].len();
            if len == 0 || rows.iter().any(|r| r.len() != len) {
                return Err(anyhow!("Ragged matrix for motif '{accession}'"));
            }
            let mut matrix = Vec::with_capacity(len);
            for i in 0..len {
                matrix.push([rows[0][i], rows[1][i], rows[2][i], rows[3][i]]);
            }
            registry.insert(Motif::new(&accession, name, matrix));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_information_content() {
        // A fully conserved column carries 2 bits, a uniform column 0.
        let motif = Motif::new(
            "M1",
            None,
            vec![[8.0, 0.0, 0.0, 0.0], [2.0, 2.0, 2.0, 2.0]],
        );
        let ic = motif.oriented_ic_weights(Strand::Forward);
        assert!((ic[0] - 2.0).abs() < 1e-9);
        assert!(ic[1].abs() < 1e-9);
        let rev = motif.oriented_ic_weights(Strand::Reverse);
        assert!((rev[0]).abs() < 1e-9);
        assert!((rev[1] - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_registry_lookup_is_case_insensitive() {
        let mut registry = MotifRegistry::new();
        registry.insert(Motif::new(
            "MA0001.1",
            Some("AGL3".to_string()),
            vec![[1.0, 0.0, 0.0, 0.0]],
        ));
        assert!(registry.get("ma0001.1").is_some());
        assert!(registry.get("agl3").is_some());
        assert!(registry.get("nope").is_none());
    }

    #[test]
    fn test_jaspar_parsing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("motifs.jaspar");
        let mut file = File::create(&path)?;
        writeln!(file, ">MA9999.1 TEST")?;
        writeln!(file, "A [ 10 0 ]")?;
        writeln!(file, "C [ 0 10 ]")?;
        writeln!(file, "G [ 0 0 ]")?;
        writeln!(file, "T [ 0 0 ]")?;

        let registry = MotifRegistry::from_jaspar_file(&path.to_string_lossy())?;
        assert_eq!(registry.len(), 1);
        let motif = registry.get("MA9999.1").ok_or(anyhow!("missing motif"))?;
        assert_eq!(motif.len(), 2);
        assert_eq!(motif.matrix()[0][0], 10.0);
        assert_eq!(motif.matrix()[1][1], 10.0);
        Ok(())
    }

    #[test]
    fn test_nonexistent_file() {
        let result = MotifRegistry::from_jaspar_file("nonexistent_file.jaspar");
        assert!(result.is_err(), "Expected an error for a nonexistent file");
    }
}
