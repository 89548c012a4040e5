//! Molecules - content-addressed chemistry inputs.
//!
//! The engine never interprets a molecule beyond hashing it and slicing
//! fragments out of it for many-body children. `molecule_hash` is the
//! deduplication key; geometry is rounded to a coarser noise floor than
//! other floats so that equivalent structures from different toolchains
//! collide.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::hashing;

/// Decimal digits of geometry kept in the hash input.
const GEOMETRY_DIGITS: u32 = 8;
/// Decimal digits of total charge kept in the hash input.
const CHARGE_DIGITS: u32 = 4;

/// A molecule as submitted by clients. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Molecule {
    /// Element symbols, one per atom.
    pub symbols: Vec<String>,
    /// Flattened cartesian coordinates, 3 per atom (bohr).
    pub geometry: Vec<f64>,
    #[serde(default)]
    pub molecular_charge: f64,
    #[serde(default = "default_multiplicity")]
    pub molecular_multiplicity: i32,
    /// Atom indices per fragment. Absent means a single fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragments: Option<Vec<Vec<usize>>>,
    /// Bonds as (atom, atom, order) triples.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connectivity: Option<Vec<(usize, usize, f64)>>,
    /// Free-form identifiers (names, smiles, ...). Not part of the hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifiers: Option<Value>,
}

fn default_multiplicity() -> i32 {
    1
}

impl Molecule {
    pub fn n_atoms(&self) -> usize {
        self.symbols.len()
    }

    pub fn n_fragments(&self) -> usize {
        self.fragments.as_ref().map(|f| f.len()).unwrap_or(1)
    }

    /// Canonical content hash. Derived only from the physically meaningful
    /// fields; identifiers never contribute.
    pub fn molecule_hash(&self) -> String {
        let geometry: Vec<f64> = self
            .geometry
            .iter()
            .map(|g| hashing::round_to(*g, GEOMETRY_DIGITS))
            .collect();

        let canonical = json!({
            "symbols": self.symbols,
            "geometry": geometry,
            "molecular_charge": hashing::round_to(self.molecular_charge, CHARGE_DIGITS),
            "molecular_multiplicity": self.molecular_multiplicity,
            "fragments": self.fragments,
            "connectivity": self.connectivity,
        });
        hashing::hash_value(&canonical)
    }

    /// Build the sub-molecule spanning the given fragments, in order.
    /// Used by the many-body service to generate cluster children.
    pub fn fragment_subset(&self, fragment_idx: &[usize]) -> Option<Molecule> {
        let fragments = self.fragments.as_ref()?;
        let mut symbols = Vec::new();
        let mut geometry = Vec::new();
        let mut kept_fragments = Vec::new();

        for &fi in fragment_idx {
            let atoms = fragments.get(fi)?;
            let start = symbols.len();
            for &a in atoms {
                symbols.push(self.symbols.get(a)?.clone());
                geometry.extend_from_slice(self.geometry.get(a * 3..a * 3 + 3)?);
            }
            kept_fragments.push((start..symbols.len()).collect());
        }

        Some(Molecule {
            symbols,
            geometry,
            molecular_charge: self.molecular_charge,
            molecular_multiplicity: self.molecular_multiplicity,
            fragments: Some(kept_fragments),
            connectivity: None,
            identifiers: None,
        })
    }
}

/// A molecule reference in a submission: either the id of a stored molecule
/// or an inline molecule to be upserted by hash.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MoleculeRef {
    Id(i64),
    Inline(Box<Molecule>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn water() -> Molecule {
        Molecule {
            symbols: vec!["O".into(), "H".into(), "H".into()],
            geometry: vec![
                0.0, 0.0, 0.0, //
                0.0, 1.43, 1.1, //
                0.0, -1.43, 1.1,
            ],
            molecular_charge: 0.0,
            molecular_multiplicity: 1,
            fragments: None,
            connectivity: None,
            identifiers: None,
        }
    }

    #[test]
    fn test_hash_stable() {
        assert_eq!(water().molecule_hash(), water().molecule_hash());
    }

    #[test]
    fn test_hash_ignores_identifiers() {
        let mut named = water();
        named.identifiers = Some(serde_json::json!({"name": "water"}));
        assert_eq!(named.molecule_hash(), water().molecule_hash());
    }

    #[test]
    fn test_hash_sees_geometry_noise_floor() {
        let mut wiggled = water();
        wiggled.geometry[4] += 1e-10; // below the 8-digit floor
        assert_eq!(wiggled.molecule_hash(), water().molecule_hash());

        wiggled.geometry[4] += 1e-4;
        assert_ne!(wiggled.molecule_hash(), water().molecule_hash());
    }

    #[test]
    fn test_fragment_subset() {
        let dimer = Molecule {
            symbols: vec!["O".into(), "H".into(), "H".into(), "O".into(), "H".into(), "H".into()],
            geometry: (0..18).map(|i| i as f64).collect(),
            molecular_charge: 0.0,
            molecular_multiplicity: 1,
            fragments: Some(vec![vec![0, 1, 2], vec![3, 4, 5]]),
            connectivity: None,
            identifiers: None,
        };

        let second = dimer.fragment_subset(&[1]).unwrap();
        assert_eq!(second.symbols, vec!["O", "H", "H"]);
        assert_eq!(second.geometry[0], 9.0);
        assert_eq!(second.n_fragments(), 1);

        let both = dimer.fragment_subset(&[0, 1]).unwrap();
        assert_eq!(both.n_atoms(), 6);
        assert_eq!(both.n_fragments(), 2);

        assert!(dimer.fragment_subset(&[2]).is_none());
    }
}
