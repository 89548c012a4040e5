//! Specifications - the immutable, content-addressed "how to compute" half
//! of a record.
//!
//! Each variant normalizes to lowercase program/method/basis and hashes a
//! canonical JSON form (sorted keys, 10-digit floats). The dedup key is
//! `(record_type, specification_hash)`; re-inserting identical content must
//! yield the existing row.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::QcGridError;
use crate::hashing;
use crate::types::RecordType;

// ── Singlepoint ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinglepointDriver {
    Energy,
    Gradient,
    Hessian,
    Properties,
}

impl SinglepointDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Energy => "energy",
            Self::Gradient => "gradient",
            Self::Hessian => "hessian",
            Self::Properties => "properties",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SinglepointSpecification {
    pub program: String,
    pub driver: SinglepointDriver,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basis: Option<String>,
    #[serde(default = "empty_object")]
    pub keywords: Value,
    #[serde(default = "empty_object")]
    pub protocols: Value,
}

impl SinglepointSpecification {
    fn normalize(&mut self) {
        self.program = self.program.trim().to_lowercase();
        self.method = self.method.trim().to_lowercase();
        self.basis = self
            .basis
            .take()
            .map(|b| b.trim().to_lowercase())
            .filter(|b| !b.is_empty());
    }

    fn canonical_value(&self) -> Value {
        json!({
            "program": self.program,
            "driver": self.driver.as_str(),
            "method": self.method,
            "basis": self.basis,
            "keywords": self.keywords,
            "protocols": self.protocols,
        })
    }

    fn validate(&self) -> Result<(), QcGridError> {
        if self.program.is_empty() {
            return Err(QcGridError::InvalidInput(
                "singlepoint specification requires a program".into(),
            ));
        }
        if self.method.is_empty() {
            return Err(QcGridError::InvalidInput(
                "singlepoint specification requires a method".into(),
            ));
        }
        require_object(&self.keywords, "keywords")?;
        require_object(&self.protocols, "protocols")
    }

    fn describe(&self) -> String {
        format!(
            "{} {}/{}",
            self.program,
            self.method,
            self.basis.as_deref().unwrap_or("(no basis)")
        )
    }
}

// ── Optimization ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationSpecification {
    /// Optimizer program (geometric, berny, ...).
    pub program: String,
    #[serde(default = "empty_object")]
    pub keywords: Value,
    #[serde(default = "empty_object")]
    pub protocols: Value,
    /// Gradient provider run at each optimization step.
    pub qc_specification: SinglepointSpecification,
}

impl OptimizationSpecification {
    fn normalize(&mut self) {
        self.program = self.program.trim().to_lowercase();
        self.qc_specification.normalize();
    }

    fn canonical_value(&self) -> Value {
        json!({
            "program": self.program,
            "keywords": self.keywords,
            "protocols": self.protocols,
            "qc_specification": self.qc_specification.canonical_value(),
        })
    }

    fn validate(&self) -> Result<(), QcGridError> {
        if self.program.is_empty() {
            return Err(QcGridError::InvalidInput(
                "optimization specification requires a program".into(),
            ));
        }
        require_object(&self.keywords, "keywords")?;
        self.qc_specification.validate()
    }

    /// Programs a worker needs to run one optimization.
    pub fn required_programs(&self) -> Vec<String> {
        let mut programs = vec![self.program.clone(), self.qc_specification.program.clone()];
        programs.sort();
        programs.dedup();
        programs
    }
}

// ── Torsiondrive ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorsiondriveKeywords {
    /// Dihedrals to drive, as atom index quadruplets.
    pub dihedrals: Vec<[usize; 4]>,
    /// Grid spacing in degrees, one per dihedral.
    pub grid_spacing: Vec<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy_upper_limit: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TorsiondriveSpecification {
    pub program: String,
    pub optimization_specification: OptimizationSpecification,
    pub keywords: TorsiondriveKeywords,
}

// ── Gridoptimization ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanType {
    Distance,
    Angle,
    Dihedral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepType {
    Absolute,
    Relative,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanDimension {
    #[serde(rename = "type")]
    pub scan_type: ScanType,
    pub indices: Vec<usize>,
    pub steps: Vec<f64>,
    pub step_type: StepType,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridoptimizationKeywords {
    pub scans: Vec<ScanDimension>,
    #[serde(default)]
    pub preoptimization: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridoptimizationSpecification {
    pub program: String,
    pub optimization_specification: OptimizationSpecification,
    pub keywords: GridoptimizationKeywords,
}

// ── NEB ───────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NebKeywords {
    pub images: usize,
    #[serde(default = "default_spring_constant")]
    pub spring_constant: f64,
}

fn default_spring_constant() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NebSpecification {
    pub program: String,
    pub singlepoint_specification: SinglepointSpecification,
    pub keywords: NebKeywords,
}

// ── Reaction ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReactionSpecification {
    pub singlepoint_specification: SinglepointSpecification,
    #[serde(default = "empty_object")]
    pub keywords: Value,
}

// ── Manybody ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManybodyKeywords {
    /// Largest cluster size to expand. Absent means the full system.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_nbody: Option<usize>,
    #[serde(default)]
    pub bsse_correction: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManybodySpecification {
    pub singlepoint_specification: SinglepointSpecification,
    pub keywords: ManybodyKeywords,
}

// ── The tagged union ──────────────────────────────────────────

/// Record-type-specific computation recipe. The `record_type` tag doubles as
/// the record discriminator everywhere else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "record_type", rename_all = "lowercase")]
pub enum Specification {
    Singlepoint(SinglepointSpecification),
    Optimization(OptimizationSpecification),
    Torsiondrive(TorsiondriveSpecification),
    Gridoptimization(GridoptimizationSpecification),
    Neb(NebSpecification),
    Reaction(ReactionSpecification),
    Manybody(ManybodySpecification),
}

impl Specification {
    pub fn record_type(&self) -> RecordType {
        match self {
            Self::Singlepoint(_) => RecordType::Singlepoint,
            Self::Optimization(_) => RecordType::Optimization,
            Self::Torsiondrive(_) => RecordType::Torsiondrive,
            Self::Gridoptimization(_) => RecordType::Gridoptimization,
            Self::Neb(_) => RecordType::Neb,
            Self::Reaction(_) => RecordType::Reaction,
            Self::Manybody(_) => RecordType::Manybody,
        }
    }

    /// Lowercase/trim the fields the hash is case-insensitive over.
    pub fn normalize(&mut self) {
        match self {
            Self::Singlepoint(s) => s.normalize(),
            Self::Optimization(s) => s.normalize(),
            Self::Torsiondrive(s) => {
                s.program = s.program.trim().to_lowercase();
                s.optimization_specification.normalize();
            }
            Self::Gridoptimization(s) => {
                s.program = s.program.trim().to_lowercase();
                s.optimization_specification.normalize();
            }
            Self::Neb(s) => {
                s.program = s.program.trim().to_lowercase();
                s.singlepoint_specification.normalize();
            }
            Self::Reaction(s) => s.singlepoint_specification.normalize(),
            Self::Manybody(s) => s.singlepoint_specification.normalize(),
        }
    }

    pub fn validate(&self) -> Result<(), QcGridError> {
        match self {
            Self::Singlepoint(s) => s.validate(),
            Self::Optimization(s) => s.validate(),
            Self::Torsiondrive(s) => {
                if s.keywords.dihedrals.is_empty() {
                    return Err(QcGridError::InvalidInput(
                        "torsiondrive requires at least one dihedral".into(),
                    ));
                }
                if s.keywords.grid_spacing.len() != s.keywords.dihedrals.len() {
                    return Err(QcGridError::InvalidInput(
                        "torsiondrive grid_spacing must match dihedrals".into(),
                    ));
                }
                if s.keywords.grid_spacing.iter().any(|g| *g <= 0 || 360 % *g != 0) {
                    return Err(QcGridError::InvalidInput(
                        "torsiondrive grid_spacing must evenly divide 360".into(),
                    ));
                }
                s.optimization_specification.validate()
            }
            Self::Gridoptimization(s) => {
                if s.keywords.scans.is_empty() {
                    return Err(QcGridError::InvalidInput(
                        "gridoptimization requires at least one scan dimension".into(),
                    ));
                }
                if s.keywords.scans.iter().any(|d| d.steps.is_empty()) {
                    return Err(QcGridError::InvalidInput(
                        "gridoptimization scan dimensions require steps".into(),
                    ));
                }
                s.optimization_specification.validate()
            }
            Self::Neb(s) => {
                if s.keywords.images < 3 {
                    return Err(QcGridError::InvalidInput(
                        "neb requires at least 3 images".into(),
                    ));
                }
                s.singlepoint_specification.validate()
            }
            Self::Reaction(s) => s.singlepoint_specification.validate(),
            Self::Manybody(s) => s.singlepoint_specification.validate(),
        }
    }

    /// Canonical hash of the normalized specification content.
    pub fn specification_hash(&self) -> String {
        let mut normalized = self.clone();
        normalized.normalize();
        hashing::hash_value(&normalized.canonical_value())
    }

    fn canonical_value(&self) -> Value {
        match self {
            Self::Singlepoint(s) => s.canonical_value(),
            Self::Optimization(s) => s.canonical_value(),
            Self::Torsiondrive(s) => json!({
                "program": s.program,
                "optimization_specification": s.optimization_specification.canonical_value(),
                "keywords": serde_json::to_value(&s.keywords).unwrap_or(Value::Null),
            }),
            Self::Gridoptimization(s) => json!({
                "program": s.program,
                "optimization_specification": s.optimization_specification.canonical_value(),
                "keywords": serde_json::to_value(&s.keywords).unwrap_or(Value::Null),
            }),
            Self::Neb(s) => json!({
                "program": s.program,
                "singlepoint_specification": s.singlepoint_specification.canonical_value(),
                "keywords": serde_json::to_value(&s.keywords).unwrap_or(Value::Null),
            }),
            Self::Reaction(s) => json!({
                "singlepoint_specification": s.singlepoint_specification.canonical_value(),
                "keywords": s.keywords,
            }),
            Self::Manybody(s) => json!({
                "singlepoint_specification": s.singlepoint_specification.canonical_value(),
                "keywords": serde_json::to_value(&s.keywords).unwrap_or(Value::Null),
            }),
        }
    }

    /// Programs a worker must provide to run a task of this specification.
    /// Only meaningful for atomic types; service children derive theirs from
    /// the child specification.
    pub fn required_programs(&self) -> Vec<String> {
        match self {
            Self::Singlepoint(s) => vec![s.program.clone()],
            Self::Optimization(s) => s.required_programs(),
            _ => Vec::new(),
        }
    }

    /// The function a worker runs for a task of this specification.
    /// Only atomic types reach the task queue directly.
    pub fn task_function(&self) -> &'static str {
        match self {
            Self::Singlepoint(_) => "qcengine.compute",
            Self::Optimization(_) => "qcengine.compute_procedure",
            _ => "qcengine.compute",
        }
    }

    /// One-line human-readable description, used in listings.
    pub fn short_description(&self) -> String {
        match self {
            Self::Singlepoint(s) => {
                format!("singlepoint {} {}", s.driver.as_str(), s.describe())
            }
            Self::Optimization(s) => {
                format!("optimization {} / {}", s.program, s.qc_specification.describe())
            }
            Self::Torsiondrive(s) => format!(
                "torsiondrive over {} dihedral(s) / {}",
                s.keywords.dihedrals.len(),
                s.optimization_specification.qc_specification.describe()
            ),
            Self::Gridoptimization(s) => format!(
                "gridoptimization over {} dimension(s) / {}",
                s.keywords.scans.len(),
                s.optimization_specification.qc_specification.describe()
            ),
            Self::Neb(s) => format!(
                "neb with {} images / {}",
                s.keywords.images,
                s.singlepoint_specification.describe()
            ),
            Self::Reaction(s) => {
                format!("reaction energy / {}", s.singlepoint_specification.describe())
            }
            Self::Manybody(s) => {
                format!("manybody expansion / {}", s.singlepoint_specification.describe())
            }
        }
    }
}

fn empty_object() -> Value {
    Value::Object(serde_json::Map::new())
}

fn require_object(v: &Value, field: &str) -> Result<(), QcGridError> {
    if v.is_object() {
        Ok(())
    } else {
        Err(QcGridError::InvalidInput(format!(
            "{field} must be a JSON object"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn sp_spec(program: &str, method: &str, basis: &str) -> SinglepointSpecification {
        SinglepointSpecification {
            program: program.into(),
            driver: SinglepointDriver::Energy,
            method: method.into(),
            basis: Some(basis.into()),
            keywords: empty_object(),
            protocols: empty_object(),
        }
    }

    #[test]
    fn test_hash_case_insensitive() {
        let a = Specification::Singlepoint(sp_spec("Psi4", "B3LYP", "def2-SVP"));
        let b = Specification::Singlepoint(sp_spec("psi4", "b3lyp", "def2-svp"));
        assert_eq!(a.specification_hash(), b.specification_hash());
    }

    #[test]
    fn test_hash_differs_on_method() {
        let a = Specification::Singlepoint(sp_spec("psi4", "b3lyp", "def2-svp"));
        let b = Specification::Singlepoint(sp_spec("psi4", "hf", "def2-svp"));
        assert_ne!(a.specification_hash(), b.specification_hash());
    }

    #[test]
    fn test_hash_keyword_order_insensitive() {
        let mut a = sp_spec("psi4", "hf", "sto-3g");
        a.keywords = serde_json::from_str(r#"{"scf_type": "df", "maxiter": 50}"#).unwrap();
        let mut b = sp_spec("psi4", "hf", "sto-3g");
        b.keywords = serde_json::from_str(r#"{"maxiter": 50, "scf_type": "df"}"#).unwrap();
        assert_eq!(
            Specification::Singlepoint(a).specification_hash(),
            Specification::Singlepoint(b).specification_hash()
        );
    }

    #[test]
    fn test_empty_basis_collapses_to_none() {
        let mut with_empty = sp_spec("psi4", "hf", "  ");
        with_empty.normalize();
        assert_eq!(with_empty.basis, None);

        let without = SinglepointSpecification {
            basis: None,
            ..sp_spec("psi4", "hf", "x")
        };
        assert_eq!(
            Specification::Singlepoint(with_empty).specification_hash(),
            Specification::Singlepoint(without).specification_hash()
        );
    }

    #[test]
    fn test_validate_rejects_empty_program() {
        let spec = Specification::Singlepoint(sp_spec("", "hf", "sto-3g"));
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_torsiondrive_validation() {
        let spec = Specification::Torsiondrive(TorsiondriveSpecification {
            program: "torsiondrive".into(),
            optimization_specification: OptimizationSpecification {
                program: "geometric".into(),
                keywords: empty_object(),
                protocols: empty_object(),
                qc_specification: sp_spec("psi4", "hf", "sto-3g"),
            },
            keywords: TorsiondriveKeywords {
                dihedrals: vec![[0, 1, 2, 3]],
                grid_spacing: vec![90],
                energy_upper_limit: None,
            },
        });
        assert!(spec.validate().is_ok());

        let bad = Specification::Torsiondrive(TorsiondriveSpecification {
            keywords: TorsiondriveKeywords {
                dihedrals: vec![[0, 1, 2, 3]],
                grid_spacing: vec![7],
                energy_upper_limit: None,
            },
            ..match spec {
                Specification::Torsiondrive(s) => s,
                _ => unreachable!(),
            }
        });
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_optimization_required_programs() {
        let spec = OptimizationSpecification {
            program: "geometric".into(),
            keywords: empty_object(),
            protocols: empty_object(),
            qc_specification: sp_spec("psi4", "hf", "sto-3g"),
        };
        assert_eq!(spec.required_programs(), vec!["geometric", "psi4"]);
    }

    #[test]
    fn test_serde_round_trip_tagged() {
        let spec = Specification::Singlepoint(sp_spec("psi4", "hf", "sto-3g"));
        let text = serde_json::to_string(&spec).unwrap();
        assert!(text.contains(r#""record_type":"singlepoint""#));
        let back: Specification = serde_json::from_str(&text).unwrap();
        assert_eq!(back.specification_hash(), spec.specification_hash());
    }
}
