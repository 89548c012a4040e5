//! Result payloads returned by managers.
//!
//! A discriminated union over `schema_name`. Beyond the small set of fields
//! the engine needs (`success`, outputs, error, properties, provenance) the
//! payloads are opaque - the core never interprets scientific content.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::molecule::Molecule;
use crate::types::RecordType;

/// Domain-level failure reported by a manager. Stored as the record's
/// terminal `error` output, never surfaced as an HTTP error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeError {
    pub error_type: String,
    pub error_message: String,
}

/// Atomic (singlepoint) result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AtomicResult {
    pub success: bool,
    #[serde(default)]
    pub return_result: Option<Value>,
    #[serde(default)]
    pub properties: Map<String, Value>,
    #[serde(default)]
    pub provenance: Option<Value>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub error: Option<ComputeError>,
}

/// Optimization result; the trajectory is an ordered list of atomic results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizationResult {
    pub success: bool,
    #[serde(default)]
    pub final_molecule: Option<Molecule>,
    #[serde(default)]
    pub energies: Vec<f64>,
    #[serde(default)]
    pub trajectory: Vec<AtomicResult>,
    #[serde(default)]
    pub provenance: Option<Value>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub error: Option<ComputeError>,
}

/// Generic envelope for service subtasks and anything the server does not
/// model more precisely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenericTaskResult {
    pub success: bool,
    #[serde(default)]
    pub results: Option<Value>,
    #[serde(default)]
    pub provenance: Option<Value>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub error: Option<ComputeError>,
}

/// What a manager hands back for one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "schema_name")]
pub enum ResultPayload {
    #[serde(rename = "qcschema_output")]
    Atomic(AtomicResult),
    #[serde(rename = "qcschema_optimization_output")]
    Optimization(OptimizationResult),
    #[serde(rename = "generic_task_result")]
    Generic(GenericTaskResult),
}

impl ResultPayload {
    pub fn success(&self) -> bool {
        match self {
            Self::Atomic(r) => r.success,
            Self::Optimization(r) => r.success,
            Self::Generic(r) => r.success,
        }
    }

    pub fn stdout(&self) -> Option<&str> {
        match self {
            Self::Atomic(r) => r.stdout.as_deref(),
            Self::Optimization(r) => r.stdout.as_deref(),
            Self::Generic(r) => r.stdout.as_deref(),
        }
    }

    pub fn stderr(&self) -> Option<&str> {
        match self {
            Self::Atomic(r) => r.stderr.as_deref(),
            Self::Optimization(r) => r.stderr.as_deref(),
            Self::Generic(r) => r.stderr.as_deref(),
        }
    }

    pub fn error(&self) -> Option<&ComputeError> {
        match self {
            Self::Atomic(r) => r.error.as_ref(),
            Self::Optimization(r) => r.error.as_ref(),
            Self::Generic(r) => r.error.as_ref(),
        }
    }

    pub fn provenance(&self) -> Option<&Value> {
        match self {
            Self::Atomic(r) => r.provenance.as_ref(),
            Self::Optimization(r) => r.provenance.as_ref(),
            Self::Generic(r) => r.provenance.as_ref(),
        }
    }

    /// The final molecule of an optimization, if any. The return path
    /// upserts it so that services can chain from it.
    pub fn final_molecule(&self) -> Option<&Molecule> {
        match self {
            Self::Optimization(r) => r.final_molecule.as_ref(),
            _ => None,
        }
    }
}

/// Record-type-specific post-processing of a successful payload into the
/// record's `properties`. Extracts the canonical scalars the engine and the
/// service iterators rely on; everything else is carried through untouched.
pub fn extract_properties(record_type: RecordType, payload: &ResultPayload) -> Value {
    match (record_type, payload) {
        (RecordType::Singlepoint, ResultPayload::Atomic(r)) => {
            let mut props = r.properties.clone();
            if let Some(ret) = &r.return_result {
                // canonical scalar: a plain energy return lands under a
                // stable key regardless of driver
                if ret.is_number() {
                    props.insert("return_energy".into(), ret.clone());
                }
                props.insert("return_result".into(), ret.clone());
            }
            Value::Object(props)
        }
        (RecordType::Optimization, ResultPayload::Optimization(r)) => {
            json!({
                "energies": r.energies,
                "final_energy": r.energies.last(),
                "n_trajectory_steps": r.trajectory.len(),
            })
        }
        (_, ResultPayload::Generic(r)) => r.results.clone().unwrap_or(Value::Null),
        // mismatched payload kinds keep whatever the payload carries
        (_, ResultPayload::Atomic(r)) => Value::Object(r.properties.clone()),
        (_, ResultPayload::Optimization(r)) => json!({ "energies": r.energies }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn success_atomic(energy: f64) -> ResultPayload {
        ResultPayload::Atomic(AtomicResult {
            success: true,
            return_result: Some(json!(energy)),
            properties: Map::new(),
            provenance: Some(json!({"creator": "fake"})),
            stdout: Some("ok".into()),
            stderr: None,
            error: None,
        })
    }

    #[test]
    fn test_schema_name_discriminator() {
        let text = serde_json::to_string(&success_atomic(-1.5)).unwrap();
        assert!(text.contains(r#""schema_name":"qcschema_output""#));
        let back: ResultPayload = serde_json::from_str(&text).unwrap();
        assert!(back.success());
    }

    #[test]
    fn test_singlepoint_canonical_scalar() {
        let props = extract_properties(RecordType::Singlepoint, &success_atomic(-76.02));
        assert_eq!(props["return_energy"], json!(-76.02));
    }

    #[test]
    fn test_optimization_final_energy() {
        let payload = ResultPayload::Optimization(OptimizationResult {
            success: true,
            final_molecule: None,
            energies: vec![-1.0, -1.5, -1.7],
            trajectory: vec![],
            provenance: None,
            stdout: None,
            stderr: None,
            error: None,
        });
        let props = extract_properties(RecordType::Optimization, &payload);
        assert_eq!(props["final_energy"], json!(-1.7));
        assert_eq!(props["n_trajectory_steps"], json!(0));
    }

    #[test]
    fn test_failure_payload_parses() {
        let text = r#"{
            "schema_name": "qcschema_output",
            "success": false,
            "error": {"error_type": "scf_convergence", "error_message": "did not converge"}
        }"#;
        let payload: ResultPayload = serde_json::from_str(text).unwrap();
        assert!(!payload.success());
        assert_eq!(payload.error().unwrap().error_type, "scf_convergence");
    }
}
