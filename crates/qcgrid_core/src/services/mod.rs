//! Service state machines.
//!
//! A service record is driven by repeated calls to [`iterate`]: a pure
//! transition from `(specification, state, completed child results)` to
//! either a finished property set or a new batch of child records. All
//! persistence - inserting children, recording dependencies, locking -
//! belongs to the iteration driver in the storage layer; nothing here
//! touches a database.
//!
//! The state machines only do bookkeeping (grid enumeration, seeding the
//! next child from a previous final structure, energy sums). The chemistry
//! happens on the workers.

mod gridoptimization;
mod manybody;
mod neb;
mod reaction;
mod torsiondrive;

use serde_json::Value;

use crate::error::QcGridError;
use crate::molecule::Molecule;
use crate::record::RecordAddInput;
use crate::specification::Specification;
use crate::types::{PriorityEnum, RecordStatus, RecordType};

/// Everything an iteration step may look at. Assembled by the driver.
#[derive(Debug)]
pub struct ServiceContext<'a> {
    pub record_id: i64,
    pub specification: &'a Specification,
    /// Resolved input molecules, in submission order.
    pub molecules: &'a [Molecule],
    pub molecule_ids: &'a [i64],
    pub input_data: &'a Value,
    pub iteration: i32,
    /// Iterator-owned state. `Null` on the first call.
    pub state: &'a Value,
    /// Results of the children spawned by the previous call.
    pub deps: &'a [DependencyResult],
    pub tag: &'a str,
    pub priority: PriorityEnum,
}

/// A completed (or failed) child, keyed by the name the iterator gave it.
#[derive(Debug, Clone)]
pub struct DependencyResult {
    pub key: String,
    pub record_id: i64,
    pub status: RecordStatus,
    pub properties: Value,
}

impl DependencyResult {
    /// Canonical scalar energy of a completed child, wherever the record
    /// type put it.
    pub fn energy(&self) -> Result<f64, QcGridError> {
        self.properties
            .get("return_energy")
            .or_else(|| self.properties.get("final_energy"))
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                QcGridError::Internal(anyhow::anyhow!(
                    "dependency record {} carries no energy",
                    self.record_id
                ))
            })
    }

    /// Id of the molecule an optimization child relaxed into.
    pub fn final_molecule_id(&self) -> Option<i64> {
        self.properties.get("final_molecule_id").and_then(Value::as_i64)
    }
}

/// One child record the iterator wants spawned. The key identifies the
/// child in the next round's dependency results and salts the service
/// dependency row.
#[derive(Debug)]
pub struct ChildSpec {
    pub key: String,
    pub input: RecordAddInput,
}

/// Result of one iteration step.
#[derive(Debug)]
pub enum IterateOutcome {
    /// The service is done; the record completes with these properties.
    Finished { properties: Value },
    /// Spawn these children and iterate again once they complete. `state`
    /// replaces the iterator state.
    NeedMoreWork { children: Vec<ChildSpec>, state: Value },
}

/// Dispatch one iteration step for a service record type.
pub fn iterate(ctx: &ServiceContext) -> Result<IterateOutcome, QcGridError> {
    match ctx.specification.record_type() {
        RecordType::Reaction => reaction::iterate(ctx),
        RecordType::Manybody => manybody::iterate(ctx),
        RecordType::Gridoptimization => gridoptimization::iterate(ctx),
        RecordType::Torsiondrive => torsiondrive::iterate(ctx),
        RecordType::Neb => neb::iterate(ctx),
        other => Err(QcGridError::InvalidInput(format!(
            "record type {other} is not a service"
        ))),
    }
}

/// Whether a child error should be tolerated instead of failing the parent.
/// No current service type tolerates errors; the policy hook stays so a
/// type can opt out without touching the driver.
pub fn tolerates_child_errors(record_type: RecordType) -> bool {
    match record_type {
        RecordType::Torsiondrive
        | RecordType::Gridoptimization
        | RecordType::Neb
        | RecordType::Reaction
        | RecordType::Manybody => false,
        RecordType::Singlepoint | RecordType::Optimization => false,
    }
}

/// Look up a dependency by key, failing if the driver did not deliver it.
pub(crate) fn dep_by_key<'a>(
    deps: &'a [DependencyResult],
    key: &str,
) -> Result<&'a DependencyResult, QcGridError> {
    deps.iter().find(|d| d.key == key).ok_or_else(|| {
        QcGridError::Internal(anyhow::anyhow!("missing dependency result for key {key}"))
    })
}
