//! Torsiondrive service.
//!
//! Sweeps each driven dihedral in turn: one round of constrained
//! optimizations per dihedral, every grid angle in parallel, seeded from the
//! lowest-energy structure of the previous round. Earlier dihedrals stay
//! pinned at their winning angle while later ones sweep.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::QcGridError;
use crate::molecule::MoleculeRef;
use crate::record::RecordAddInput;
use crate::specification::{Specification, TorsiondriveSpecification};

use super::{ChildSpec, IterateOutcome, ServiceContext};

#[derive(Debug, Serialize, Deserialize)]
struct TorsiondriveState {
    /// Dihedral currently sweeping (index into keywords.dihedrals).
    round: usize,
    /// Winning angle of each completed round.
    best_angles: Vec<i32>,
    /// Structure seeding the current round's children.
    seed_molecule_id: i64,
    /// Minimum energy per visited grid key.
    final_energies: Map<String, Value>,
}

fn sweep_angles(grid_spacing: i32) -> Vec<i32> {
    (0..360 / grid_spacing)
        .map(|k| -180 + k * grid_spacing)
        .collect()
}

fn point_key(round: usize, angle: i32) -> String {
    format!("d{round}_{angle}")
}

/// Constrained optimization child: completed dihedrals pinned, the current
/// one held at `angle`.
fn sweep_child(
    ctx: &ServiceContext,
    spec: &TorsiondriveSpecification,
    state: &TorsiondriveState,
    angle: i32,
) -> ChildSpec {
    let mut constraints: Vec<Value> = state
        .best_angles
        .iter()
        .enumerate()
        .map(|(i, best)| {
            json!({
                "type": "dihedral",
                "indices": spec.keywords.dihedrals[i],
                "value": best,
            })
        })
        .collect();
    constraints.push(json!({
        "type": "dihedral",
        "indices": spec.keywords.dihedrals[state.round],
        "value": angle,
    }));

    let mut child_spec = spec.optimization_specification.clone();
    if let Value::Object(keywords) = &mut child_spec.keywords {
        keywords.insert("constraints".into(), json!({ "set": constraints }));
    }

    ChildSpec {
        key: point_key(state.round, angle),
        input: RecordAddInput {
            specification: Specification::Optimization(child_spec),
            molecules: vec![MoleculeRef::Id(state.seed_molecule_id)],
            input_data: Value::Null,
            extras: None,
            tag: ctx.tag.to_string(),
            priority: ctx.priority,
            owner_user: None,
            owner_group: None,
        },
    }
}

fn spawn_round(
    ctx: &ServiceContext,
    spec: &TorsiondriveSpecification,
    state: TorsiondriveState,
) -> Result<IterateOutcome, QcGridError> {
    let children: Vec<ChildSpec> = sweep_angles(spec.keywords.grid_spacing[state.round])
        .into_iter()
        .map(|angle| sweep_child(ctx, spec, &state, angle))
        .collect();
    Ok(IterateOutcome::NeedMoreWork {
        children,
        state: serde_json::to_value(state)?,
    })
}

pub(super) fn iterate(ctx: &ServiceContext) -> Result<IterateOutcome, QcGridError> {
    let spec = match ctx.specification {
        Specification::Torsiondrive(s) => s,
        _ => {
            return Err(QcGridError::InvalidInput(
                "torsiondrive service requires a torsiondrive specification".into(),
            ))
        }
    };
    let starting_molecule_id = *ctx.molecule_ids.first().ok_or_else(|| {
        QcGridError::InvalidInput("torsiondrive requires one input molecule".into())
    })?;

    if ctx.state.is_null() {
        let state = TorsiondriveState {
            round: 0,
            best_angles: Vec::new(),
            seed_molecule_id: starting_molecule_id,
            final_energies: Map::new(),
        };
        return spawn_round(ctx, spec, state);
    }

    let mut state: TorsiondriveState = serde_json::from_value(ctx.state.clone())?;

    // fold in the finished round and pick the winner
    let mut best: Option<(i32, f64, Option<i64>)> = None;
    for angle in sweep_angles(spec.keywords.grid_spacing[state.round]) {
        let key = point_key(state.round, angle);
        let dep = super::dep_by_key(ctx.deps, &key)?;
        let energy = dep.energy()?;
        if let Some(limit) = spec.keywords.energy_upper_limit {
            if energy > limit {
                // above the cap the point is recorded but cannot win
                state.final_energies.insert(key, json!(energy));
                continue;
            }
        }
        state.final_energies.insert(key, json!(energy));
        if best.map(|(_, e, _)| energy < e).unwrap_or(true) {
            best = Some((angle, energy, dep.final_molecule_id()));
        }
    }
    let (best_angle, best_energy, best_molecule) = best.ok_or_else(|| {
        QcGridError::Internal(anyhow::anyhow!(
            "torsiondrive round {} produced no usable energies",
            state.round
        ))
    })?;

    state.best_angles.push(best_angle);
    state.seed_molecule_id = best_molecule.unwrap_or(state.seed_molecule_id);
    state.round += 1;

    if state.round >= spec.keywords.dihedrals.len() {
        return Ok(IterateOutcome::Finished {
            properties: json!({
                "final_energies": state.final_energies,
                "minimum_angles": state.best_angles,
                "minimum_energy": best_energy,
            }),
        });
    }
    spawn_round(ctx, spec, state)
}
