//! Grid optimization service.
//!
//! Walks the scan grid sequentially: one constrained optimization child per
//! grid point, each seeded with the previous point's relaxed structure. An
//! optional preoptimization child relaxes the input structure first.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::QcGridError;
use crate::molecule::MoleculeRef;
use crate::record::RecordAddInput;
use crate::specification::{GridoptimizationSpecification, Specification};

use super::{dep_by_key, ChildSpec, IterateOutcome, ServiceContext};

#[derive(Debug, Serialize, Deserialize, PartialEq)]
enum Phase {
    Preoptimization,
    Scanning,
}

#[derive(Debug, Serialize, Deserialize)]
struct GridoptState {
    phase: Phase,
    /// Every grid point as per-dimension step indices, visit order.
    grid: Vec<Vec<usize>>,
    /// Index into `grid` of the point whose child is outstanding.
    cursor: usize,
    /// Molecule that seeded the outstanding child.
    seed_molecule_id: i64,
    /// Final energy per visited grid key.
    final_energies: Map<String, Value>,
}

fn grid_key(point: &[usize]) -> String {
    let parts: Vec<String> = point.iter().map(|i| i.to_string()).collect();
    parts.join(",")
}

/// Row-major cartesian product over the scan dimensions.
fn enumerate_grid(spec: &GridoptimizationSpecification) -> Vec<Vec<usize>> {
    let sizes: Vec<usize> = spec.keywords.scans.iter().map(|s| s.steps.len()).collect();
    let total: usize = sizes.iter().product();
    let mut grid = Vec::with_capacity(total);
    for mut flat in 0..total {
        let mut point = vec![0; sizes.len()];
        for (d, size) in sizes.iter().enumerate().rev() {
            point[d] = flat % size;
            flat /= size;
        }
        grid.push(point);
    }
    grid
}

/// Constrained child optimization for one grid point.
fn grid_child(
    ctx: &ServiceContext,
    spec: &GridoptimizationSpecification,
    point: &[usize],
    seed_molecule_id: i64,
) -> ChildSpec {
    let constraints: Vec<Value> = spec
        .keywords
        .scans
        .iter()
        .zip(point)
        .map(|(dim, &step)| {
            json!({
                "type": dim.scan_type,
                "indices": dim.indices,
                "step_type": dim.step_type,
                "value": dim.steps[step],
            })
        })
        .collect();

    let mut child_spec = spec.optimization_specification.clone();
    if let Value::Object(keywords) = &mut child_spec.keywords {
        keywords.insert("constraints".into(), json!({ "set": constraints }));
    }

    ChildSpec {
        key: format!("go_{}", grid_key(point)),
        input: RecordAddInput {
            specification: Specification::Optimization(child_spec),
            molecules: vec![MoleculeRef::Id(seed_molecule_id)],
            input_data: Value::Null,
            extras: None,
            tag: ctx.tag.to_string(),
            priority: ctx.priority,
            owner_user: None,
            owner_group: None,
        },
    }
}

pub(super) fn iterate(ctx: &ServiceContext) -> Result<IterateOutcome, QcGridError> {
    let spec = match ctx.specification {
        Specification::Gridoptimization(s) => s,
        _ => {
            return Err(QcGridError::InvalidInput(
                "gridoptimization service requires a gridoptimization specification".into(),
            ))
        }
    };
    let starting_molecule_id = *ctx.molecule_ids.first().ok_or_else(|| {
        QcGridError::InvalidInput("gridoptimization requires one input molecule".into())
    })?;

    if ctx.state.is_null() {
        let grid = enumerate_grid(spec);
        if spec.keywords.preoptimization {
            let mut unconstrained = spec.optimization_specification.clone();
            if let Value::Object(keywords) = &mut unconstrained.keywords {
                keywords.remove("constraints");
            }
            let child = ChildSpec {
                key: "preopt".into(),
                input: RecordAddInput {
                    specification: Specification::Optimization(unconstrained),
                    molecules: vec![MoleculeRef::Id(starting_molecule_id)],
                    input_data: Value::Null,
                    extras: None,
                    tag: ctx.tag.to_string(),
                    priority: ctx.priority,
                    owner_user: None,
                    owner_group: None,
                },
            };
            let state = serde_json::to_value(GridoptState {
                phase: Phase::Preoptimization,
                grid,
                cursor: 0,
                seed_molecule_id: starting_molecule_id,
                final_energies: Map::new(),
            })?;
            return Ok(IterateOutcome::NeedMoreWork {
                children: vec![child],
                state,
            });
        }

        let child = grid_child(ctx, spec, &grid[0], starting_molecule_id);
        let state = serde_json::to_value(GridoptState {
            phase: Phase::Scanning,
            grid,
            cursor: 0,
            seed_molecule_id: starting_molecule_id,
            final_energies: Map::new(),
        })?;
        return Ok(IterateOutcome::NeedMoreWork {
            children: vec![child],
            state,
        });
    }

    let mut state: GridoptState = serde_json::from_value(ctx.state.clone())?;

    if state.phase == Phase::Preoptimization {
        let dep = dep_by_key(ctx.deps, "preopt")?;
        let seed = dep.final_molecule_id().unwrap_or(starting_molecule_id);
        let child = grid_child(ctx, spec, &state.grid[0], seed);
        state.phase = Phase::Scanning;
        state.cursor = 0;
        state.seed_molecule_id = seed;
        return Ok(IterateOutcome::NeedMoreWork {
            children: vec![child],
            state: serde_json::to_value(state)?,
        });
    }

    // scanning: fold in the finished point, then either advance or finish
    let point = state.grid[state.cursor].clone();
    let dep = dep_by_key(ctx.deps, &format!("go_{}", grid_key(&point)))?;
    state
        .final_energies
        .insert(grid_key(&point), json!(dep.energy()?));

    let next = state.cursor + 1;
    if next >= state.grid.len() {
        return Ok(IterateOutcome::Finished {
            properties: json!({
                "final_energies": state.final_energies,
                "n_grid_points": state.grid.len(),
                "starting_molecule_id": starting_molecule_id,
            }),
        });
    }

    let seed = dep.final_molecule_id().unwrap_or(state.seed_molecule_id);
    let child = grid_child(ctx, spec, &state.grid[next], seed);
    state.cursor = next;
    state.seed_molecule_id = seed;
    Ok(IterateOutcome::NeedMoreWork {
        children: vec![child],
        state: serde_json::to_value(state)?,
    })
}
