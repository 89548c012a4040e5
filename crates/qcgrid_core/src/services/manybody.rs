//! Many-body expansion service.
//!
//! Spawns a singlepoint child for every fragment cluster up to `max_nbody`,
//! then assembles the expansion by inclusion-exclusion over cluster
//! energies.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::QcGridError;
use crate::molecule::MoleculeRef;
use crate::record::RecordAddInput;
use crate::specification::Specification;

use super::{dep_by_key, ChildSpec, IterateOutcome, ServiceContext};

#[derive(Debug, Serialize, Deserialize)]
struct ManybodyState {
    /// Clusters in spawn order, each an ordered fragment index list.
    clusters: Vec<Vec<usize>>,
}

fn cluster_key(cluster: &[usize]) -> String {
    let joined: Vec<String> = cluster.iter().map(|i| i.to_string()).collect();
    format!("mb_{}", joined.join("_"))
}

/// All k-subsets of 0..n, lexicographic.
fn combinations(n: usize, k: usize) -> Vec<Vec<usize>> {
    let mut out = Vec::new();
    let mut current: Vec<usize> = (0..k).collect();
    if k == 0 || k > n {
        return out;
    }
    loop {
        out.push(current.clone());
        // advance
        let mut i = k;
        loop {
            if i == 0 {
                return out;
            }
            i -= 1;
            if current[i] != i + n - k {
                break;
            }
            if i == 0 {
                return out;
            }
        }
        current[i] += 1;
        for j in i + 1..k {
            current[j] = current[j - 1] + 1;
        }
    }
}

pub(super) fn iterate(ctx: &ServiceContext) -> Result<IterateOutcome, QcGridError> {
    let spec = match ctx.specification {
        Specification::Manybody(s) => s,
        _ => {
            return Err(QcGridError::InvalidInput(
                "manybody service requires a manybody specification".into(),
            ))
        }
    };

    let molecule = ctx.molecules.first().ok_or_else(|| {
        QcGridError::InvalidInput("manybody requires one input molecule".into())
    })?;
    let n_fragments = molecule.n_fragments();
    if n_fragments < 2 {
        return Err(QcGridError::InvalidInput(
            "manybody requires a molecule with at least two fragments".into(),
        ));
    }

    if ctx.state.is_null() {
        let max_nbody = spec.keywords.max_nbody.unwrap_or(n_fragments).min(n_fragments);
        if max_nbody == 0 {
            return Err(QcGridError::InvalidInput("max_nbody must be positive".into()));
        }

        let mut clusters = Vec::new();
        for size in 1..=max_nbody {
            clusters.extend(combinations(n_fragments, size));
        }

        let mut children = Vec::new();
        for cluster in &clusters {
            let sub = molecule.fragment_subset(cluster).ok_or_else(|| {
                QcGridError::InvalidInput(format!("fragment indices {cluster:?} out of range"))
            })?;
            children.push(ChildSpec {
                key: cluster_key(cluster),
                input: RecordAddInput {
                    specification: Specification::Singlepoint(
                        spec.singlepoint_specification.clone(),
                    ),
                    molecules: vec![MoleculeRef::Inline(Box::new(sub))],
                    input_data: Value::Null,
                    extras: None,
                    tag: ctx.tag.to_string(),
                    priority: ctx.priority,
                    owner_user: None,
                    owner_group: None,
                },
            });
        }

        let state = serde_json::to_value(ManybodyState { clusters })?;
        return Ok(IterateOutcome::NeedMoreWork { children, state });
    }

    // assemble the expansion
    let state: ManybodyState = serde_json::from_value(ctx.state.clone())?;
    let mut cluster_energies: HashMap<Vec<usize>, f64> = HashMap::new();
    for cluster in &state.clusters {
        let dep = dep_by_key(ctx.deps, &cluster_key(cluster))?;
        cluster_energies.insert(cluster.clone(), dep.energy()?);
    }

    // ε(s) = E(s) − Σ_{t ⊂ s} ε(t), smallest clusters first
    let mut contributions: HashMap<Vec<usize>, f64> = HashMap::new();
    let mut ordered = state.clusters.clone();
    ordered.sort_by_key(|c| c.len());
    for cluster in &ordered {
        let mut eps = cluster_energies[cluster];
        for (other, contribution) in &contributions {
            if other.len() < cluster.len() && other.iter().all(|i| cluster.contains(i)) {
                eps -= contribution;
            }
        }
        contributions.insert(cluster.clone(), eps);
    }

    let total: f64 = contributions.values().sum();
    let interaction: f64 = contributions
        .iter()
        .filter(|(c, _)| c.len() >= 2)
        .map(|(_, e)| e)
        .sum();

    let energies_out: serde_json::Map<String, Value> = state
        .clusters
        .iter()
        .map(|c| (cluster_key(c), json!(cluster_energies[c])))
        .collect();

    Ok(IterateOutcome::Finished {
        properties: json!({
            "cluster_energies": energies_out,
            "total_energy": total,
            "interaction_energy": interaction,
            "n_fragments": n_fragments,
        }),
    })
}
