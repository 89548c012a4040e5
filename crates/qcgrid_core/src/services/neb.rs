//! NEB (nudged elastic band) service.
//!
//! One round of singlepoints across the image chain; finishes with the
//! per-image energy profile and the highest-energy image as the
//! transition-state estimate.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::QcGridError;
use crate::molecule::MoleculeRef;
use crate::record::RecordAddInput;
use crate::specification::Specification;

use super::{dep_by_key, ChildSpec, IterateOutcome, ServiceContext};

#[derive(Debug, Serialize, Deserialize)]
struct NebState {
    n_images: usize,
}

fn image_key(idx: usize) -> String {
    format!("img_{idx}")
}

pub(super) fn iterate(ctx: &ServiceContext) -> Result<IterateOutcome, QcGridError> {
    let spec = match ctx.specification {
        Specification::Neb(s) => s,
        _ => {
            return Err(QcGridError::InvalidInput(
                "neb service requires a neb specification".into(),
            ))
        }
    };

    if ctx.molecule_ids.len() < 3 {
        return Err(QcGridError::InvalidInput(
            "neb requires a chain of at least 3 images".into(),
        ));
    }

    if ctx.state.is_null() {
        let children: Vec<ChildSpec> = ctx
            .molecule_ids
            .iter()
            .enumerate()
            .map(|(idx, molecule_id)| ChildSpec {
                key: image_key(idx),
                input: RecordAddInput {
                    specification: Specification::Singlepoint(
                        spec.singlepoint_specification.clone(),
                    ),
                    molecules: vec![MoleculeRef::Id(*molecule_id)],
                    input_data: Value::Null,
                    extras: None,
                    tag: ctx.tag.to_string(),
                    priority: ctx.priority,
                    owner_user: None,
                    owner_group: None,
                },
            })
            .collect();
        let state = serde_json::to_value(NebState {
            n_images: ctx.molecule_ids.len(),
        })?;
        return Ok(IterateOutcome::NeedMoreWork { children, state });
    }

    let state: NebState = serde_json::from_value(ctx.state.clone())?;
    let mut energies = Vec::with_capacity(state.n_images);
    for idx in 0..state.n_images {
        energies.push(dep_by_key(ctx.deps, &image_key(idx))?.energy()?);
    }

    let (ts_index, ts_energy) = energies
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, e)| (i, *e))
        .ok_or_else(|| QcGridError::Internal(anyhow::anyhow!("neb chain produced no energies")))?;

    Ok(IterateOutcome::Finished {
        properties: json!({
            "image_energies": energies,
            "ts_index": ts_index,
            "ts_energy": ts_energy,
            "forward_barrier": ts_energy - energies[0],
            "reverse_barrier": ts_energy - energies[energies.len() - 1],
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::super::{iterate, DependencyResult, IterateOutcome, ServiceContext};
    use crate::specification::{
        NebKeywords, NebSpecification, SinglepointDriver, SinglepointSpecification, Specification,
    };
    use crate::types::{PriorityEnum, RecordStatus};
    use serde_json::{json, Value};

    static NULL_INPUT: Value = Value::Null;

    fn neb_spec() -> Specification {
        Specification::Neb(NebSpecification {
            program: "geometric".into(),
            singlepoint_specification: SinglepointSpecification {
                program: "psi4".into(),
                driver: SinglepointDriver::Gradient,
                method: "hf".into(),
                basis: Some("sto-3g".into()),
                keywords: json!({}),
                protocols: json!({}),
            },
            keywords: NebKeywords {
                images: 5,
                spring_constant: 1.0,
            },
        })
    }

    fn ctx<'a>(
        spec: &'a Specification,
        molecule_ids: &'a [i64],
        state: &'a Value,
        deps: &'a [DependencyResult],
    ) -> ServiceContext<'a> {
        ServiceContext {
            record_id: 1,
            specification: spec,
            molecules: &[],
            molecule_ids,
            input_data: &NULL_INPUT,
            iteration: 0,
            state,
            deps,
            tag: "*",
            priority: PriorityEnum::Normal,
        }
    }

    #[test]
    fn test_spawns_one_child_per_image() {
        let spec = neb_spec();
        let state = Value::Null;
        match iterate(&ctx(&spec, &[1, 2, 3, 4, 5], &state, &[])).unwrap() {
            IterateOutcome::NeedMoreWork { children, .. } => {
                assert_eq!(children.len(), 5);
                assert_eq!(children[2].key, "img_2");
            }
            _ => panic!("expected NeedMoreWork"),
        }
    }

    #[test]
    fn test_short_chain_rejected() {
        let spec = neb_spec();
        let state = Value::Null;
        assert!(iterate(&ctx(&spec, &[1, 2], &state, &[])).is_err());
    }

    #[test]
    fn test_profile_and_barriers() {
        let spec = neb_spec();
        let state = json!({"n_images": 3});
        let deps: Vec<DependencyResult> = [-2.0, -1.2, -1.9]
            .iter()
            .enumerate()
            .map(|(idx, energy)| DependencyResult {
                key: format!("img_{idx}"),
                record_id: 10 + idx as i64,
                status: RecordStatus::Complete,
                properties: json!({"return_energy": energy}),
            })
            .collect();
        match iterate(&ctx(&spec, &[1, 2, 3], &state, &deps)).unwrap() {
            IterateOutcome::Finished { properties } => {
                assert_eq!(properties["ts_index"], json!(1));
                assert!(
                    (properties["forward_barrier"].as_f64().unwrap() - 0.8).abs() < 1e-12
                );
                assert!(
                    (properties["reverse_barrier"].as_f64().unwrap() - 0.7).abs() < 1e-12
                );
            }
            _ => panic!("expected Finished"),
        }
    }
}
