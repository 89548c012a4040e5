//! Reaction energy service.
//!
//! One singlepoint child per stoichiometry component; finishes with the
//! coefficient-weighted energy sum.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::QcGridError;
use crate::molecule::MoleculeRef;
use crate::record::RecordAddInput;
use crate::specification::Specification;

use super::{dep_by_key, ChildSpec, IterateOutcome, ServiceContext};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Component {
    molecule_idx: usize,
    coefficient: f64,
}

#[derive(Debug, Deserialize)]
struct ReactionInput {
    stoichiometry: Vec<Component>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ReactionState {
    components: Vec<Component>,
}

pub(super) fn iterate(ctx: &ServiceContext) -> Result<IterateOutcome, QcGridError> {
    let spec = match ctx.specification {
        Specification::Reaction(s) => s,
        _ => {
            return Err(QcGridError::InvalidInput(
                "reaction service requires a reaction specification".into(),
            ))
        }
    };

    if ctx.state.is_null() {
        // first iteration: one singlepoint per component
        let input: ReactionInput = serde_json::from_value(ctx.input_data.clone())
            .map_err(|e| QcGridError::InvalidInput(format!("reaction stoichiometry: {e}")))?;
        if input.stoichiometry.is_empty() {
            return Err(QcGridError::InvalidInput(
                "reaction requires a non-empty stoichiometry".into(),
            ));
        }

        let mut children = Vec::new();
        for component in &input.stoichiometry {
            let molecule_id = *ctx.molecule_ids.get(component.molecule_idx).ok_or_else(|| {
                QcGridError::InvalidInput(format!(
                    "stoichiometry references molecule index {} out of range",
                    component.molecule_idx
                ))
            })?;
            let key = format!("e_{}", component.molecule_idx);
            // identical molecules across components collapse onto one child
            if children.iter().any(|c: &ChildSpec| c.key == key) {
                continue;
            }
            children.push(ChildSpec {
                key,
                input: RecordAddInput {
                    specification: Specification::Singlepoint(
                        spec.singlepoint_specification.clone(),
                    ),
                    molecules: vec![MoleculeRef::Id(molecule_id)],
                    input_data: Value::Null,
                    extras: None,
                    tag: ctx.tag.to_string(),
                    priority: ctx.priority,
                    owner_user: None,
                    owner_group: None,
                },
            });
        }

        let state = serde_json::to_value(ReactionState {
            components: input.stoichiometry,
        })?;
        return Ok(IterateOutcome::NeedMoreWork { children, state });
    }

    // all children complete: weighted sum
    let state: ReactionState = serde_json::from_value(ctx.state.clone())?;
    let mut total = 0.0;
    for component in &state.components {
        let dep = dep_by_key(ctx.deps, &format!("e_{}", component.molecule_idx))?;
        total += component.coefficient * dep.energy()?;
    }

    Ok(IterateOutcome::Finished {
        properties: json!({
            "total_energy": total,
            "n_components": state.components.len(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::super::{iterate, DependencyResult, IterateOutcome, ServiceContext};
    use crate::specification::{
        ReactionSpecification, SinglepointDriver, SinglepointSpecification, Specification,
    };
    use crate::types::{PriorityEnum, RecordStatus};
    use serde_json::{json, Value};

    fn reaction_spec() -> Specification {
        Specification::Reaction(ReactionSpecification {
            singlepoint_specification: SinglepointSpecification {
                program: "psi4".into(),
                driver: SinglepointDriver::Energy,
                method: "hf".into(),
                basis: Some("sto-3g".into()),
                keywords: json!({}),
                protocols: json!({}),
            },
            keywords: json!({}),
        })
    }

    fn ctx<'a>(
        spec: &'a Specification,
        input_data: &'a Value,
        state: &'a Value,
        deps: &'a [DependencyResult],
    ) -> ServiceContext<'a> {
        ServiceContext {
            record_id: 1,
            specification: spec,
            molecules: &[],
            molecule_ids: &[10, 11, 12],
            input_data,
            iteration: 0,
            state,
            deps,
            tag: "*",
            priority: PriorityEnum::Normal,
        }
    }

    #[test]
    fn test_first_iteration_spawns_components() {
        let spec = reaction_spec();
        let input = json!({"stoichiometry": [
            {"molecule_idx": 0, "coefficient": -1.0},
            {"molecule_idx": 1, "coefficient": -1.0},
            {"molecule_idx": 2, "coefficient": 1.0},
        ]});
        let state = Value::Null;
        let outcome = iterate(&ctx(&spec, &input, &state, &[])).unwrap();
        match outcome {
            IterateOutcome::NeedMoreWork { children, .. } => {
                assert_eq!(children.len(), 3);
                assert_eq!(children[0].key, "e_0");
            }
            _ => panic!("expected NeedMoreWork"),
        }
    }

    #[test]
    fn test_second_iteration_sums_energies() {
        let spec = reaction_spec();
        let input = json!({"stoichiometry": [
            {"molecule_idx": 0, "coefficient": -1.0},
            {"molecule_idx": 1, "coefficient": 1.0},
        ]});
        let state = json!({"components": [
            {"molecule_idx": 0, "coefficient": -1.0},
            {"molecule_idx": 1, "coefficient": 1.0},
        ]});
        let deps = vec![
            DependencyResult {
                key: "e_0".into(),
                record_id: 100,
                status: RecordStatus::Complete,
                properties: json!({"return_energy": -76.0}),
            },
            DependencyResult {
                key: "e_1".into(),
                record_id: 101,
                status: RecordStatus::Complete,
                properties: json!({"return_energy": -75.5}),
            },
        ];
        let outcome = iterate(&ctx(&spec, &input, &state, &deps)).unwrap();
        match outcome {
            IterateOutcome::Finished { properties } => {
                assert!((properties["total_energy"].as_f64().unwrap() - 0.5).abs() < 1e-12);
            }
            _ => panic!("expected Finished"),
        }
    }

    #[test]
    fn test_bad_molecule_index_rejected() {
        let spec = reaction_spec();
        let input = json!({"stoichiometry": [{"molecule_idx": 9, "coefficient": 1.0}]});
        let state = Value::Null;
        assert!(iterate(&ctx(&spec, &input, &state, &[])).is_err());
    }
}
