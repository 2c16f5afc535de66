// Handles composite actions: the inner steps run through the same step
// loop on a child context carrying the `inputs` context, and the action's
// declared outputs map back through expressions over the child's steps.

use async_trait::async_trait;
use anyhow::Result;
use gale_common::TaskResult;
use serde_json::Value;

use crate::errors::StepError;
use crate::execution_context::ExecutionContext;
use crate::expressions::interpolate;
use crate::handlers::handler::{Handler, HandlerData};
use crate::steps_runner::StepsRunner;

/// Nesting limit for composite actions referencing composite actions.
const MAX_COMPOSITE_DEPTH: u32 = 9;

pub struct CompositeActionHandler;

impl CompositeActionHandler {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Handler for CompositeActionHandler {
    async fn run(&self, context: &mut ExecutionContext, data: &HandlerData) -> Result<()> {
        if context.depth() >= MAX_COMPOSITE_DEPTH {
            anyhow::bail!(
                "composite action nesting exceeded the maximum depth of {}",
                MAX_COMPOSITE_DEPTH
            );
        }

        let definition = data.action.definition.as_ref().ok_or_else(|| {
            StepError::ExpressionEval {
                step: data.step_key.clone(),
                message: "composite action has no manifest".to_string(),
            }
        })?;

        // The `inputs` context: the step's `with:` filled out with manifest
        // defaults; missing required inputs are an error.
        let mut inputs = serde_json::Map::new();
        for (name, input) in &definition.inputs {
            match data.inputs.get(name) {
                Some(value) => {
                    inputs.insert(name.clone(), Value::String(value.clone()));
                }
                None => match &input.default {
                    Some(default) => {
                        let value = interpolate(default, &data.eval).map_err(|err| {
                            StepError::ExpressionEval {
                                step: data.step_key.clone(),
                                message: err.to_string(),
                            }
                        })?;
                        inputs.insert(name.clone(), Value::String(value));
                    }
                    None if input.required => {
                        anyhow::bail!(
                            "composite action '{}' is missing required input '{}'",
                            definition.name,
                            name
                        );
                    }
                    None => {}
                },
            }
        }
        // Inputs passed but not declared still surface to expressions.
        for (name, value) in &data.inputs {
            inputs
                .entry(name.clone())
                .or_insert_with(|| Value::String(value.clone()));
        }

        context.info(&format!(
            "Composite action '{}' with {} steps",
            definition.name,
            definition.steps.len()
        ));
        let mut child = context.create_composite_child(
            format!("Composite: {}", definition.name),
            Value::Object(inputs),
        );

        StepsRunner::run_steps(&mut child, &definition.steps).await?;

        match child.result() {
            Some(TaskResult::Canceled) => {
                return Err(StepError::Cancelled {
                    step: data.step_key.clone(),
                }
                .into());
            }
            Some(TaskResult::Failed) => {
                anyhow::bail!("composite action '{}' failed", definition.name);
            }
            _ => {}
        }

        // Map declared outputs back through the composite's own steps
        // context.
        let child_eval = child.build_expression_context(child.status_functions());
        for (name, value_expr) in &definition.outputs {
            if value_expr.is_empty() {
                continue;
            }
            let value = interpolate(value_expr, &child_eval).map_err(|err| {
                StepError::ExpressionEval {
                    step: data.step_key.clone(),
                    message: format!("output '{}': {}", name, err),
                }
            })?;
            context.outputs.insert(name.clone(), value);
        }

        Ok(())
    }
}
