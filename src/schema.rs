//! JSON Schema validation for task inputs/results and middleware configs

use serde_json::Value;

use crate::errors::{KernelError, ValidationStage};
use crate::ident::ComponentId;

/// Validate `instance` against `schema`, reporting every violation at once
pub fn validate(
    target: &ComponentId,
    stage: ValidationStage,
    schema: &Value,
    instance: &Value,
) -> Result<(), KernelError> {
    let compiled = jsonschema::validator_for(schema).map_err(|e| KernelError::Validation {
        target: target.clone(),
        stage,
        detail: format!("invalid schema: {}", e),
    })?;

    let errors: Vec<String> = compiled
        .iter_errors(instance)
        .map(|e| e.to_string())
        .collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(KernelError::Validation {
            target: target.clone(),
            stage,
            detail: errors.join("; "),
        })
    }
}
