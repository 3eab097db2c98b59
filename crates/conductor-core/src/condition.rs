//! Step conditions for config-driven workflows.
//!
//! A condition is a JMESPath expression evaluated against
//! [`WorkflowContext::evaluation_document`]; the step runs when the result
//! is truthy. Compiled expressions are not `Send`, so only the validated
//! source is kept and compilation happens at evaluation time.

use serde_json::Value;
use thiserror::Error;

use crate::domain::WorkflowContext;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("failed to compile expression '{expression}': {reason}")]
    Compile { expression: String, reason: String },

    #[error("failed to evaluate expression '{expression}': {reason}")]
    Evaluate { expression: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Condition {
    expression: String,
}

impl Condition {
    pub fn parse(expression: &str) -> Result<Self, ConditionError> {
        jmespath::compile(expression).map_err(|e| ConditionError::Compile {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expression: expression.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.expression
    }

    pub fn evaluate(&self, document: &Value) -> Result<bool, ConditionError> {
        let compiled = jmespath::compile(&self.expression).map_err(|e| ConditionError::Compile {
            expression: self.expression.clone(),
            reason: e.to_string(),
        })?;
        let result = compiled.search(document).map_err(|e| ConditionError::Evaluate {
            expression: self.expression.clone(),
            reason: e.to_string(),
        })?;
        Ok(result.is_truthy())
    }

    pub fn evaluate_context(&self, ctx: &WorkflowContext) -> Result<bool, ConditionError> {
        self.evaluate(&ctx.evaluation_document())
    }
}
