//! Workflow definition shapes and validation.
//!
//! A workflow is either step-based (ordered steps, where a step is a single
//! command or a parallel block of commands) or loop-based (one prompt driven
//! until a completion signal or an iteration cap). The two shapes are
//! mutually exclusive.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ArchonError, Result};
use crate::storage::CommandSpec;

fn default_provider() -> String {
    "claude".to_string()
}

/// One command executed as one assistant turn.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SingleStep {
    pub command: String,
    /// Start a fresh assistant session for this step.
    #[serde(default)]
    pub clear_context: bool,
}

/// A step in a step-based workflow.
///
/// Parallel blocks hold only single steps, so nesting is unrepresentable;
/// attempting to nest fails deserialization.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum WorkflowStep {
    Parallel { parallel: Vec<SingleStep> },
    Single(SingleStep),
}

/// Loop settings: run `prompt` until the completion signal shows up in the
/// assistant output or `max_iterations` is reached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoopSpec {
    pub prompt: String,
    pub until: String,
    pub max_iterations: u32,
    #[serde(default)]
    pub fresh_context: bool,
}

/// A named, parameterized execution plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Assistant provider tag (`claude`, `codex`, ...).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub steps: Vec<WorkflowStep>,
    #[serde(default, rename = "loop")]
    pub loop_spec: Option<LoopSpec>,
}

impl WorkflowDefinition {
    /// Structural validation. When a command registry is supplied, step
    /// command names must resolve in it (the built-in assist command always
    /// resolves).
    pub fn validate(&self, commands: Option<&HashMap<String, CommandSpec>>) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(ArchonError::validation("workflow name must not be empty"));
        }

        match (&self.loop_spec, self.steps.is_empty()) {
            (Some(_), false) => {
                return Err(ArchonError::validation(format!(
                    "workflow `{}` sets both steps and loop; they are mutually exclusive",
                    self.name
                )));
            }
            (None, true) => {
                return Err(ArchonError::validation(format!(
                    "workflow `{}` has neither steps nor a loop",
                    self.name
                )));
            }
            _ => {}
        }

        if let Some(loop_spec) = &self.loop_spec {
            if loop_spec.prompt.trim().is_empty() {
                return Err(ArchonError::validation(format!(
                    "loop workflow `{}` is missing a prompt",
                    self.name
                )));
            }
            if loop_spec.until.is_empty() {
                return Err(ArchonError::validation(format!(
                    "loop workflow `{}` is missing a completion signal",
                    self.name
                )));
            }
            if loop_spec.max_iterations == 0 {
                return Err(ArchonError::validation(format!(
                    "loop workflow `{}` needs max_iterations > 0",
                    self.name
                )));
            }
        }

        for step in &self.steps {
            match step {
                WorkflowStep::Parallel { parallel } => {
                    if parallel.is_empty() {
                        return Err(ArchonError::validation(format!(
                            "workflow `{}` contains an empty parallel block",
                            self.name
                        )));
                    }
                    for single in parallel {
                        self.validate_command(&single.command, commands)?;
                    }
                }
                WorkflowStep::Single(single) => {
                    self.validate_command(&single.command, commands)?;
                }
            }
        }

        Ok(())
    }

    fn validate_command(
        &self,
        command: &str,
        commands: Option<&HashMap<String, CommandSpec>>,
    ) -> Result<()> {
        if command.trim().is_empty() {
            return Err(ArchonError::validation(format!(
                "workflow `{}` contains a step with an empty command",
                self.name
            )));
        }
        if let Some(registry) = commands {
            if command != super::ASSIST_WORKFLOW && !registry.contains_key(command) {
                return Err(ArchonError::validation(format!(
                    "workflow `{}` references unknown command `{}`",
                    self.name, command
                )));
            }
        }
        Ok(())
    }

    pub fn is_loop(&self) -> bool {
        self.loop_spec.is_some()
    }
}
