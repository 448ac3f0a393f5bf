//! Action registry for autonomy plan steps.
//!
//! Built-in actions cover control flow (log, wait, condition, variable
//! get/set, noop); every registered skill contributes one action entry
//! that adapts the step to the skill handler contract. The action set is
//! closed at startup: a step naming an unknown action fails and goes
//! through the recovery ladder.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use super::StepDefinition;
use crate::skills::{SkillHandler, SkillInput, SkillRegistry};
use crate::store::Header;
use crate::types::TaskPriority;

/// Shared variable bag threaded through a goal's steps.
pub type VariableBag = Arc<Mutex<BTreeMap<String, serde_json::Value>>>;

/// One step action. Errors are plain strings: the loop owns retry and
/// recovery semantics, the action just reports what went wrong.
#[async_trait]
pub trait StepAction: Send + Sync {
    /// Run the action with inputs gathered from dependency outputs.
    async fn run(
        &self,
        step: &StepDefinition,
        inputs: serde_json::Value,
        variables: VariableBag,
    ) -> Result<serde_json::Value, String>;
}

/// Closed action table, keyed by action name.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn StepAction>>,
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&String> = self.actions.keys().collect();
        names.sort();
        f.debug_struct("ActionRegistry").field("actions", &names).finish()
    }
}

impl ActionRegistry {
    /// Registry with the built-in control-flow actions.
    pub fn with_builtins() -> Self {
        let mut registry = Self::default();
        registry.register("noop", Arc::new(NoopAction));
        registry.register("log", Arc::new(LogAction));
        registry.register("wait", Arc::new(WaitAction));
        registry.register("condition", Arc::new(ConditionAction));
        registry.register("set_variable", Arc::new(SetVariableAction));
        registry.register("get_variable", Arc::new(GetVariableAction));
        registry
    }

    /// Register an action under a name.
    pub fn register(&mut self, name: &str, action: Arc<dyn StepAction>) {
        self.actions.insert(name.to_owned(), action);
    }

    /// Add one action per registered skill.
    pub fn register_skills(&mut self, skills: &SkillRegistry) {
        for id in skills.ids() {
            if let Some(entry) = skills.get(&id) {
                self.register(
                    &id,
                    Arc::new(SkillStepAction {
                        skill_id: id.clone(),
                        handler: Arc::clone(&entry.handler),
                    }),
                );
            }
        }
    }

    /// Look up an action.
    pub fn get(&self, name: &str) -> Option<Arc<dyn StepAction>> {
        self.actions.get(name).cloned()
    }
}

// ── Builtins ────────────────────────────────────────────────────

struct NoopAction;

#[async_trait]
impl StepAction for NoopAction {
    async fn run(
        &self,
        _step: &StepDefinition,
        _inputs: serde_json::Value,
        _variables: VariableBag,
    ) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({"status": "noop"}))
    }
}

struct LogAction;

#[async_trait]
impl StepAction for LogAction {
    async fn run(
        &self,
        step: &StepDefinition,
        inputs: serde_json::Value,
        _variables: VariableBag,
    ) -> Result<serde_json::Value, String> {
        let message = inputs
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or(&step.name)
            .to_owned();
        info!(step = %step.step_id, "{message}");
        Ok(serde_json::json!({"logged": message}))
    }
}

struct WaitAction;

#[async_trait]
impl StepAction for WaitAction {
    async fn run(
        &self,
        _step: &StepDefinition,
        inputs: serde_json::Value,
        _variables: VariableBag,
    ) -> Result<serde_json::Value, String> {
        let seconds = inputs.get("seconds").and_then(|v| v.as_f64()).unwrap_or(1.0);
        tokio::time::sleep(std::time::Duration::from_secs_f64(seconds.max(0.0))).await;
        Ok(serde_json::json!({"waited": seconds}))
    }
}

struct ConditionAction;

#[async_trait]
impl StepAction for ConditionAction {
    async fn run(
        &self,
        _step: &StepDefinition,
        inputs: serde_json::Value,
        variables: VariableBag,
    ) -> Result<serde_json::Value, String> {
        // A condition names a variable that must be truthy, or defaults
        // to true when unspecified.
        let condition = inputs
            .get("condition")
            .and_then(|v| v.as_str())
            .unwrap_or("true")
            .to_owned();
        let result = if condition == "true" {
            true
        } else {
            let vars = variables.lock().await;
            vars.get(&condition)
                .map(|v| v.as_bool().unwrap_or(!v.is_null()))
                .unwrap_or(false)
        };
        Ok(serde_json::json!({"condition": condition, "result": result}))
    }
}

struct SetVariableAction;

#[async_trait]
impl StepAction for SetVariableAction {
    async fn run(
        &self,
        _step: &StepDefinition,
        inputs: serde_json::Value,
        variables: VariableBag,
    ) -> Result<serde_json::Value, String> {
        let name = inputs
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "set_variable requires a 'name' input".to_owned())?
            .to_owned();
        let value = inputs.get("value").cloned().unwrap_or(serde_json::Value::Null);
        variables.lock().await.insert(name.clone(), value.clone());
        Ok(serde_json::json!({"variable": name, "value": value}))
    }
}

struct GetVariableAction;

#[async_trait]
impl StepAction for GetVariableAction {
    async fn run(
        &self,
        _step: &StepDefinition,
        inputs: serde_json::Value,
        variables: VariableBag,
    ) -> Result<serde_json::Value, String> {
        let name = inputs
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "get_variable requires a 'name' input".to_owned())?;
        let value = variables
            .lock()
            .await
            .get(name)
            .cloned()
            .unwrap_or(serde_json::Value::Null);
        Ok(serde_json::json!({"value": value}))
    }
}

/// Adapter running a skill handler as a step action.
struct SkillStepAction {
    skill_id: String,
    handler: Arc<dyn SkillHandler>,
}

#[async_trait]
impl StepAction for SkillStepAction {
    async fn run(
        &self,
        step: &StepDefinition,
        inputs: serde_json::Value,
        _variables: VariableBag,
    ) -> Result<serde_json::Value, String> {
        let input = SkillInput {
            title: step.name.clone(),
            priority: TaskPriority::Standard,
            body: inputs.to_string(),
            header: Header::new(),
            path: PathBuf::from(format!("{}.md", step.step_id)),
        };
        let outcome = self.handler.execute(&input).await;
        if outcome.success {
            Ok(outcome.to_value())
        } else {
            Err(outcome
                .error
                .unwrap_or_else(|| format!("skill {} failed", self.skill_id)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bag() -> VariableBag {
        Arc::new(Mutex::new(BTreeMap::new()))
    }

    fn step(action: &str) -> StepDefinition {
        StepDefinition::new("s1", "test step", action)
    }

    #[tokio::test]
    async fn test_noop() {
        let registry = ActionRegistry::with_builtins();
        let action = registry.get("noop").expect("registered");
        let out = action
            .run(&step("noop"), serde_json::json!({}), bag())
            .await
            .expect("ok");
        assert_eq!(out["status"], "noop");
    }

    #[tokio::test]
    async fn test_log_uses_message_or_name() {
        let registry = ActionRegistry::with_builtins();
        let action = registry.get("log").expect("registered");
        let out = action
            .run(&step("log"), serde_json::json!({"message": "hello"}), bag())
            .await
            .expect("ok");
        assert_eq!(out["logged"], "hello");
        let out = action
            .run(&step("log"), serde_json::json!({}), bag())
            .await
            .expect("ok");
        assert_eq!(out["logged"], "test step");
    }

    #[tokio::test]
    async fn test_set_then_get_variable() {
        let registry = ActionRegistry::with_builtins();
        let variables = bag();
        registry
            .get("set_variable")
            .expect("registered")
            .run(
                &step("set_variable"),
                serde_json::json!({"name": "count", "value": 7}),
                Arc::clone(&variables),
            )
            .await
            .expect("set");
        let out = registry
            .get("get_variable")
            .expect("registered")
            .run(
                &step("get_variable"),
                serde_json::json!({"name": "count"}),
                variables,
            )
            .await
            .expect("get");
        assert_eq!(out["value"], 7);
    }

    #[tokio::test]
    async fn test_set_variable_requires_name() {
        let registry = ActionRegistry::with_builtins();
        let err = registry
            .get("set_variable")
            .expect("registered")
            .run(&step("set_variable"), serde_json::json!({}), bag())
            .await
            .expect_err("missing name");
        assert!(err.contains("name"));
    }

    #[tokio::test]
    async fn test_condition_on_variable() {
        let registry = ActionRegistry::with_builtins();
        let variables = bag();
        variables
            .lock()
            .await
            .insert("ready".to_owned(), serde_json::json!(true));
        let out = registry
            .get("condition")
            .expect("registered")
            .run(
                &step("condition"),
                serde_json::json!({"condition": "ready"}),
                variables,
            )
            .await
            .expect("ok");
        assert_eq!(out["result"], true);
    }

    #[tokio::test]
    async fn test_unknown_action_absent() {
        let registry = ActionRegistry::with_builtins();
        assert!(registry.get("teleport").is_none());
    }
}
