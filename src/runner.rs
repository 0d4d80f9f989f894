use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::apps::{AppHandler, SystemHandler, WeChatHandler};
use crate::classifier::{self, Classifier, ParsedTask};
use crate::config::Config;
use crate::device::Device;
use crate::error::PilotError;
use crate::executor::{TaskContext, TaskResult};
use crate::model::ModelClient;
use crate::registry::{ModuleRegistry, SYSTEM_MODULE};

/// Final word on one task, shaped for the shell: what happened, whether the
/// interactive mode menu should be re-offered, and the step trace when a
/// workflow actually ran.
#[derive(Debug)]
pub struct RunOutcome {
    pub success: bool,
    pub message: String,
    pub error_kind: Option<&'static str>,
    /// Set when classification failed outright: the shell re-prompts mode
    /// selection instead of retrying.
    pub reselect_mode: bool,
    pub elapsed: Duration,
    pub result: Option<TaskResult>,
}

impl RunOutcome {
    fn from_result(result: TaskResult, elapsed: Duration) -> Self {
        Self {
            success: result.is_success(),
            message: result.message.clone(),
            error_kind: if result.is_success() {
                None
            } else {
                Some("step_failed")
            },
            reselect_mode: false,
            elapsed,
            result: Some(result),
        }
    }

    fn from_error(error: PilotError, elapsed: Duration) -> Self {
        Self {
            success: false,
            message: error.to_string(),
            error_kind: Some(error.kind()),
            reselect_mode: matches!(error, PilotError::ClassificationFailed(_)),
            elapsed,
            result: None,
        }
    }

    pub fn is_environment_failure(&self) -> bool {
        matches!(
            self.error_kind,
            Some("device_unavailable") | Some("device_command_failed")
        )
    }
}

/// Top-level orchestration: screenshot pacing, classification, routing, and
/// handler invocation. Owns the device binding for the run and lends it to
/// handlers' executors.
pub struct TaskRunner {
    config: Config,
    handlers: HashMap<String, Arc<dyn AppHandler>>,
    registry: ModuleRegistry,
    classifier: Classifier,
}

/// Fixed map from parsed task type to handler name. Routing through this
/// table is a pure function of the type, independent of the keyword tables.
fn handler_for_type(type_name: &str) -> Option<&'static str> {
    match type_name {
        "send_msg" | "post_moment_only_text" | "search_contact" | "add_friend" => Some("wechat"),
        _ => None,
    }
}

impl TaskRunner {
    pub fn new(config: Config, device: Arc<dyn Device>, model: Arc<ModelClient>) -> Self {
        let registry = ModuleRegistry::discover(std::path::Path::new(&config.apps_dir));

        let mut handlers: HashMap<String, Arc<dyn AppHandler>> = HashMap::new();
        for module in registry.modules() {
            if module.info.name == "wechat" {
                let handler = WeChatHandler::new(
                    module,
                    Arc::clone(&device),
                    Arc::clone(&model),
                    &config,
                );
                for problem in handler.validate_workflows() {
                    warn!("workflow validation: {problem}");
                }
                handlers.insert(module.info.name.clone(), Arc::new(handler));
            }
        }
        let known = registry.modules().iter().map(|m| m.info.clone()).collect();
        handlers.insert(
            SYSTEM_MODULE.to_string(),
            Arc::new(SystemHandler::new(
                known,
                Arc::clone(&device),
                Arc::clone(&model),
                &config,
            )),
        );

        let classifier = Classifier::new(config.classifier.mode, model);
        Self {
            config,
            handlers,
            registry,
            classifier,
        }
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    fn handler(&self, name: &str) -> Arc<dyn AppHandler> {
        self.handlers
            .get(name)
            .or_else(|| self.handlers.get(SYSTEM_MODULE))
            .cloned()
            .expect("system handler always registered")
    }

    /// Run one utterance to a final outcome.
    pub async fn run_task(&self, ctx: &TaskContext, utterance: &str) -> RunOutcome {
        let started = Instant::now();

        // Screenshot pacing: give the screen a moment before the first
        // capture the executor will take.
        tokio::time::sleep(self.config.screenshot.wait_default).await;

        let outcome = self.route_and_run(ctx, utterance).await;
        let elapsed = started.elapsed();
        match outcome {
            Ok(result) => {
                info!(
                    "task finished: {} in {:.1}s",
                    result.message,
                    elapsed.as_secs_f64()
                );
                RunOutcome::from_result(result, elapsed)
            }
            Err(e) => {
                warn!("task failed: {e}");
                RunOutcome::from_error(e, elapsed)
            }
        }
    }

    async fn route_and_run(
        &self,
        ctx: &TaskContext,
        utterance: &str,
    ) -> Result<TaskResult, PilotError> {
        if Classifier::is_trivially_invalid(utterance) {
            return Err(PilotError::InvalidInput(crate::apps::guidance_message()));
        }

        if classifier::has_fast_prefix(utterance) {
            // Fast-form path. A malformed tail falls through to model
            // classification of the stripped utterance; never to keyword
            // routing.
            if let Some(parsed) = classifier::parse_fast(utterance) {
                debug!("fast-form parsed as {}", parsed.type_name());
                let handler = self.route_by_type(&parsed)?;
                return handler
                    .execute_task_with_workflow(ctx, utterance, &parsed)
                    .await;
            }

            let stripped = classifier::strip_fast_prefix(utterance);
            let parsed = self.classifier.classify_strict(&stripped).await?;
            return match &parsed {
                ParsedTask::Invalid => {
                    Err(PilotError::InvalidInput(crate::apps::guidance_message()))
                }
                ParsedTask::Others { .. } => {
                    let name = self.registry.route_by_keywords(&stripped);
                    debug!("stripped fast-form routed to '{name}' by keywords");
                    self.handler(&name).execute_task(ctx, &stripped).await
                }
                _ => {
                    let handler = self.route_by_type(&parsed)?;
                    handler
                        .execute_task_with_workflow(ctx, &stripped, &parsed)
                        .await
                }
            };
        }

        // Natural language: keyword routing, `system` as the floor.
        let name = self.registry.route_by_keywords(utterance);
        debug!("keyword routing chose '{name}'");
        self.handler(&name).execute_task(ctx, utterance).await
    }

    fn route_by_type(&self, parsed: &ParsedTask) -> Result<Arc<dyn AppHandler>, PilotError> {
        let type_name = parsed.type_name();
        match handler_for_type(type_name) {
            Some(name) => match self.handlers.get(name) {
                Some(handler) => Ok(Arc::clone(handler)),
                None => Err(PilotError::ParamsMissing(vec![format!(
                    "handler '{name}' for type '{type_name}' is not installed"
                )])),
            },
            None => Err(PilotError::ClassificationFailed(format!(
                "no handler mapping for type '{type_name}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_map_is_pure_and_total_for_simple_types() {
        assert_eq!(handler_for_type("send_msg"), Some("wechat"));
        assert_eq!(handler_for_type("post_moment_only_text"), Some("wechat"));
        // Declared-but-optional types still route; the handler fails closed.
        assert_eq!(handler_for_type("search_contact"), Some("wechat"));
        assert_eq!(handler_for_type("others"), None);
        assert_eq!(handler_for_type("invalid"), None);
    }

    #[test]
    fn outcome_marks_classification_failure_for_reselect() {
        let outcome = RunOutcome::from_error(
            PilotError::ClassificationFailed("nothing usable".into()),
            Duration::from_millis(10),
        );
        assert!(outcome.reselect_mode);
        assert!(!outcome.success);

        let outcome = RunOutcome::from_error(
            PilotError::InvalidInput("guidance".into()),
            Duration::from_millis(10),
        );
        assert!(!outcome.reselect_mode);
        assert_eq!(outcome.error_kind, Some("invalid_input"));
    }

    #[test]
    fn device_errors_are_environment_failures() {
        let outcome = RunOutcome::from_error(
            PilotError::DeviceUnavailable("adb gone".into()),
            Duration::from_millis(1),
        );
        assert!(outcome.is_environment_failure());
    }
}
