use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{guidance_message, AppHandler};
use crate::assets::AssetStore;
use crate::classifier::{Classifier, ParsedTask, TaskClass};
use crate::config::Config;
use crate::device::Device;
use crate::error::PilotError;
use crate::executor::{AppEnv, TaskContext, TaskResult, WorkflowExecutor};
use crate::model::ModelClient;
use crate::registry::DiscoveredModule;
use crate::workflow::{
    load_templates, Action, NavStep, ScreenSpec, ScreenTable, StepParams, Workflow,
};

/// Reference handler for the messaging/social app. Wires the asset store,
/// the screen enumeration, and the workflow table together, and supplies the
/// type-to-workflow and parsed-to-params mappings. New app handlers follow
/// this template.
pub struct WeChatHandler {
    env: AppEnv,
    executor: WorkflowExecutor,
    classifier: Classifier,
    model: Arc<ModelClient>,
}

const WF_SEND_MESSAGE: &str = "send_message";
const WF_POST_MOMENTS: &str = "post_moments";
const WF_FIND_VIA_SEARCH: &str = "find_via_search";

/// Regex fallback for simple tasks when no parsed record exists.
static SEND_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:给)?(.+?)发(?:消息|微信)[,，:：]?\s*(?:说|内容是)?(.+)").unwrap());
static MOMENTS_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"发(?:朋友圈|个朋友圈)[,，:：]?\s*(?:说|内容是)?(.+)").unwrap());

impl WeChatHandler {
    pub fn new(
        module: &DiscoveredModule,
        device: Arc<dyn Device>,
        model: Arc<ModelClient>,
        config: &Config,
    ) -> Self {
        let mut workflows: std::collections::HashMap<String, Workflow> = built_in_workflows()
            .into_iter()
            .map(|w| (w.name.clone(), w))
            .collect();
        // On-disk templates extend (and may override) the built-in table.
        for template in load_templates(&module.dir) {
            let wf = template.into_workflow();
            workflows.insert(wf.name.clone(), wf);
        }

        let env = AppEnv {
            module: module.info.clone(),
            assets: AssetStore::open(module.dir.join("images")),
            screens: screen_table(),
            workflows,
            capture_wait: config.screenshot.wait_for_app(&module.info.name),
            transition_wait: config.screenshot.wait_default,
        };

        Self {
            env,
            executor: WorkflowExecutor::new(device, Arc::clone(&model), config.workflow.clone()),
            classifier: Classifier::new(config.classifier.mode, Arc::clone(&model)),
            model,
        }
    }

    /// Validate the asset references and screen names every built-in
    /// workflow uses; called once at startup so authoring mistakes surface
    /// before any task runs.
    pub fn validate_workflows(&self) -> Vec<String> {
        self.env
            .workflows
            .values()
            .filter_map(|wf| wf.validate(&self.env.screens, &self.env.assets).err())
            .collect()
    }

    /// The parsed-type to workflow-and-params mapping.
    fn plan_from_parsed(parsed: &ParsedTask) -> Option<(String, StepParams)> {
        match parsed {
            ParsedTask::SendMessage { recipient, content } => {
                let mut params = StepParams::new();
                params.insert("contact".into(), Value::String(recipient.clone()));
                params.insert("message".into(), Value::String(content.clone()));
                Some((WF_SEND_MESSAGE.to_string(), params))
            }
            ParsedTask::PostMoment { content } => {
                let mut params = StepParams::new();
                params.insert("content".into(), Value::String(content.clone()));
                params.insert("postAction".into(), Value::String("long_press".into()));
                Some((WF_POST_MOMENTS.to_string(), params))
            }
            _ => None,
        }
    }

    /// Regex pattern table for simple tasks without a parsed record.
    fn plan_from_patterns(task: &str) -> Option<(String, StepParams)> {
        if let Some(caps) = MOMENTS_PATTERN.captures(task) {
            let mut params = StepParams::new();
            params.insert("content".into(), Value::String(caps[1].trim().to_string()));
            params.insert("postAction".into(), Value::String("long_press".into()));
            return Some((WF_POST_MOMENTS.to_string(), params));
        }
        if let Some(caps) = SEND_PATTERN.captures(task) {
            let mut params = StepParams::new();
            params.insert("contact".into(), Value::String(caps[1].trim().to_string()));
            params.insert("message".into(), Value::String(caps[2].trim().to_string()));
            return Some((WF_SEND_MESSAGE.to_string(), params));
        }
        None
    }

    /// Remote planner path for complex tasks: choose among the declared
    /// workflows and produce params.
    async fn plan_remotely(&self, task: &str) -> Result<(String, StepParams), PilotError> {
        let catalog: Vec<(String, String, Vec<String>)> = self
            .env
            .workflows
            .values()
            .map(|w| {
                (
                    w.name.clone(),
                    w.description.clone(),
                    w.required_params.clone(),
                )
            })
            .collect();
        let choice = self.model.choose_workflow(task, &catalog).await?;
        if !self.env.workflows.contains_key(&choice.workflow_name) {
            return Err(PilotError::PlannerFailed(format!(
                "planner chose undeclared workflow '{}'",
                choice.workflow_name
            )));
        }
        Ok((choice.workflow_name, choice.params))
    }

    /// Validate required params and delegate to the executor.
    async fn run(
        &self,
        ctx: &TaskContext,
        workflow_name: &str,
        params: StepParams,
        task: &str,
    ) -> Result<TaskResult, PilotError> {
        let workflow = self.env.workflow(workflow_name).ok_or_else(|| {
            // Declared-but-optional mappings fail closed.
            PilotError::ParamsMissing(vec![format!("workflow '{workflow_name}' not defined")])
        })?;
        let missing = workflow.missing_params(&params);
        if !missing.is_empty() {
            return Err(PilotError::ParamsMissing(missing));
        }
        info!("wechat: running '{workflow_name}' for task '{task}'");
        Ok(self
            .executor
            .execute_workflow(ctx, &self.env, workflow_name, &params, task)
            .await)
    }
}

#[async_trait]
impl AppHandler for WeChatHandler {
    fn name(&self) -> &str {
        &self.env.module.name
    }

    fn env(&self) -> &AppEnv {
        &self.env
    }

    async fn execute_task(&self, ctx: &TaskContext, task: &str) -> Result<TaskResult, PilotError> {
        let classification = self.classifier.classify_lenient(task).await;

        if let Some(parsed) = &classification.parsed {
            if *parsed == ParsedTask::Invalid {
                return Err(PilotError::InvalidInput(guidance_message()));
            }
            if let Some((workflow, params)) = Self::plan_from_parsed(parsed) {
                return self.run(ctx, &workflow, params, task).await;
            }
        }

        match classification.class {
            TaskClass::Invalid => Err(PilotError::InvalidInput(guidance_message())),
            TaskClass::Complex => {
                debug!("wechat: complex task, asking planner");
                let (workflow, params) = self.plan_remotely(task).await?;
                self.run(ctx, &workflow, params, task).await
            }
            TaskClass::Simple => match Self::plan_from_patterns(task) {
                Some((workflow, params)) => self.run(ctx, &workflow, params, task).await,
                None => {
                    warn!("wechat: no pattern matched simple task '{task}'");
                    Err(PilotError::InvalidInput(guidance_message()))
                }
            },
        }
    }

    async fn execute_task_with_workflow(
        &self,
        ctx: &TaskContext,
        task: &str,
        parsed: &ParsedTask,
    ) -> Result<TaskResult, PilotError> {
        match Self::plan_from_parsed(parsed) {
            Some((workflow, params)) => self.run(ctx, &workflow, params, task).await,
            None if *parsed == ParsedTask::Invalid => {
                Err(PilotError::InvalidInput(guidance_message()))
            }
            None => self.execute_task(ctx, task).await,
        }
    }
}

/// WeChat screen enumeration in detection priority order. Each state's
/// first indicator is primary, the rest are fallbacks; variants of each
/// indicator come from the asset store.
fn screen_table() -> ScreenTable {
    ScreenTable::new(vec![
        ScreenSpec::new("home", &["home_tab", "wechat_title"]),
        ScreenSpec::new("chat", &["chat_input", "voice_toggle"]),
        ScreenSpec::new("search", &["search_input"]),
        ScreenSpec::new("discover", &["discover_header"]),
        ScreenSpec::new("moments", &["moments_header", "moments_camera"]),
        ScreenSpec::new("post_editor", &["publish_button"]),
        ScreenSpec::new("contact_profile", &["send_message_entry"]),
    ])
}

/// The built-in workflow table. Declarative data; the executor interprets.
fn built_in_workflows() -> Vec<Workflow> {
    let mut send_message = Workflow::new(WF_SEND_MESSAGE);
    send_message.description = "Send a chat message to a contact".into();
    send_message.required_params = vec!["contact".into(), "message".into()];
    send_message.end_screen = Some("chat".into());
    send_message.steps = vec![
        NavStep::new(Action::FindOrSearch)
            .target("{contact}")
            .describe("open the chat with {contact}")
            .expect("chat"),
        NavStep::new(Action::InputText)
            .target("chat_input")
            .param("text", "{message}")
            .describe("type the message"),
        NavStep::new(Action::Tap)
            .target("send_button")
            .describe("send it"),
    ];

    let mut post_moments = Workflow::new(WF_POST_MOMENTS);
    post_moments.description = "Post a text-only update to moments".into();
    post_moments.required_params = vec!["content".into()];
    post_moments
        .optional_params
        .insert("postAction".into(), "long_press".into());
    post_moments.end_screen = Some("moments".into());
    post_moments.steps = vec![
        NavStep::new(Action::Tap)
            .target("discover_tab")
            .describe("open discover")
            .expect("discover"),
        NavStep::new(Action::Tap)
            .target("moments_entry")
            .describe("open moments")
            .expect("moments"),
        // Text-only posts need the long press on the camera control; a tap
        // would start the photo picker.
        NavStep::new(Action::LongPress)
            .target("moments_camera")
            .param("duration", 1200u64)
            .describe("open the text-only editor")
            .expect("post_editor"),
        NavStep::new(Action::InputText)
            .target("moments_editor")
            .param("text", "{content}")
            .describe("write the update"),
        NavStep::new(Action::Tap)
            .target("publish_button")
            .describe("publish")
            .expect("moments"),
    ];

    let mut find_via_search = Workflow::new(WF_FIND_VIA_SEARCH);
    find_via_search.description = "Find a contact or chat through search".into();
    find_via_search.required_params = vec!["query".into()];
    find_via_search.steps = vec![
        NavStep::new(Action::Tap)
            .target("search_icon")
            .describe("open search")
            .expect("search"),
        NavStep::new(Action::InputText)
            .target("search_input")
            .param("text", "{query}")
            .describe("type the query"),
        NavStep::new(Action::Tap)
            .target("dynamic: the first result row under the search box")
            .describe("pick the first result"),
    ];

    vec![send_message, post_moments, find_via_search]
}

/// Startup validation against an app directory (used by `modules` listing).
pub fn validate_app_dir(dir: &Path) -> bool {
    dir.join("manifest.yaml").is_file() && dir.join("images").is_dir()
}
