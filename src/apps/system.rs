use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info};

use super::{guidance_message, AppHandler};
use crate::assets::AssetStore;
use crate::classifier::ParsedTask;
use crate::config::Config;
use crate::device::Device;
use crate::error::PilotError;
use crate::executor::{AppEnv, TaskContext, TaskResult, WorkflowExecutor};
use crate::model::ModelClient;
use crate::registry::{ModuleInfo, SYSTEM_MODULE};
use crate::workflow::{Action, NavStep, ScreenTable, StepParams, Workflow};

/// Default handler for tasks no app module claims: app launches and other
/// device-level requests. It knows every discovered module so "打开微信"
/// resolves to a package even though routing scored below the floor.
pub struct SystemHandler {
    env: AppEnv,
    executor: WorkflowExecutor,
    known_apps: Vec<ModuleInfo>,
}

static OPEN_APP_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(?:打开|启动|open\s+|launch\s+)(.+)$").unwrap());

const WF_OPEN_APP: &str = "open_app";

impl SystemHandler {
    pub fn new(
        known_apps: Vec<ModuleInfo>,
        device: Arc<dyn Device>,
        model: Arc<ModelClient>,
        config: &Config,
    ) -> Self {
        let mut open_app = Workflow::new(WF_OPEN_APP);
        open_app.description = "Launch an app and wait for it to settle".into();
        open_app.required_params = vec!["package".into()];
        open_app.steps = vec![
            NavStep::new(Action::LaunchApp).describe("launch the app"),
            NavStep::new(Action::Wait).param("duration", 1000u64),
        ];

        let env = AppEnv {
            module: ModuleInfo {
                name: SYSTEM_MODULE.into(),
                package_id: String::new(),
                keywords: Vec::new(),
                description: "device-level fallback handler".into(),
            },
            assets: AssetStore::open(format!("{}/system/images", config.apps_dir)),
            screens: ScreenTable::default(),
            workflows: [(WF_OPEN_APP.to_string(), open_app)].into_iter().collect(),
            capture_wait: config.screenshot.wait_default,
            transition_wait: config.screenshot.wait_default,
        };

        Self {
            env,
            executor: WorkflowExecutor::new(device, model, config.workflow.clone()),
            known_apps,
        }
    }

    /// Resolve an app mention to its module, by name then by keyword.
    fn resolve_app(&self, mention: &str) -> Option<&ModuleInfo> {
        let mention = mention.trim();
        self.known_apps
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case(mention))
            .or_else(|| {
                self.known_apps.iter().find(|m| {
                    m.keywords
                        .iter()
                        .any(|k| k == mention || mention.contains(k.as_str()))
                })
            })
    }

    async fn launch(
        &self,
        ctx: &TaskContext,
        target: &ModuleInfo,
        task: &str,
    ) -> Result<TaskResult, PilotError> {
        info!("system: launching {} ({})", target.name, target.package_id);
        // Transient environment bound to the target app; the system
        // handler's own assets still supply any shared anchors.
        let env = AppEnv {
            module: target.clone(),
            assets: AssetStore::open(self.env.assets.root()),
            screens: ScreenTable::default(),
            workflows: self.env.workflows.clone(),
            capture_wait: self.env.capture_wait,
            transition_wait: self.env.transition_wait,
        };
        let mut params = StepParams::new();
        params.insert(
            "package".into(),
            serde_json::Value::String(target.package_id.clone()),
        );
        Ok(self
            .executor
            .execute_workflow(ctx, &env, WF_OPEN_APP, &params, task)
            .await)
    }
}

#[async_trait]
impl AppHandler for SystemHandler {
    fn name(&self) -> &str {
        SYSTEM_MODULE
    }

    fn env(&self) -> &AppEnv {
        &self.env
    }

    async fn execute_task(&self, ctx: &TaskContext, task: &str) -> Result<TaskResult, PilotError> {
        if let Some(caps) = OPEN_APP_RE.captures(task.trim()) {
            let mention = caps[1].trim().to_string();
            if let Some(target) = self.resolve_app(&mention) {
                return self.launch(ctx, &target.clone(), task).await;
            }
            debug!("system: no module matches app mention '{mention}'");
        }
        Err(PilotError::InvalidInput(guidance_message()))
    }

    async fn execute_task_with_workflow(
        &self,
        ctx: &TaskContext,
        task: &str,
        parsed: &ParsedTask,
    ) -> Result<TaskResult, PilotError> {
        if *parsed == ParsedTask::Invalid {
            return Err(PilotError::InvalidInput(guidance_message()));
        }
        self.execute_task(ctx, task).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apps() -> Vec<ModuleInfo> {
        vec![
            ModuleInfo {
                name: "wechat".into(),
                package_id: "com.tencent.mm".into(),
                keywords: vec!["微信".into()],
                description: String::new(),
            },
            ModuleInfo {
                name: "browser".into(),
                package_id: "com.android.chrome".into(),
                keywords: vec!["浏览器".into()],
                description: String::new(),
            },
        ]
    }

    #[test]
    fn open_app_pattern_extracts_mention() {
        let caps = OPEN_APP_RE.captures("打开微信").unwrap();
        assert_eq!(&caps[1], "微信");
        let caps = OPEN_APP_RE.captures("open chrome").unwrap();
        assert_eq!(caps[1].trim(), "chrome");
        assert!(OPEN_APP_RE.captures("天气怎么样").is_none());
    }

    #[test]
    fn resolve_by_keyword_and_name() {
        let handler_apps = apps();
        let by_keyword = handler_apps
            .iter()
            .find(|m| m.keywords.iter().any(|k| "微信".contains(k.as_str())))
            .unwrap();
        assert_eq!(by_keyword.package_id, "com.tencent.mm");
        let by_name = handler_apps
            .iter()
            .find(|m| m.name.eq_ignore_ascii_case("browser"))
            .unwrap();
        assert_eq!(by_name.package_id, "com.android.chrome");
    }
}
