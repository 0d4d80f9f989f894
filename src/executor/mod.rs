use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::assets::AssetStore;
use crate::config::WorkflowTuning;
use crate::device::{Device, Screenshot, KEY_BACK};
use crate::error::PilotError;
use crate::locator::{LocateResult, LocateTarget, Locator, Strategy};
use crate::model::ModelClient;
use crate::registry::ModuleInfo;
use crate::workflow::{
    substitute, Action, NavStep, ScreenTable, StepParams, SwipeDirection, TargetRef, Workflow,
    SCREEN_HOME, SCREEN_UNKNOWN,
};

/// Explicit context threaded through a task: cancellation plus an advisory
/// deadline. Each component still observes its own timeouts.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

impl Default for TaskContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskContext {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_deadline(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.is_cancelled()
            || self.deadline.map(|d| Instant::now() >= d).unwrap_or(false)
    }

    /// Sleep that aborts at the next suspension point on cancellation.
    /// Returns false when the sleep was cut short.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => !self.cancelled(),
            _ = self.cancel.cancelled() => false,
        }
    }
}

/// Everything the executor requires from its calling handler: module
/// identity, asset lookup, the screen enumeration, and the workflow table.
/// The handler owns this; the executor only borrows it per task.
pub struct AppEnv {
    pub module: ModuleInfo,
    pub assets: AssetStore,
    pub screens: ScreenTable,
    pub workflows: HashMap<String, Workflow>,
    /// Settle delay before captures (per-app configurable).
    pub capture_wait: Duration,
    /// Extra readiness delay after screen-transition steps.
    pub transition_wait: Duration,
}

impl AppEnv {
    pub fn workflow(&self, name: &str) -> Option<&Workflow> {
        self.workflows.get(name)
    }
}

// ── Results ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Aborted,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step: String,
    pub ok: bool,
    pub attempts: u32,
    /// Substituted author description on success, error text on failure.
    pub detail: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskResult {
    pub id: String,
    pub workflow: String,
    pub status: TaskStatus,
    pub steps: Vec<StepResult>,
    pub message: String,
    pub started_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl TaskResult {
    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

// ── Execution tiers ─────────────────────────────────────────────────────────

/// How much observation a step needs before acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecTier {
    /// Run blind: no capture, no verification.
    FireAndForget,
    /// Small delay only.
    QuickVerify,
    /// Capture + CV locate + action.
    LocateAndExecute,
    /// Capture + remote-model locate.
    FullAi,
}

pub fn exec_tier(step: &NavStep) -> ExecTier {
    match step.action {
        Action::LaunchApp
        | Action::Call
        | Action::OpenUrl
        | Action::NavToHome
        | Action::Wait
        | Action::PressKey
        | Action::Keyevent => ExecTier::FireAndForget,
        Action::Swipe => ExecTier::QuickVerify,
        Action::Tap | Action::LongPress | Action::InputText | Action::InputUrl
        | Action::FindOrSearch => {
            let dynamic = step
                .target
                .as_deref()
                .map(|t| t.starts_with("dynamic:"))
                .unwrap_or(false);
            if dynamic {
                ExecTier::FullAi
            } else {
                ExecTier::LocateAndExecute
            }
        }
        Action::Check | Action::Conditional | Action::Screenshot | Action::SubWorkflow => {
            ExecTier::LocateAndExecute
        }
    }
}

/// How much checking a step gets after acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyTier {
    Skip,
    /// Error-dialog sweep only.
    Lenient,
    /// Capture and expect the screen to have changed.
    Standard,
    /// Reference match or model-verified predicate from the step itself.
    Precise,
}

pub fn verify_tier(step: &NavStep) -> VerifyTier {
    if step.params.contains_key("verify_ref") || step.params.contains_key("success_condition") {
        return VerifyTier::Precise;
    }
    match step.action {
        Action::Wait | Action::PressKey | Action::Keyevent | Action::NavToHome => VerifyTier::Skip,
        Action::LaunchApp | Action::OpenUrl | Action::Call => VerifyTier::Lenient,
        Action::Tap
        | Action::LongPress
        | Action::Swipe
        | Action::InputText
        | Action::InputUrl => VerifyTier::Standard,
        _ => VerifyTier::Skip,
    }
}

/// Retry/recovery state machine for one step. Budgets are explicit; there is
/// no nested retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Run,
    RetryStep,
    RecoverHome,
    Replan,
    Abort,
}

// ── Executor ────────────────────────────────────────────────────────────────

/// Interprets declarative workflows against one device binding. Entry runs
/// the preset (foreground + at-home), exit always runs the reset
/// (back-to-home), regardless of the body outcome.
pub struct WorkflowExecutor {
    device: Arc<dyn Device>,
    locator: Locator,
    model: Arc<ModelClient>,
    tuning: WorkflowTuning,
}

/// Reset under cancellation gets a short dedicated budget so the device is
/// still left at home.
const CANCELLED_RESET_ATTEMPTS: u32 = 2;

/// Names of the shared navigation controls every app's asset set may carry.
const REF_CANCEL: &str = "cancel_button";
const REF_BACK: &str = "back_button";
const REF_ERROR_DIALOG: &str = "error_dialog";

impl WorkflowExecutor {
    pub fn new(
        device: Arc<dyn Device>,
        model: Arc<ModelClient>,
        tuning: WorkflowTuning,
    ) -> Self {
        Self {
            device,
            locator: Locator::new(Arc::clone(&model)),
            model,
            tuning,
        }
    }

    /// Run one workflow to completion. The returned result is final: the
    /// reset phase has already run on every path through this function.
    pub async fn execute_workflow(
        &self,
        ctx: &TaskContext,
        env: &AppEnv,
        workflow_name: &str,
        user_params: &StepParams,
        task_desc: &str,
    ) -> TaskResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let id = uuid::Uuid::new_v4().to_string()[..8].to_string();

        let mut trace: Vec<StepResult> = Vec::new();
        let body = self
            .run_body(ctx, env, workflow_name, user_params, task_desc, &mut trace)
            .await;

        // Reset: mandatory, exactly once, result-preserving. Errors here are
        // logged and never override the body outcome.
        let reset_budget = if ctx.cancelled() {
            CANCELLED_RESET_ATTEMPTS
        } else {
            self.tuning.home_max_attempts
        };
        if let Err(e) = self.ensure_home(env, reset_budget).await {
            warn!("reset to home failed after body: {e}");
        }

        let (status, message) = match body {
            Ok(()) => (TaskStatus::Success, format!("workflow '{workflow_name}' completed")),
            Err(e) if ctx.cancelled() => (TaskStatus::Aborted, e.to_string()),
            Err(e) => (TaskStatus::Failed, e.to_string()),
        };

        TaskResult {
            id,
            workflow: workflow_name.to_string(),
            status,
            steps: trace,
            message,
            started_at,
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    async fn run_body(
        &self,
        ctx: &TaskContext,
        env: &AppEnv,
        workflow_name: &str,
        user_params: &StepParams,
        task_desc: &str,
        trace: &mut Vec<StepResult>,
    ) -> Result<(), PilotError> {
        let workflow = env.workflow(workflow_name).ok_or_else(|| {
            PilotError::ParamsMissing(vec![format!("workflow '{workflow_name}' not defined")])
        })?;

        let missing = workflow.missing_params(user_params);
        if !missing.is_empty() {
            return Err(PilotError::ParamsMissing(missing));
        }
        let params = workflow.merge_params(user_params);

        // Preset: app in foreground, device at home.
        self.ensure_foreground(ctx, env).await?;
        self.ensure_home(env, self.tuning.home_max_attempts).await?;

        // Start-screen invariant. Home counts; anything else navigates back
        // to home first so every workflow starts from a known state.
        let shot = self.capture().await?;
        let screen = self.detect_screen(env, &shot).await;
        if !workflow.valid_start_screens.iter().any(|s| s == &screen)
            || screen != SCREEN_HOME && workflow.valid_start_screens.iter().any(|s| s == SCREEN_HOME)
        {
            debug!("start screen '{screen}' needs navigation to home");
            self.nav_to_home_with_retry(env).await?;
        }

        let mut replans_used = 0u32;
        self.run_steps(
            ctx,
            env,
            task_desc,
            workflow.steps.clone(),
            &params,
            trace,
            &mut replans_used,
            0,
        )
        .await
    }

    // ── Preset helpers ──────────────────────────────────────────────────

    /// Launch the app when it is not already foreground, verifying with the
    /// foreground query and falling back to screenshot detection when the
    /// query is unsupported.
    async fn ensure_foreground(&self, ctx: &TaskContext, env: &AppEnv) -> Result<(), PilotError> {
        let package = env.module.package_id.clone();
        let device = Arc::clone(&self.device);

        let current = tokio::task::spawn_blocking({
            let device = Arc::clone(&device);
            move || device.foreground_app()
        })
        .await
        .map_err(|e| PilotError::DeviceUnavailable(e.to_string()))??;

        if current.as_deref() == Some(package.as_str()) {
            return Ok(());
        }

        info!("launching {package}");
        let launch_pkg = package.clone();
        tokio::task::spawn_blocking({
            let device = Arc::clone(&device);
            move || device.launch_app(&launch_pkg)
        })
        .await
        .map_err(|e| PilotError::DeviceUnavailable(e.to_string()))??;

        if !ctx.sleep(Duration::from_millis(1500)).await {
            return Err(PilotError::StepFailed {
                step: "launch".into(),
                attempts: 1,
                reason: "cancelled".into(),
            });
        }

        let verified = tokio::task::spawn_blocking({
            let device = Arc::clone(&device);
            move || device.foreground_app()
        })
        .await
        .map_err(|e| PilotError::DeviceUnavailable(e.to_string()))??;

        match verified {
            Some(pkg) if pkg == package => Ok(()),
            Some(pkg) => {
                warn!("foreground is '{pkg}', expected '{package}'; continuing by detection");
                Ok(())
            }
            None => {
                // Query unsupported on this build: detect the app's own
                // screens instead.
                let shot = self.capture().await?;
                let screen = self.detect_screen(env, &shot).await;
                if screen == SCREEN_UNKNOWN {
                    warn!("foreground query unsupported and no app screen detected");
                }
                Ok(())
            }
        }
    }

    /// Ensure-home loop: capture, locate home/cancel/back candidates in
    /// parallel, act on the best, up to `budget` attempts. Device back-key
    /// presses are additionally bounded by the back-press budget.
    pub async fn ensure_home(&self, env: &AppEnv, budget: u32) -> Result<(), PilotError> {
        let home_indicator = env
            .screens
            .get(SCREEN_HOME)
            .and_then(|s| s.indicators.first().cloned())
            .unwrap_or_else(|| "home_tab".to_string());

        // Without any visual anchors (asset-less app) the device home key is
        // the only tool: two presses land the launcher.
        let no_anchors = [home_indicator.as_str(), REF_CANCEL, REF_BACK]
            .iter()
            .all(|name| env.assets.get_image(name).is_none());
        if no_anchors {
            debug!("ensure-home: no visual anchors, pressing device home");
            let device = Arc::clone(&self.device);
            return run_device(move || device.go_home()).await;
        }

        let mut back_presses = 0u32;
        for attempt in 1..=budget {
            tokio::time::sleep(env.capture_wait).await;
            let shot = self.capture().await?;

            let targets = vec![
                (SCREEN_HOME.to_string(), self.reference_target(env, &home_indicator)),
                (REF_CANCEL.to_string(), self.reference_target(env, REF_CANCEL)),
                (REF_BACK.to_string(), self.reference_target(env, REF_BACK)),
            ];
            let results = self
                .locator
                .locate_many(&shot, targets, Strategy::OpencvFirst)
                .await;

            if let Some(hit) = found(&results, SCREEN_HOME) {
                self.tap_at(hit.x, hit.y).await?;
                debug!("ensure-home: home indicator tapped on attempt {attempt}");
                return Ok(());
            }
            if let Some(hit) = found(&results, REF_CANCEL) {
                debug!("ensure-home: cancel button on attempt {attempt}");
                self.tap_at(hit.x, hit.y).await?;
                continue;
            }
            if let Some(hit) = found(&results, REF_BACK) {
                debug!("ensure-home: back control on attempt {attempt}");
                self.tap_at(hit.x, hit.y).await?;
                continue;
            }

            // AI-assisted fallback: let the vision model look for the home
            // control when the reference images miss, within its own budget.
            if attempt <= self.tuning.ai_fallback_attempts {
                let description = LocateTarget::Description(format!(
                    "the bottom navigation home tab of {}",
                    env.module.name
                ));
                let result = self
                    .locator
                    .locate(&shot, &description, Strategy::AiOnly)
                    .await;
                if result.found {
                    debug!("ensure-home: AI fallback found home control");
                    self.tap_at(result.x, result.y).await?;
                    return Ok(());
                }
            }

            back_presses += 1;
            if back_presses > self.tuning.max_back_presses {
                break;
            }
            debug!("ensure-home: device back key ({back_presses})");
            self.key(KEY_BACK).await?;
            tokio::time::sleep(self.tuning.back_press_interval).await;
        }
        Err(PilotError::UnableToReachHome(budget))
    }

    /// Canonical nav-to-home macro with its own retry budget, used for
    /// invalid start screens and mid-task recovery.
    async fn nav_to_home_with_retry(&self, env: &AppEnv) -> Result<(), PilotError> {
        let mut last = None;
        for _ in 0..self.tuning.recover_nav_attempts {
            match self.ensure_home(env, self.tuning.home_max_attempts).await {
                Ok(()) => return Ok(()),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or(PilotError::UnableToReachHome(self.tuning.home_max_attempts)))
    }

    /// Detect the current screen: states in priority order, primary then
    /// fallback indicators, first hit wins.
    pub async fn detect_screen(&self, env: &AppEnv, shot: &Screenshot) -> String {
        for spec in env.screens.states() {
            for indicator in &spec.indicators {
                let target = self.reference_target(env, indicator);
                if let LocateTarget::Reference { candidates, .. } = &target {
                    if candidates.is_empty() {
                        continue;
                    }
                }
                let result = self.locator.locate(shot, &target, Strategy::OpencvFirst).await;
                if result.found {
                    debug!(
                        "screen '{}' via indicator '{}' ({})",
                        spec.name,
                        indicator,
                        result.stage.as_str()
                    );
                    return spec.name.clone();
                }
            }
        }
        SCREEN_UNKNOWN.to_string()
    }

    // ── Step engine ─────────────────────────────────────────────────────

    fn run_steps<'a>(
        &'a self,
        ctx: &'a TaskContext,
        env: &'a AppEnv,
        task_desc: &'a str,
        steps: Vec<NavStep>,
        params: &'a StepParams,
        trace: &'a mut Vec<StepResult>,
        replans_used: &'a mut u32,
        depth: u32,
    ) -> BoxFuture<'a, Result<(), PilotError>> {
        Box::pin(async move {
            if depth > 4 {
                return Err(PilotError::PlannerFailed(
                    "sub-workflow nesting too deep".into(),
                ));
            }

            let mut queue = steps;
            let mut index = 0usize;

            while index < queue.len() {
                if ctx.cancelled() {
                    return Err(PilotError::StepFailed {
                        step: queue[index].label(),
                        attempts: 0,
                        reason: "cancelled".into(),
                    });
                }

                // Batch consecutive fire-and-forget steps: author order is
                // preserved and no capture happens between them.
                if exec_tier(&queue[index]) == ExecTier::FireAndForget {
                    let batch_end = batch_extent(&queue, index);
                    if batch_end - index > 1 {
                        debug!("batching {} fire-and-forget steps", batch_end - index);
                    }
                    for step in queue[index..batch_end].iter() {
                        let started = Instant::now();
                        let outcome = match describe_step(step, params) {
                            Ok(description) => {
                                if !description.is_empty() {
                                    info!("step {}: {description}", step.label());
                                }
                                self.dispatch(
                                    ctx, env, step, params, task_desc, depth, trace,
                                    replans_used,
                                )
                                .await
                                .map(|()| description)
                            }
                            Err(e) => Err(e),
                        };
                        trace.push(StepResult {
                            step: step.label(),
                            ok: outcome.is_ok(),
                            attempts: 1,
                            detail: match &outcome {
                                Ok(description) => description.clone(),
                                Err(e) => e.to_string(),
                            },
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        });
                        outcome?;
                        tokio::time::sleep(self.post_wait(env, step)).await;
                    }
                    index = batch_end;
                    continue;
                }

                let step = queue[index].clone();
                let mut phase = Phase::Run;
                let mut attempts = 0u32;
                let started = Instant::now();
                let mut last_err: Option<PilotError> = None;

                loop {
                    match phase {
                        Phase::Run | Phase::RetryStep => {
                            attempts += 1;
                            let outcome = match describe_step(&step, params) {
                                Ok(description) => {
                                    if !description.is_empty() {
                                        info!("step {}: {description}", step.label());
                                    }
                                    self.execute_verified(
                                        ctx, env, &step, params, task_desc, depth, trace,
                                        replans_used,
                                    )
                                    .await
                                    .map(|()| description)
                                }
                                Err(e) => Err(e),
                            };
                            match outcome {
                                Ok(description) => {
                                    trace.push(StepResult {
                                        step: step.label(),
                                        ok: true,
                                        attempts,
                                        detail: description,
                                        elapsed_ms: started.elapsed().as_millis() as u64,
                                    });
                                    index += 1;
                                    break;
                                }
                                Err(e) if e.is_environment() => return Err(e),
                                Err(e) => {
                                    debug!("step {} attempt {attempts} failed: {e}", step.label());
                                    last_err = Some(e);
                                    if attempts < self.tuning.max_step_retries {
                                        tokio::time::sleep(Duration::from_millis(500)).await;
                                        phase = Phase::RetryStep;
                                    } else {
                                        phase = Phase::RecoverHome;
                                    }
                                }
                            }
                        }
                        Phase::RecoverHome => {
                            warn!("step {} exhausted retries; recovering", step.label());
                            if let Err(e) = self.nav_to_home_with_retry(env).await {
                                warn!("recovery navigation failed: {e}");
                            }
                            phase = if *replans_used < self.tuning.max_replans {
                                Phase::Replan
                            } else {
                                Phase::Abort
                            };
                        }
                        Phase::Replan => {
                            *replans_used += 1;
                            match self.try_replan(env, task_desc, &step, trace).await {
                                Ok(new_steps) => {
                                    info!(
                                        "replan {} produced {} replacement steps",
                                        replans_used,
                                        new_steps.len()
                                    );
                                    // Replace the failed step and everything
                                    // after it.
                                    queue.truncate(index);
                                    queue.extend(new_steps);
                                    trace.push(StepResult {
                                        step: step.label(),
                                        ok: false,
                                        attempts,
                                        detail: "replanned".into(),
                                        elapsed_ms: started.elapsed().as_millis() as u64,
                                    });
                                    break;
                                }
                                Err(e) => {
                                    warn!("replan failed: {e}");
                                    phase = Phase::Abort;
                                }
                            }
                        }
                        Phase::Abort => {
                            let reason = last_err
                                .take()
                                .map(|e| e.to_string())
                                .unwrap_or_else(|| "unknown".into());
                            trace.push(StepResult {
                                step: step.label(),
                                ok: false,
                                attempts,
                                detail: reason.clone(),
                                elapsed_ms: started.elapsed().as_millis() as u64,
                            });
                            return Err(PilotError::StepFailed {
                                step: step.label(),
                                attempts,
                                reason,
                            });
                        }
                    }
                }
            }
            Ok(())
        })
    }

    /// Execute one step, then its expect-screen check and tier verification.
    async fn execute_verified(
        &self,
        ctx: &TaskContext,
        env: &AppEnv,
        step: &NavStep,
        params: &StepParams,
        task_desc: &str,
        depth: u32,
        trace: &mut Vec<StepResult>,
        replans_used: &mut u32,
    ) -> Result<(), PilotError> {
        let pre = match exec_tier(step) {
            ExecTier::LocateAndExecute | ExecTier::FullAi => {
                tokio::time::sleep(env.capture_wait).await;
                Some(self.capture().await?)
            }
            _ => None,
        };

        self.dispatch_with_shot(ctx, env, step, params, task_desc, depth, trace, replans_used, pre.as_ref())
            .await?;

        tokio::time::sleep(self.post_wait(env, step)).await;

        if let Some(expect) = &step.expect_screen {
            let shot = self.capture().await?;
            let screen = self.detect_screen(env, &shot).await;
            if &screen != expect {
                return Err(PilotError::StepFailed {
                    step: step.label(),
                    attempts: 1,
                    reason: format!("expected screen '{expect}', detected '{screen}'"),
                });
            }
            return Ok(());
        }

        match verify_tier(step) {
            VerifyTier::Skip => Ok(()),
            VerifyTier::Lenient => self.verify_no_error_dialog(env).await,
            VerifyTier::Standard => self.verify_changed(pre.as_ref()).await,
            VerifyTier::Precise => self.verify_precise(env, step, params).await,
        }
    }

    /// Dispatch that captures its own screenshot when one is needed.
    async fn dispatch(
        &self,
        ctx: &TaskContext,
        env: &AppEnv,
        step: &NavStep,
        params: &StepParams,
        task_desc: &str,
        depth: u32,
        trace: &mut Vec<StepResult>,
        replans_used: &mut u32,
    ) -> Result<(), PilotError> {
        self.dispatch_with_shot(ctx, env, step, params, task_desc, depth, trace, replans_used, None)
            .await
    }

    async fn dispatch_with_shot(
        &self,
        ctx: &TaskContext,
        env: &AppEnv,
        step: &NavStep,
        params: &StepParams,
        task_desc: &str,
        depth: u32,
        trace: &mut Vec<StepResult>,
        replans_used: &mut u32,
        shot: Option<&Screenshot>,
    ) -> Result<(), PilotError> {
        match step.action {
            Action::Tap | Action::LongPress => {
                let hit = self.locate_step_target(env, step, params, shot).await?;
                if step.action == Action::Tap {
                    self.tap_at(hit.x, hit.y).await
                } else {
                    let duration = step.param_u64("duration").unwrap_or(1000);
                    let device = Arc::clone(&self.device);
                    run_device(move || device.long_press(hit.x, hit.y, duration)).await
                }
            }
            Action::Swipe => {
                let direction = step
                    .param_str("direction")
                    .and_then(SwipeDirection::parse)
                    .unwrap_or(SwipeDirection::Up);
                let duration = step.param_u64("duration").unwrap_or(300);
                let device = Arc::clone(&self.device);
                let (w, h) = run_device({
                    let device = Arc::clone(&self.device);
                    move || device.screen_size()
                })
                .await?;
                let (x1, y1, x2, y2) = swipe_coords(direction, w, h);
                run_device(move || device.swipe(x1, y1, x2, y2, duration)).await
            }
            Action::InputText | Action::InputUrl => {
                let raw = step.param_str("text").unwrap_or_default().to_string();
                let text = substitute(&raw, params)
                    .map_err(|missing| PilotError::ParamsMissing(missing))?;
                let text = if step.action == Action::InputUrl {
                    normalize_url(&text)
                } else {
                    text
                };
                if step.target.is_some() {
                    // Focus the field first.
                    let hit = self.locate_step_target(env, step, params, shot).await?;
                    self.tap_at(hit.x, hit.y).await?;
                    tokio::time::sleep(Duration::from_millis(300)).await;
                }
                let device = Arc::clone(&self.device);
                run_device(move || device.input_text(&text)).await
            }
            Action::PressKey | Action::Keyevent => {
                let key = step
                    .param_str("key")
                    .map(str::to_string)
                    .or_else(|| step.target.clone())
                    .ok_or_else(|| PilotError::ParamsMissing(vec!["key".into()]))?;
                self.key(&key).await
            }
            Action::Wait => {
                let duration = step.param_u64("duration").unwrap_or(1000);
                ctx.sleep(Duration::from_millis(duration)).await;
                Ok(())
            }
            Action::Check => {
                let expect = step.expect_screen.as_deref().ok_or_else(|| {
                    PilotError::ParamsMissing(vec!["expect_screen".into()])
                })?;
                let shot = self.capture().await?;
                let screen = self.detect_screen(env, &shot).await;
                if screen == expect {
                    Ok(())
                } else {
                    Err(PilotError::StepFailed {
                        step: step.label(),
                        attempts: 1,
                        reason: format!("check expected '{expect}', detected '{screen}'"),
                    })
                }
            }
            Action::FindOrSearch => {
                self.find_or_search(ctx, env, step, params, task_desc, depth, trace, replans_used, shot)
                    .await
            }
            Action::Conditional => {
                let predicate = step
                    .param_str("predicate")
                    .ok_or_else(|| PilotError::ParamsMissing(vec!["predicate".into()]))?;
                let truthy = params
                    .get(predicate)
                    .map(|v| match v {
                        serde_json::Value::Bool(b) => *b,
                        serde_json::Value::String(s) => !s.trim().is_empty(),
                        serde_json::Value::Null => false,
                        _ => true,
                    })
                    .unwrap_or(false);
                let branch = if truthy { "then" } else { "else" };
                let nested: Vec<NavStep> = step
                    .params
                    .get(branch)
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| PilotError::PlannerFailed(format!("bad {branch} branch: {e}")))?
                    .unwrap_or_default();
                if nested.is_empty() {
                    return Ok(());
                }
                self.run_steps(ctx, env, task_desc, nested, params, trace, replans_used, depth + 1)
                    .await
            }
            Action::Screenshot => {
                let path = step
                    .param_str("path")
                    .map(str::to_string)
                    .unwrap_or_else(|| "screenshot.png".into());
                let shot = self.capture().await?;
                std::fs::write(&path, &shot.png).map_err(|e| {
                    PilotError::DeviceCommandFailed(format!("cannot save screenshot: {e}"))
                })?;
                info!("screenshot saved to {path}");
                Ok(())
            }
            Action::NavToHome => self.nav_to_home_with_retry(env).await,
            Action::SubWorkflow => {
                let name = step
                    .target
                    .as_deref()
                    .ok_or_else(|| PilotError::ParamsMissing(vec!["sub_workflow target".into()]))?;
                let child = env.workflow(name).ok_or_else(|| {
                    PilotError::ParamsMissing(vec![format!("workflow '{name}' not defined")])
                })?;
                let mut merged = child.merge_params(params);
                for (k, v) in &step.params {
                    merged.insert(k.clone(), v.clone());
                }
                self.run_steps(
                    ctx,
                    env,
                    task_desc,
                    child.steps.clone(),
                    &merged,
                    trace,
                    replans_used,
                    depth + 1,
                )
                .await
            }
            Action::LaunchApp => {
                let package = step
                    .param_str("package")
                    .unwrap_or(&env.module.package_id)
                    .to_string();
                let device = Arc::clone(&self.device);
                run_device(move || device.launch_app(&package)).await
            }
            Action::OpenUrl => {
                let raw = step
                    .param_str("url")
                    .or(step.target.as_deref())
                    .ok_or_else(|| PilotError::ParamsMissing(vec!["url".into()]))?;
                let url = normalize_url(
                    &substitute(raw, params).map_err(PilotError::ParamsMissing)?,
                );
                let device = Arc::clone(&self.device);
                run_device(move || device.open_url(&url)).await
            }
            Action::Call => {
                let number = step
                    .param_str("number")
                    .ok_or_else(|| PilotError::ParamsMissing(vec!["number".into()]))?
                    .to_string();
                let device = Arc::clone(&self.device);
                run_device(move || device.call(&number)).await
            }
        }
    }

    /// `find_or_search`: locate directly; on a miss run the app's search
    /// sub-workflow with the target text, then locate again.
    async fn find_or_search(
        &self,
        ctx: &TaskContext,
        env: &AppEnv,
        step: &NavStep,
        params: &StepParams,
        task_desc: &str,
        depth: u32,
        trace: &mut Vec<StepResult>,
        replans_used: &mut u32,
        shot: Option<&Screenshot>,
    ) -> Result<(), PilotError> {
        match self.locate_step_target(env, step, params, shot).await {
            Ok(hit) => return self.tap_at(hit.x, hit.y).await,
            Err(e) => debug!("find_or_search direct miss: {e}"),
        }

        let search_workflow = step
            .param_str("search_workflow")
            .unwrap_or("find_via_search");
        let child = env.workflow(search_workflow).ok_or_else(|| {
            PilotError::LocateFailed {
                target: step.target.clone().unwrap_or_default(),
                stage: "remote-model",
            }
        })?;

        let query = substitute(step.target.as_deref().unwrap_or_default(), params)
            .map_err(PilotError::ParamsMissing)?;
        let mut child_params = child.merge_params(params);
        child_params.insert("query".into(), serde_json::Value::String(query));

        self.run_steps(
            ctx,
            env,
            task_desc,
            child.steps.clone(),
            &child_params,
            trace,
            replans_used,
            depth + 1,
        )
        .await?;

        // The search surface should now show the target; one more locate.
        let shot = self.capture().await?;
        let hit = self.locate_step_target(env, step, params, Some(&shot)).await?;
        self.tap_at(hit.x, hit.y).await
    }

    // ── Verification helpers ────────────────────────────────────────────

    /// Lenient check: only an error dialog fails the step. Apps without an
    /// `error_dialog` reference have nothing to check and stay capture-free.
    async fn verify_no_error_dialog(&self, env: &AppEnv) -> Result<(), PilotError> {
        let candidates = env.assets.get_image_variants(REF_ERROR_DIALOG);
        if candidates.is_empty() {
            return Ok(());
        }
        let shot = self.capture().await?;
        let target = LocateTarget::Reference {
            name: REF_ERROR_DIALOG.into(),
            candidates,
        };
        let result = self.locator.locate(&shot, &target, Strategy::OpencvOnly).await;
        if result.found {
            Err(PilotError::StepFailed {
                step: "verify".into(),
                attempts: 1,
                reason: "error dialog on screen".into(),
            })
        } else {
            Ok(())
        }
    }

    /// Standard check: the screen should differ from the pre-action capture.
    async fn verify_changed(&self, pre: Option<&Screenshot>) -> Result<(), PilotError> {
        let Some(pre) = pre else {
            // Quick-verify steps carry no pre-capture; the settle delay in
            // post_wait is the whole check.
            return Ok(());
        };
        let post = self.capture().await?;
        if screens_identical(&pre.png, &post.png) {
            Err(PilotError::StepFailed {
                step: "verify".into(),
                attempts: 1,
                reason: "screen did not change".into(),
            })
        } else {
            Ok(())
        }
    }

    /// Precise check: a reference that must be visible, or a model-verified
    /// predicate.
    async fn verify_precise(
        &self,
        env: &AppEnv,
        step: &NavStep,
        params: &StepParams,
    ) -> Result<(), PilotError> {
        let shot = self.capture().await?;
        if let Some(reference) = step.param_str("verify_ref") {
            let target = self.reference_target(env, reference);
            let result = self.locator.locate(&shot, &target, Strategy::OpencvFirst).await;
            return if result.found {
                Ok(())
            } else {
                Err(PilotError::StepFailed {
                    step: step.label(),
                    attempts: 1,
                    reason: format!("verify_ref '{reference}' not visible"),
                })
            };
        }
        if let Some(condition) = step.param_str("success_condition") {
            let condition = substitute(condition, params).map_err(PilotError::ParamsMissing)?;
            let b64 = base64_png(&shot);
            let satisfied = self
                .model
                .verify_condition(&condition, &b64)
                .await
                .unwrap_or(false);
            return if satisfied {
                Ok(())
            } else {
                Err(PilotError::StepFailed {
                    step: step.label(),
                    attempts: 1,
                    reason: format!("condition not satisfied: {condition}"),
                })
            };
        }
        Ok(())
    }

    // ── Replan ──────────────────────────────────────────────────────────

    async fn try_replan(
        &self,
        env: &AppEnv,
        task_desc: &str,
        failed_step: &NavStep,
        trace: &[StepResult],
    ) -> Result<Vec<NavStep>, PilotError> {
        let shot = self.capture().await?;
        let b64 = base64_png(&shot);
        let trace_text = trace
            .iter()
            .map(|s| {
                format!(
                    "{} {} ({} attempts){}",
                    if s.ok { "ok" } else { "fail" },
                    s.step,
                    s.attempts,
                    if s.detail.is_empty() {
                        String::new()
                    } else {
                        format!(": {}", s.detail)
                    }
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        self.model
            .replan_steps(task_desc, &failed_step.label(), &trace_text, &b64)
            .await
    }

    // ── Device/locator plumbing ─────────────────────────────────────────

    /// Build a locate target for a step: substitute placeholders, then split
    /// on the reference/description variants.
    async fn locate_step_target(
        &self,
        env: &AppEnv,
        step: &NavStep,
        params: &StepParams,
        shot: Option<&Screenshot>,
    ) -> Result<LocateResult, PilotError> {
        let raw = step
            .target
            .as_deref()
            .ok_or_else(|| PilotError::ParamsMissing(vec!["target".into()]))?;
        let substituted = substitute(raw, params).map_err(PilotError::ParamsMissing)?;
        let target_ref = TargetRef::parse(&substituted);

        let (target, strategy) = match &target_ref {
            TargetRef::ByReference(name) => (
                self.reference_target(env, name),
                Strategy::OpencvFirst,
            ),
            TargetRef::ByDescription(desc) => {
                (LocateTarget::Description(desc.clone()), Strategy::AiOnly)
            }
        };

        let owned_shot;
        let shot = match shot {
            Some(s) => s,
            None => {
                owned_shot = self.capture().await?;
                &owned_shot
            }
        };

        let result = self.locator.locate(shot, &target, strategy).await;
        if result.found {
            Ok(result)
        } else {
            Err(PilotError::LocateFailed {
                target: substituted,
                stage: result.stage.as_str(),
            })
        }
    }

    fn reference_target(&self, env: &AppEnv, name: &str) -> LocateTarget {
        LocateTarget::Reference {
            name: name.to_string(),
            candidates: env.assets.get_image_variants(name),
        }
    }

    async fn capture(&self) -> Result<Screenshot, PilotError> {
        let device = Arc::clone(&self.device);
        run_device(move || device.screenshot()).await
    }

    async fn tap_at(&self, x: i32, y: i32) -> Result<(), PilotError> {
        let device = Arc::clone(&self.device);
        run_device(move || device.tap(x, y)).await
    }

    async fn key(&self, code: &str) -> Result<(), PilotError> {
        let code = code.to_string();
        let device = Arc::clone(&self.device);
        run_device(move || device.key_event(&code)).await
    }

    /// Wait policy: per-app base plus per-action adjustment; transitions add
    /// the capture-readiness delay.
    fn post_wait(&self, env: &AppEnv, step: &NavStep) -> Duration {
        let base = match step.action {
            Action::LaunchApp | Action::OpenUrl | Action::Call => Duration::from_millis(1500),
            Action::Tap
            | Action::LongPress
            | Action::InputText
            | Action::InputUrl
            | Action::FindOrSearch
            | Action::PressKey
            | Action::Keyevent => Duration::from_millis(300),
            Action::Swipe => Duration::from_millis(500),
            _ => Duration::ZERO,
        };
        if step.expect_screen.is_some() {
            base + env.transition_wait
        } else {
            base
        }
    }
}

// ── Free helpers ────────────────────────────────────────────────────────────

async fn run_device<T, F>(op: F) -> Result<T, PilotError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PilotError> + Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| PilotError::DeviceUnavailable(format!("device task failed: {e}")))?
}

fn found<'a>(
    results: &'a HashMap<String, LocateResult>,
    key: &str,
) -> Option<&'a LocateResult> {
    results.get(key).filter(|r| r.found)
}

/// Substituted author description for a step. Placeholders get the same
/// treatment as in targets and params: one left over after substitution is
/// a step failure.
fn describe_step(step: &NavStep, params: &StepParams) -> Result<String, PilotError> {
    if step.description.is_empty() {
        return Ok(String::new());
    }
    substitute(&step.description, params).map_err(PilotError::ParamsMissing)
}

/// The extent of the fire-and-forget batch starting at `index`.
fn batch_extent(steps: &[NavStep], index: usize) -> usize {
    let mut end = index;
    while end < steps.len() && exec_tier(&steps[end]) == ExecTier::FireAndForget {
        end += 1;
    }
    end
}

/// Named swipe directions mapped to safe fractions of the screen.
fn swipe_coords(direction: SwipeDirection, w: u32, h: u32) -> (i32, i32, i32, i32) {
    let (w, h) = (w as i32, h as i32);
    match direction {
        SwipeDirection::Up => (w / 2, h * 7 / 10, w / 2, h * 3 / 10),
        SwipeDirection::Down => (w / 2, h * 3 / 10, w / 2, h * 7 / 10),
        SwipeDirection::Left => (w * 8 / 10, h / 2, w * 2 / 10, h / 2),
        SwipeDirection::Right => (w * 2 / 10, h / 2, w * 8 / 10, h / 2),
    }
}

fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    }
}

fn base64_png(shot: &Screenshot) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(&shot.png)
}

/// Cheap change detection on the raw PNG bytes. Re-encoding is
/// deterministic for identical pixels, so byte equality means no change.
fn screens_identical(a: &[u8], b: &[u8]) -> bool {
    a == b
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LlmConfig, ProviderConfig};
    use crate::device::MockDevice;
    use crate::registry::ModuleInfo;
    use crate::workflow::{ScreenSpec, Workflow};

    fn test_model() -> Arc<ModelClient> {
        Arc::new(ModelClient::new(
            LlmConfig {
                primary: ProviderConfig {
                    provider: "openai".into(),
                    api_url: "http://127.0.0.1:1".into(),
                    api_key: String::new(),
                    model: "test".into(),
                },
                max_tokens: 64,
                temperature: 0.0,
                timeout: Duration::from_millis(50),
                local_vision: None,
            },
            None,
        ))
    }

    fn fast_tuning() -> WorkflowTuning {
        WorkflowTuning {
            max_step_retries: 1,
            max_back_presses: 2,
            back_press_interval: Duration::from_millis(1),
            home_max_attempts: 2,
            ai_fallback_attempts: 1,
            recover_nav_attempts: 1,
            max_replans: 0,
        }
    }

    fn test_env(dir: &std::path::Path, workflows: Vec<Workflow>) -> AppEnv {
        AppEnv {
            module: ModuleInfo {
                name: "testapp".into(),
                package_id: "com.example.test".into(),
                keywords: vec![],
                description: String::new(),
            },
            assets: AssetStore::open(dir.join("images")),
            screens: ScreenTable::new(vec![ScreenSpec::new("home", &["home_tab"])]),
            workflows: workflows.into_iter().map(|w| (w.name.clone(), w)).collect(),
            capture_wait: Duration::from_millis(1),
            transition_wait: Duration::from_millis(1),
        }
    }

    fn harness(dir: &std::path::Path, workflows: Vec<Workflow>) -> (Arc<MockDevice>, WorkflowExecutor, AppEnv) {
        let device = Arc::new(MockDevice::new("test".into(), 320, 640));
        let executor = WorkflowExecutor::new(
            device.clone() as Arc<dyn Device>,
            test_model(),
            fast_tuning(),
        );
        let env = test_env(dir, workflows);
        (device, executor, env)
    }

    #[test]
    fn exec_tier_classification() {
        assert_eq!(
            exec_tier(&NavStep::new(Action::Wait)),
            ExecTier::FireAndForget
        );
        assert_eq!(
            exec_tier(&NavStep::new(Action::LaunchApp)),
            ExecTier::FireAndForget
        );
        assert_eq!(exec_tier(&NavStep::new(Action::Swipe)), ExecTier::QuickVerify);
        assert_eq!(
            exec_tier(&NavStep::new(Action::Tap).target("send_button")),
            ExecTier::LocateAndExecute
        );
        assert_eq!(
            exec_tier(&NavStep::new(Action::Tap).target("dynamic: red button")),
            ExecTier::FullAi
        );
    }

    #[test]
    fn verify_tier_classification() {
        assert_eq!(verify_tier(&NavStep::new(Action::Wait)), VerifyTier::Skip);
        assert_eq!(
            verify_tier(&NavStep::new(Action::LaunchApp)),
            VerifyTier::Lenient
        );
        assert_eq!(
            verify_tier(&NavStep::new(Action::Tap)),
            VerifyTier::Standard
        );
        assert_eq!(
            verify_tier(&NavStep::new(Action::Tap).param("verify_ref", "sent_mark")),
            VerifyTier::Precise
        );
    }

    #[test]
    fn swipe_directions_stay_in_safe_fractions() {
        let (x1, y1, x2, y2) = swipe_coords(SwipeDirection::Up, 1000, 2000);
        assert_eq!((x1, x2), (500, 500));
        assert!(y1 > y2);
        let (x1, _, x2, _) = swipe_coords(SwipeDirection::Left, 1000, 2000);
        assert!(x1 > x2);
    }

    #[test]
    fn url_normalization_adds_scheme() {
        assert_eq!(normalize_url("example.com"), "https://example.com");
        assert_eq!(normalize_url("http://a.cn"), "http://a.cn");
    }

    #[tokio::test]
    async fn fire_and_forget_batch_captures_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (device, executor, env) = harness(dir.path(), vec![]);
        let ctx = TaskContext::new();
        let steps = vec![
            NavStep::new(Action::LaunchApp),
            NavStep::new(Action::Wait).param("duration", 5u64),
            NavStep::new(Action::PressKey).param("key", "KEYCODE_ENTER"),
        ];
        let mut trace = Vec::new();
        let mut replans = 0;
        let params = StepParams::new();
        executor
            .run_steps(&ctx, &env, "batch", steps, &params, &mut trace, &mut replans, 0)
            .await
            .unwrap();

        assert_eq!(device.screenshot_count(), 0);
        assert_eq!(trace.len(), 3);
        assert!(trace.iter().all(|s| s.ok));
        // Author order preserved.
        assert!(trace[0].step.starts_with("launch_app"));
        assert!(trace[2].step.starts_with("press_key"));
    }

    #[tokio::test]
    async fn wait_step_succeeds_unconditionally() {
        let dir = tempfile::tempdir().unwrap();
        let (_device, executor, env) = harness(dir.path(), vec![]);
        let ctx = TaskContext::new();
        let mut trace = Vec::new();
        let mut replans = 0;
        let params = StepParams::new();
        executor
            .run_steps(
                &ctx,
                &env,
                "wait",
                vec![NavStep::new(Action::Wait).param("duration", 1u64)],
                &params,
                &mut trace,
                &mut replans,
                0,
            )
            .await
            .unwrap();
        assert!(trace[0].ok);
    }

    #[tokio::test]
    async fn missing_placeholder_fails_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let (_device, executor, env) = harness(dir.path(), vec![]);
        let ctx = TaskContext::new();
        let mut trace = Vec::new();
        let mut replans = 0;
        let params = StepParams::new();
        let err = executor
            .run_steps(
                &ctx,
                &env,
                "subst",
                vec![NavStep::new(Action::InputText).param("text", "{missing}")],
                &params,
                &mut trace,
                &mut replans,
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PilotError::StepFailed { .. }));
    }

    #[tokio::test]
    async fn step_description_is_substituted_into_trace() {
        let dir = tempfile::tempdir().unwrap();
        let (_device, executor, env) = harness(dir.path(), vec![]);
        let ctx = TaskContext::new();
        let mut trace = Vec::new();
        let mut replans = 0;
        let mut params = StepParams::new();
        params.insert(
            "contact".into(),
            serde_json::Value::String("张三".into()),
        );
        executor
            .run_steps(
                &ctx,
                &env,
                "describe",
                vec![NavStep::new(Action::Wait)
                    .param("duration", 1u64)
                    .describe("wait for the chat with {contact} to open")],
                &params,
                &mut trace,
                &mut replans,
                0,
            )
            .await
            .unwrap();
        assert!(trace[0].ok);
        assert_eq!(trace[0].detail, "wait for the chat with 张三 to open");
    }

    #[tokio::test]
    async fn missing_description_placeholder_fails_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let (device, executor, env) = harness(dir.path(), vec![]);
        let ctx = TaskContext::new();
        let mut trace = Vec::new();
        let mut replans = 0;
        let params = StepParams::new();
        let err = executor
            .run_steps(
                &ctx,
                &env,
                "describe",
                vec![NavStep::new(Action::LaunchApp).describe("open {missing}")],
                &params,
                &mut trace,
                &mut replans,
                0,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PilotError::ParamsMissing(_)));
        assert!(!trace[0].ok);
        // The step never ran: no device operation was issued.
        assert!(device.operations().is_empty());
    }

    #[tokio::test]
    async fn check_step_matches_unknown_screen() {
        let dir = tempfile::tempdir().unwrap();
        let (_device, executor, env) = harness(dir.path(), vec![]);
        let ctx = TaskContext::new();
        let mut trace = Vec::new();
        let mut replans = 0;
        let params = StepParams::new();
        // No indicators resolve on the synthetic screen, so detection says
        // unknown; a check expecting unknown passes.
        let mut step = NavStep::new(Action::Check);
        step.expect_screen = Some(SCREEN_UNKNOWN.to_string());
        executor
            .run_steps(&ctx, &env, "check", vec![step], &params, &mut trace, &mut replans, 0)
            .await
            .unwrap();
    }

    /// Write a solid-black reference image that never matches the mock
    /// screen, so the ensure-home loop has an anchor but no hit.
    fn write_unmatchable_asset(dir: &std::path::Path, name: &str) {
        let images = dir.join("images");
        std::fs::create_dir_all(&images).unwrap();
        let img = image::GrayImage::from_pixel(20, 20, image::Luma([0u8]));
        image::DynamicImage::ImageLuma8(img)
            .save(images.join(format!("{name}.png")))
            .unwrap();
    }

    #[tokio::test]
    async fn ensure_home_exhausts_budget_with_back_presses() {
        let dir = tempfile::tempdir().unwrap();
        write_unmatchable_asset(dir.path(), "cancel_button");
        let (device, executor, env) = harness(dir.path(), vec![]);
        let err = executor.ensure_home(&env, 2).await.unwrap_err();
        assert!(matches!(err, PilotError::UnableToReachHome(2)));
        let backs = device
            .operations()
            .iter()
            .filter(|op| op.contains("KEYCODE_BACK"))
            .count();
        assert!(backs >= 1);
        assert!(device.screenshot_count() >= 2);
    }

    #[tokio::test]
    async fn ensure_home_without_anchors_uses_device_home_key() {
        let dir = tempfile::tempdir().unwrap();
        let (device, executor, env) = harness(dir.path(), vec![]);
        executor.ensure_home(&env, 2).await.unwrap();
        let homes = device
            .operations()
            .iter()
            .filter(|op| op.contains("KEYCODE_HOME"))
            .count();
        assert_eq!(homes, 2);
        assert_eq!(device.screenshot_count(), 0);
    }

    #[tokio::test]
    async fn execute_workflow_resets_even_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut wf = Workflow::new("noop");
        wf.steps = vec![NavStep::new(Action::Wait).param("duration", 1u64)];
        let (device, executor, env) = harness(dir.path(), vec![wf]);
        let ctx = TaskContext::new();

        let result = executor
            .execute_workflow(&ctx, &env, "noop", &StepParams::new(), "noop task")
            .await;
        assert_eq!(result.status, TaskStatus::Success);
        // Reset attempted: captures and back-key presses after the body even
        // though ensure-home can't find a home indicator on the mock screen.
        assert!(device.screenshot_count() > 0);
    }

    #[tokio::test]
    async fn failed_step_yields_failed_result_and_still_resets() {
        let dir = tempfile::tempdir().unwrap();
        let mut wf = Workflow::new("doomed");
        wf.steps = vec![NavStep::new(Action::Tap).target("missing_button")];
        let (device, executor, env) = harness(dir.path(), vec![wf]);
        let ctx = TaskContext::new();

        let result = executor
            .execute_workflow(&ctx, &env, "doomed", &StepParams::new(), "doomed task")
            .await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.steps.iter().any(|s| !s.ok));
        // The reset phase ran after the failure: the device home key is the
        // final operation on this anchor-less app.
        let ops = device.operations();
        assert!(ops.last().unwrap().contains("KEYCODE_HOME"));
    }

    #[tokio::test]
    async fn unknown_workflow_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let (_device, executor, env) = harness(dir.path(), vec![]);
        let ctx = TaskContext::new();
        let result = executor
            .execute_workflow(&ctx, &env, "ghost", &StepParams::new(), "task")
            .await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.message.contains("ghost"));
    }

    #[tokio::test]
    async fn missing_required_params_fail_before_any_step() {
        let dir = tempfile::tempdir().unwrap();
        let mut wf = Workflow::new("needs_params");
        wf.required_params = vec!["contact".into()];
        wf.steps = vec![NavStep::new(Action::Wait)];
        let (device, executor, env) = harness(dir.path(), vec![wf]);
        let ctx = TaskContext::new();
        let result = executor
            .execute_workflow(&ctx, &env, "needs_params", &StepParams::new(), "task")
            .await;
        assert_eq!(result.status, TaskStatus::Failed);
        assert!(result.message.contains("contact"));
        // The body never launched the app.
        assert!(!device.operations().iter().any(|op| op.starts_with("launch_app")));
    }

    #[tokio::test]
    async fn cancelled_context_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let mut wf = Workflow::new("cancelme");
        wf.steps = vec![NavStep::new(Action::Wait).param("duration", 50u64)];
        let (_device, executor, env) = harness(dir.path(), vec![wf]);
        let ctx = TaskContext::new();
        ctx.cancel.cancel();
        let result = executor
            .execute_workflow(&ctx, &env, "cancelme", &StepParams::new(), "task")
            .await;
        assert_eq!(result.status, TaskStatus::Aborted);
    }
}
