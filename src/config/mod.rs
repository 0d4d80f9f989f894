use std::time::Duration;

use tracing::warn;

/// Process-wide configuration, loaded once from the environment at startup
/// and threaded through explicitly. Tests construct their own values; nothing
/// here is a global.
#[derive(Debug, Clone)]
pub struct Config {
    pub debug: DebugConfig,
    pub device: DeviceConfig,
    pub llm: LlmConfig,
    pub classifier: ClassifierConfig,
    pub screenshot: ScreenshotConfig,
    pub workflow: WorkflowTuning,
    /// Root directory of app handler assets (`apps/<name>/manifest.yaml`, images).
    pub apps_dir: String,
}

#[derive(Debug, Clone)]
pub struct DebugConfig {
    /// When set, the mock device backend is used instead of adb.
    pub mock_device: bool,
    pub device_name: String,
    pub screen_width: u32,
    pub screen_height: u32,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Serial passed to `adb -s`; empty means the single connected device.
    pub default_device: Option<String>,
    /// Bound on a single bridge command before the device counts as gone.
    pub command_timeout: Duration,
}

/// One model provider endpoint (OpenAI-compatible chat surface).
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub provider: String,
    pub api_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub primary: ProviderConfig,
    pub max_tokens: u32,
    pub temperature: f32,
    pub timeout: Duration,
    /// Optional local vision endpoint used as the small-model locate stage.
    pub local_vision: Option<ProviderConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassifierMode {
    Regex,
    Llm,
}

#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub mode: ClassifierMode,
    /// Cheaper secondary provider for classification; primary is used when unset.
    pub secondary: Option<ProviderConfig>,
}

#[derive(Debug, Clone)]
pub struct ScreenshotConfig {
    /// Wait before capture so the screen settles.
    pub wait_default: Duration,
    pub capture_timeout: Duration,
}

impl ScreenshotConfig {
    /// Per-app override: `SCREENSHOT_WAIT_<APP>` in milliseconds, read at
    /// routing time so new handlers need no code change.
    pub fn wait_for_app(&self, app: &str) -> Duration {
        let key = format!("SCREENSHOT_WAIT_{}", app.to_uppercase());
        match std::env::var(&key).ok().and_then(|v| v.parse::<u64>().ok()) {
            Some(ms) => Duration::from_millis(ms),
            None => self.wait_default,
        }
    }
}

/// Retry and attempt budgets for the workflow executor.
#[derive(Debug, Clone)]
pub struct WorkflowTuning {
    pub max_step_retries: u32,
    pub max_back_presses: u32,
    pub back_press_interval: Duration,
    pub home_max_attempts: u32,
    pub ai_fallback_attempts: u32,
    pub recover_nav_attempts: u32,
    pub max_replans: u32,
}

impl Default for WorkflowTuning {
    fn default() -> Self {
        Self {
            max_step_retries: 3,
            max_back_presses: 5,
            back_press_interval: Duration::from_millis(500),
            home_max_attempts: 5,
            ai_fallback_attempts: 3,
            recover_nav_attempts: 3,
            max_replans: 3,
        }
    }
}

fn env_str(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_str(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    match env_str(key) {
        Some(v) => v.parse().unwrap_or_else(|_| {
            warn!("{} has unparseable value '{}', using default", key, v);
            default
        }),
        None => default,
    }
}

fn provider_triple(prefix: &str) -> Option<ProviderConfig> {
    let api_url = env_str(&format!("{prefix}_API_URL"))?;
    let model = env_str(&format!("{prefix}_MODEL"))?;
    Some(ProviderConfig {
        provider: env_str(&format!("{prefix}_PROVIDER")).unwrap_or_else(|| "openai".into()),
        api_url,
        api_key: env_str(&format!("{prefix}_API_KEY")).unwrap_or_default(),
        model,
    })
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let primary = provider_triple("LLM").ok_or_else(|| {
            anyhow::anyhow!("LLM_API_URL and LLM_MODEL must be set (see .env.example)")
        })?;

        let mode = match env_str("TASK_CLASSIFIER_MODE").as_deref() {
            Some("regex") => ClassifierMode::Regex,
            Some("llm") | None => ClassifierMode::Llm,
            Some(other) => {
                warn!("TASK_CLASSIFIER_MODE '{}' unknown, using llm", other);
                ClassifierMode::Llm
            }
        };

        Ok(Self {
            debug: DebugConfig {
                mock_device: env_bool("DEBUG_MODE", false),
                device_name: env_str("DEBUG_DEVICE_NAME").unwrap_or_else(|| "mock-device".into()),
                screen_width: env_parse("DEBUG_SCREEN_WIDTH", 1080),
                screen_height: env_parse("DEBUG_SCREEN_HEIGHT", 2400),
            },
            device: DeviceConfig {
                default_device: env_str("DEFAULT_DEVICE"),
                command_timeout: Duration::from_secs(env_parse("DEVICE_COMMAND_TIMEOUT", 10u64)),
            },
            llm: LlmConfig {
                primary,
                max_tokens: env_parse("LLM_MAX_TOKENS", 1024),
                temperature: env_parse("LLM_TEMPERATURE", 0.1f32),
                timeout: Duration::from_secs(env_parse("LLM_TIMEOUT", 60u64)),
                local_vision: provider_triple("VISION_LOCAL"),
            },
            classifier: ClassifierConfig {
                mode,
                secondary: provider_triple("CLASSIFIER"),
            },
            screenshot: ScreenshotConfig {
                wait_default: Duration::from_millis(env_parse("SCREENSHOT_WAIT_DEFAULT", 300u64)),
                capture_timeout: Duration::from_secs(env_parse("SCREENSHOT_TIMEOUT", 5u64)),
            },
            workflow: WorkflowTuning {
                max_step_retries: env_parse("WORKFLOW_MAX_STEP_RETRIES", 3),
                max_back_presses: env_parse("WORKFLOW_MAX_BACK_PRESSES", 5),
                back_press_interval: Duration::from_millis(env_parse(
                    "WORKFLOW_BACK_PRESS_INTERVAL",
                    500u64,
                )),
                home_max_attempts: env_parse("WORKFLOW_HOME_MAX_ATTEMPTS", 5),
                ai_fallback_attempts: env_parse("WORKFLOW_AI_FALLBACK_ATTEMPTS", 3),
                recover_nav_attempts: env_parse("WORKFLOW_RECOVER_NAV_ATTEMPTS", 3),
                max_replans: env_parse("WORKFLOW_MAX_REPLANS", 3),
            },
            apps_dir: env_str("APPS_DIR").unwrap_or_else(|| "apps".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tuning_defaults_match_documented_budgets() {
        let t = WorkflowTuning::default();
        assert_eq!(t.max_step_retries, 3);
        assert_eq!(t.max_back_presses, 5);
        assert_eq!(t.back_press_interval, Duration::from_millis(500));
        assert_eq!(t.home_max_attempts, 5);
        assert_eq!(t.max_replans, 3);
    }

    #[test]
    fn env_bool_accepts_common_spellings() {
        std::env::set_var("DP_TEST_BOOL", "TRUE");
        assert!(env_bool("DP_TEST_BOOL", false));
        std::env::set_var("DP_TEST_BOOL", "0");
        assert!(!env_bool("DP_TEST_BOOL", true));
        std::env::remove_var("DP_TEST_BOOL");
        assert!(env_bool("DP_TEST_BOOL", true));
    }

    #[test]
    fn provider_triple_requires_url_and_model() {
        std::env::set_var("DP_TEST_API_URL", "http://localhost:11434/v1");
        assert!(provider_triple("DP_TEST").is_none());
        std::env::set_var("DP_TEST_MODEL", "qwen2.5vl");
        let p = provider_triple("DP_TEST").unwrap();
        assert_eq!(p.model, "qwen2.5vl");
        assert_eq!(p.provider, "openai");
        std::env::remove_var("DP_TEST_API_URL");
        std::env::remove_var("DP_TEST_MODEL");
    }
}
