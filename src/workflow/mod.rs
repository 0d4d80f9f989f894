use std::collections::HashMap;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::assets::AssetStore;

/// Well-known screen names shared by every app enumeration.
pub const SCREEN_HOME: &str = "home";
pub const SCREEN_UNKNOWN: &str = "unknown";
pub const SCREEN_OTHER: &str = "other";

/// Step action vocabulary. The executor interprets these; workflows stay
/// declarative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Tap,
    LongPress,
    Swipe,
    InputText,
    InputUrl,
    PressKey,
    /// Raw key-code form of `press_key`; kept for authoring compatibility.
    Keyevent,
    Wait,
    Check,
    FindOrSearch,
    Conditional,
    Screenshot,
    NavToHome,
    SubWorkflow,
    LaunchApp,
    OpenUrl,
    Call,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Tap => "tap",
            Action::LongPress => "long_press",
            Action::Swipe => "swipe",
            Action::InputText => "input_text",
            Action::InputUrl => "input_url",
            Action::PressKey => "press_key",
            Action::Keyevent => "keyevent",
            Action::Wait => "wait",
            Action::Check => "check",
            Action::FindOrSearch => "find_or_search",
            Action::Conditional => "conditional",
            Action::Screenshot => "screenshot",
            Action::NavToHome => "nav_to_home",
            Action::SubWorkflow => "sub_workflow",
            Action::LaunchApp => "launch_app",
            Action::OpenUrl => "open_url",
            Action::Call => "call",
        }
    }
}

/// How a step names the thing it interacts with. The authoring syntax keeps
/// the `dynamic:` prefix; in code the two cases are distinct variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetRef {
    /// Logical reference name resolved through the asset store.
    ByReference(String),
    /// Free-text description resolved by a vision model only.
    ByDescription(String),
}

impl TargetRef {
    pub fn parse(raw: &str) -> Self {
        match raw.strip_prefix("dynamic:") {
            Some(desc) => TargetRef::ByDescription(desc.trim().to_string()),
            None => TargetRef::ByReference(raw.to_string()),
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, TargetRef::ByDescription(_))
    }

    pub fn display(&self) -> &str {
        match self {
            TargetRef::ByReference(name) => name,
            TargetRef::ByDescription(desc) => desc,
        }
    }
}

pub type StepParams = serde_json::Map<String, serde_json::Value>;

fn default_max_wait_ms() -> u64 {
    10_000
}

/// One declarative workflow step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavStep {
    pub action: Action,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub params: StepParams,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub expect_screen: Option<String>,
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl NavStep {
    pub fn new(action: Action) -> Self {
        Self {
            action,
            target: None,
            params: StepParams::new(),
            description: String::new(),
            expect_screen: None,
            max_wait_ms: default_max_wait_ms(),
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn describe(mut self, text: impl Into<String>) -> Self {
        self.description = text.into();
        self
    }

    pub fn expect(mut self, screen: impl Into<String>) -> Self {
        self.expect_screen = Some(screen.into());
        self
    }

    pub fn param(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    pub fn param_str(&self, key: &str) -> Option<&str> {
        self.params.get(key).and_then(|v| v.as_str())
    }

    pub fn param_u64(&self, key: &str) -> Option<u64> {
        self.params.get(key).and_then(|v| v.as_u64())
    }

    /// Short label for traces and failure messages.
    pub fn label(&self) -> String {
        match &self.target {
            Some(t) => format!("{}({t})", self.action.as_str()),
            None => self.action.as_str().to_string(),
        }
    }
}

/// A named swipe direction mapped to safe screen fractions by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwipeDirection {
    Up,
    Down,
    Left,
    Right,
}

impl SwipeDirection {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.to_lowercase().as_str() {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            _ => None,
        }
    }
}

/// Declarative workflow: ordered steps plus pre/postconditions. Immutable
/// after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Never empty; always reachable from `home`.
    pub valid_start_screens: Vec<String>,
    #[serde(default)]
    pub nav_to_start: Option<String>,
    pub steps: Vec<NavStep>,
    #[serde(default)]
    pub end_screen: Option<String>,
    #[serde(default)]
    pub required_params: Vec<String>,
    /// Optional parameters with their default values.
    #[serde(default)]
    pub optional_params: HashMap<String, String>,
}

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            valid_start_screens: vec![SCREEN_HOME.to_string()],
            nav_to_start: None,
            steps: Vec::new(),
            end_screen: None,
            required_params: Vec::new(),
            optional_params: HashMap::new(),
        }
    }

    /// Required params not present in the supplied map.
    pub fn missing_params(&self, params: &StepParams) -> Vec<String> {
        self.required_params
            .iter()
            .filter(|p| {
                !params.contains_key(p.as_str())
                    || params
                        .get(p.as_str())
                        .and_then(|v| v.as_str())
                        .map(|s| s.trim().is_empty())
                        .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// Merged parameter map: optional defaults overlaid by user params.
    pub fn merge_params(&self, user: &StepParams) -> StepParams {
        let mut merged = StepParams::new();
        for (k, v) in &self.optional_params {
            merged.insert(k.clone(), serde_json::Value::String(v.clone()));
        }
        for (k, v) in user {
            merged.insert(k.clone(), v.clone());
        }
        merged
    }

    /// Author-contract validation: non-empty start screens, expect screens
    /// in the app's enumeration, every static target resolvable (asset,
    /// placeholder, or dynamic description).
    pub fn validate(&self, screens: &ScreenTable, assets: &AssetStore) -> Result<(), String> {
        if self.valid_start_screens.is_empty() {
            return Err(format!("workflow '{}' has no valid start screens", self.name));
        }
        for screen in &self.valid_start_screens {
            if !screens.knows(screen) {
                return Err(format!(
                    "workflow '{}' starts on unknown screen '{screen}'",
                    self.name
                ));
            }
        }
        if let Some(end) = &self.end_screen {
            if !screens.knows(end) {
                return Err(format!(
                    "workflow '{}' ends on unknown screen '{end}'",
                    self.name
                ));
            }
        }
        for step in &self.steps {
            if let Some(expect) = &step.expect_screen {
                if !screens.knows(expect) {
                    return Err(format!(
                        "workflow '{}' step {} expects unknown screen '{expect}'",
                        self.name,
                        step.label()
                    ));
                }
            }
            if let Some(target) = &step.target {
                if has_placeholder(target) || target.starts_with("dynamic:") {
                    continue;
                }
                if matches!(step.action, Action::SubWorkflow | Action::LaunchApp) {
                    continue;
                }
                if assets.get_image(target).is_none() {
                    return Err(format!(
                        "workflow '{}' step {} references missing asset '{target}'",
                        self.name,
                        step.label()
                    ));
                }
            }
        }
        Ok(())
    }
}

static PLACEHOLDER_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

pub fn has_placeholder(text: &str) -> bool {
    PLACEHOLDER_RE.is_match(text)
}

/// Purely textual `{name}` substitution. Placeholders that survive
/// substitution are returned as the error, which the executor treats as step
/// failure.
pub fn substitute(text: &str, params: &StepParams) -> Result<String, Vec<String>> {
    let mut missing = Vec::new();
    let out = PLACEHOLDER_RE.replace_all(text, |caps: &regex::Captures| {
        let key = &caps[1];
        match params.get(key) {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => {
                missing.push(key.to_string());
                String::new()
            }
        }
    });
    if missing.is_empty() {
        Ok(out.into_owned())
    } else {
        Err(missing)
    }
}

/// One detectable screen: a name plus its visual indicators. The first
/// indicator is primary; the rest are fallbacks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenSpec {
    pub name: String,
    pub indicators: Vec<String>,
}

impl ScreenSpec {
    pub fn new(name: impl Into<String>, indicators: &[&str]) -> Self {
        Self {
            name: name.into(),
            indicators: indicators.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Per-app screen enumeration in detection priority order. `home`,
/// `unknown`, and `other` are always members even without indicators.
#[derive(Debug, Clone, Default)]
pub struct ScreenTable {
    states: Vec<ScreenSpec>,
}

impl ScreenTable {
    pub fn new(states: Vec<ScreenSpec>) -> Self {
        Self { states }
    }

    pub fn states(&self) -> &[ScreenSpec] {
        &self.states
    }

    pub fn knows(&self, name: &str) -> bool {
        name == SCREEN_HOME
            || name == SCREEN_UNKNOWN
            || name == SCREEN_OTHER
            || self.states.iter().any(|s| s.name == name)
    }

    pub fn get(&self, name: &str) -> Option<&ScreenSpec> {
        self.states.iter().find(|s| s.name == name)
    }
}

// ── On-disk task templates ──────────────────────────────────────────────────

/// Optional per-app template file: `{name, patterns[], variables[], steps[]}`
/// entries merged into the handler's workflow set at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskTemplate {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub patterns: Vec<String>,
    #[serde(default)]
    pub variables: Vec<String>,
    pub steps: Vec<NavStep>,
    #[serde(default)]
    pub valid_start_screens: Vec<String>,
    #[serde(default)]
    pub end_screen: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    templates: Vec<TaskTemplate>,
}

impl TaskTemplate {
    pub fn into_workflow(self) -> Workflow {
        let valid_start_screens = if self.valid_start_screens.is_empty() {
            vec![SCREEN_HOME.to_string()]
        } else {
            self.valid_start_screens
        };
        Workflow {
            name: self.name,
            description: self.description,
            valid_start_screens,
            nav_to_start: None,
            steps: self.steps,
            end_screen: self.end_screen,
            required_params: self.variables,
            optional_params: HashMap::new(),
        }
    }
}

/// Load `templates.yaml` from an app directory. Absent file is fine; a
/// malformed one is skipped with a warning so a bad template can't take the
/// whole handler down.
pub fn load_templates(dir: &Path) -> Vec<TaskTemplate> {
    let path = dir.join("templates.yaml");
    let content = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    match serde_yaml::from_str::<TemplateFile>(&content) {
        Ok(file) => file.templates,
        Err(e) => {
            warn!("ignoring malformed template file {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> StepParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), serde_json::Value::String(v.to_string())))
            .collect()
    }

    #[test]
    fn target_ref_parses_dynamic_prefix() {
        assert_eq!(
            TargetRef::parse("send_button"),
            TargetRef::ByReference("send_button".into())
        );
        assert_eq!(
            TargetRef::parse("dynamic: the red publish button"),
            TargetRef::ByDescription("the red publish button".into())
        );
    }

    #[test]
    fn substitution_replaces_all_placeholders() {
        let p = params(&[("contact", "张三"), ("message", "你好")]);
        let out = substitute("send {message} to {contact}", &p).unwrap();
        assert_eq!(out, "send 你好 to 张三");
    }

    #[test]
    fn substitution_reports_missing_placeholders() {
        let p = params(&[("contact", "张三")]);
        let err = substitute("{contact}: {message}", &p).unwrap_err();
        assert_eq!(err, vec!["message".to_string()]);
    }

    #[test]
    fn missing_params_flags_empty_strings() {
        let mut wf = Workflow::new("send_message");
        wf.required_params = vec!["contact".into(), "message".into()];
        let p = params(&[("contact", "张三"), ("message", "  ")]);
        assert_eq!(wf.missing_params(&p), vec!["message".to_string()]);
    }

    #[test]
    fn merge_params_overlays_user_over_defaults() {
        let mut wf = Workflow::new("post_moments");
        wf.optional_params
            .insert("postAction".into(), "long_press".into());
        let merged = wf.merge_params(&params(&[("content", "nice weather")]));
        assert_eq!(merged["postAction"], "long_press");
        assert_eq!(merged["content"], "nice weather");

        let overridden = wf.merge_params(&params(&[("postAction", "tap")]));
        assert_eq!(overridden["postAction"], "tap");
    }

    #[test]
    fn screen_table_always_knows_builtins() {
        let table = ScreenTable::new(vec![ScreenSpec::new("chat", &["chat_input"])]);
        assert!(table.knows(SCREEN_HOME));
        assert!(table.knows(SCREEN_UNKNOWN));
        assert!(table.knows("chat"));
        assert!(!table.knows("settings"));
    }

    #[test]
    fn step_label_includes_target() {
        let step = NavStep::new(Action::Tap).target("send_button");
        assert_eq!(step.label(), "tap(send_button)");
    }

    #[test]
    fn templates_deserialize_from_yaml() {
        let yaml = r#"
templates:
  - name: open_settings
    patterns: ["打开设置"]
    variables: []
    steps:
      - action: tap
        target: settings_icon
        expect_screen: other
"#;
        let file: TemplateFile = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(file.templates.len(), 1);
        let wf = file.templates.into_iter().next().unwrap().into_workflow();
        assert_eq!(wf.valid_start_screens, vec![SCREEN_HOME.to_string()]);
        assert_eq!(wf.steps[0].action, Action::Tap);
        assert_eq!(wf.steps[0].max_wait_ms, 10_000);
    }
}
