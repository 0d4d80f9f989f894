use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::config::{LlmConfig, ProviderConfig};
use crate::error::PilotError;
use crate::workflow::NavStep;

mod parse;

pub use parse::{extract_json, sanitize_model_json};

/// Long-lived client for every remote-model concern: classification,
/// planning, replanning, verification, and vision-based element location.
/// Holds the only mutable shared state in the pipeline (reqwest's internal
/// connection pool), which is thread-safe by construction.
pub struct ModelClient {
    http: reqwest::Client,
    llm: LlmConfig,
    classifier: Option<ProviderConfig>,
}

/// Raw classifier output before conversion into the typed task record.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawParsed {
    #[serde(rename = "type", default)]
    pub task_type: String,
    #[serde(default)]
    pub recipient: String,
    #[serde(default)]
    pub content: String,
}

/// Remote locator answer: a bounding box on a 0–1000 grid, or a miss with a
/// reason the logs can surface.
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteBox {
    pub found: bool,
    #[serde(default)]
    pub xmin: f32,
    #[serde(default)]
    pub ymin: f32,
    #[serde(default)]
    pub xmax: f32,
    #[serde(default)]
    pub ymax: f32,
    #[serde(default)]
    pub confidence: f32,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub suggestion: Option<String>,
}

impl RemoteBox {
    /// Box center in screenshot pixels.
    pub fn center_px(&self, width: u32, height: u32) -> (i32, i32) {
        let cx = (self.xmin + self.xmax) / 2.0 / 1000.0 * width as f32;
        let cy = (self.ymin + self.ymax) / 2.0 / 1000.0 * height as f32;
        (cx.round() as i32, cy.round() as i32)
    }
}

/// Planner choice among a handler's declared workflows.
#[derive(Debug, Clone, Deserialize)]
pub struct PlanChoice {
    pub workflow_name: String,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

const CLASSIFY_SYSTEM: &str = "output only JSON. fields: type ∈ {send_msg, post_moment_only_text, others, invalid}, recipient, content";

impl ModelClient {
    pub fn new(llm: LlmConfig, classifier: Option<ProviderConfig>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(llm.timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            llm,
            classifier,
        }
    }

    pub fn has_local_vision(&self) -> bool {
        self.llm.local_vision.is_some()
    }

    /// One chat completion against an OpenAI-compatible endpoint. Images are
    /// base64 PNG payloads embedded as data URLs.
    async fn chat(
        &self,
        provider: &ProviderConfig,
        system: &str,
        user: &str,
        images: &[&str],
    ) -> Result<String, PilotError> {
        let url = format!("{}/chat/completions", provider.api_url.trim_end_matches('/'));

        let user_content = if images.is_empty() {
            json!(user)
        } else {
            let mut parts = vec![json!({"type": "text", "text": user})];
            for img in images {
                parts.push(json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:image/png;base64,{img}")}
                }));
            }
            json!(parts)
        };

        let body = json!({
            "model": provider.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user_content}
            ],
            "max_tokens": self.llm.max_tokens,
            "temperature": self.llm.temperature,
        });

        let mut req = self.http.post(&url).json(&body);
        if !provider.api_key.is_empty() {
            req = req.header("Authorization", format!("Bearer {}", provider.api_key));
        }

        let resp = req
            .send()
            .await
            .map_err(|e| PilotError::PlannerFailed(format!("model request failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(PilotError::PlannerFailed(format!(
                "model error {}: {}",
                resp.status(),
                resp.text().await.unwrap_or_default()
            )));
        }
        let result: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| PilotError::PlannerFailed(format!("model response not json: {e}")))?;
        let content = result["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        debug!("model returned {} chars", content.len());
        Ok(content)
    }

    /// Extract and parse a JSON object of type `T` from raw model text.
    fn parse_object<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, PilotError> {
        let sanitized = sanitize_model_json(raw);
        let json_str = extract_json(&sanitized)
            .ok_or_else(|| PilotError::PlannerFailed(format!("no JSON in response: {raw}")))?;
        serde_json::from_str(&json_str)
            .map_err(|e| PilotError::PlannerFailed(format!("bad JSON shape: {e}")))
    }

    /// Classify an utterance. Uses the cheaper secondary provider when
    /// configured, the primary otherwise.
    pub async fn classify(&self, utterance: &str) -> Result<RawParsed, PilotError> {
        let provider = self.classifier.as_ref().unwrap_or(&self.llm.primary);
        let raw = self.chat(provider, CLASSIFY_SYSTEM, utterance, &[]).await?;
        Self::parse_object(&raw)
    }

    /// Locate an element on the screenshot via the remote vision model.
    /// Either a reference image crop or a free-text description drives the
    /// request; both images ride along when available.
    pub async fn locate_remote(
        &self,
        reference_png_b64: Option<&str>,
        description: Option<&str>,
        screenshot_png_b64: &str,
    ) -> Result<RemoteBox, PilotError> {
        let system = "You locate UI elements in Android screenshots. Respond with only JSON: \
                      {\"found\": true, \"xmin\": 0-1000, \"ymin\": 0-1000, \"xmax\": 0-1000, \
                      \"ymax\": 0-1000, \"confidence\": 0.0-1.0} on a 0-1000 grid over the \
                      screenshot, or {\"found\": false, \"reason\": \"...\", \"suggestion\": \"...\"}.";
        let mut images: Vec<&str> = Vec::new();
        let user = match (reference_png_b64, description) {
            (Some(reference), _) => {
                images.push(reference);
                images.push(screenshot_png_b64);
                "The first image is a reference crop of a UI element. Find it in the second \
                 image (the current screenshot) and return its bounding box."
                    .to_string()
            }
            (None, Some(desc)) => {
                images.push(screenshot_png_b64);
                format!(
                    "Find this element in the screenshot and return its bounding box: {desc}"
                )
            }
            (None, None) => {
                return Err(PilotError::PlannerFailed(
                    "locate_remote needs a reference or a description".into(),
                ))
            }
        };
        let raw = self
            .chat(&self.llm.primary, system, &user, &images)
            .await?;
        Self::parse_object(&raw)
    }

    /// Same contract against the optional local vision endpoint (the
    /// small-model stage). Errors when no local endpoint is configured.
    pub async fn locate_local(
        &self,
        hint: &str,
        screenshot_png_b64: &str,
    ) -> Result<RemoteBox, PilotError> {
        let provider = self.llm.local_vision.as_ref().ok_or_else(|| {
            PilotError::PlannerFailed("no local vision endpoint configured".into())
        })?;
        let system = "Locate the described Android UI element. Respond with only JSON: \
                      {\"found\": bool, \"xmin\", \"ymin\", \"xmax\", \"ymax\" on a 0-1000 grid, \
                      \"confidence\": 0.0-1.0}.";
        let user = format!("Element to find: {hint}");
        let raw = self
            .chat(provider, system, &user, &[screenshot_png_b64])
            .await?;
        Self::parse_object(&raw)
    }

    /// Ask the planner to pick a workflow and parameters for a complex task.
    pub async fn choose_workflow(
        &self,
        task: &str,
        workflows: &[(String, String, Vec<String>)],
    ) -> Result<PlanChoice, PilotError> {
        let mut catalog = String::new();
        for (name, description, required) in workflows {
            catalog.push_str(&format!(
                "- {name}: {description} (required params: {})\n",
                required.join(", ")
            ));
        }
        let system = "You map a user task to one of the listed workflows. Respond with only \
                      JSON: {\"workflow_name\": \"...\", \"params\": {...}}. Use exactly the \
                      listed workflow names and fill every required param from the task text.";
        let user = format!("Task: {task}\n\nAvailable workflows:\n{catalog}");
        let raw = self.chat(&self.llm.primary, system, &user, &[]).await?;
        Self::parse_object(&raw)
    }

    /// Replan the remaining steps after a failure. The model sees the
    /// original task, the failed step, the step trace so far, and the current
    /// screenshot, and answers with a replacement step list.
    pub async fn replan_steps(
        &self,
        task: &str,
        failed_step: &str,
        trace: &str,
        screenshot_png_b64: &str,
    ) -> Result<Vec<NavStep>, PilotError> {
        let system = "You repair a failing Android UI workflow. Respond with only JSON: \
                      {\"steps\": [{\"action\": \"tap|long_press|swipe|input_text|press_key|wait|check|nav_to_home\", \
                      \"target\": \"reference name or dynamic:<description>\", \
                      \"params\": {}, \"description\": \"...\"}]}. \
                      Steps replace the remaining workflow from the failure point.";
        let user = format!(
            "Task: {task}\nFailed step: {failed_step}\nExecution trace:\n{trace}\n\n\
             The screenshot shows the current screen. Produce replacement steps."
        );
        let raw = self
            .chat(&self.llm.primary, system, &user, &[screenshot_png_b64])
            .await?;

        #[derive(Deserialize)]
        struct Plan {
            steps: Vec<NavStep>,
        }
        let plan: Plan = Self::parse_object(&raw)?;
        if plan.steps.is_empty() {
            return Err(PilotError::PlannerFailed("replan produced no steps".into()));
        }
        Ok(plan.steps)
    }

    /// Model-verified predicate over the current screenshot (the precise
    /// verification tier).
    pub async fn verify_condition(
        &self,
        condition: &str,
        screenshot_png_b64: &str,
    ) -> Result<bool, PilotError> {
        let system = "Answer with only JSON: {\"satisfied\": true|false}.";
        let user = format!("Does the screenshot satisfy this condition? {condition}");
        let raw = self
            .chat(&self.llm.primary, system, &user, &[screenshot_png_b64])
            .await?;

        #[derive(Deserialize)]
        struct Verdict {
            satisfied: bool,
        }
        let verdict: Verdict = Self::parse_object(&raw)?;
        Ok(verdict.satisfied)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_box_center_converts_grid_to_pixels() {
        let b = RemoteBox {
            found: true,
            xmin: 400.0,
            ymin: 200.0,
            xmax: 600.0,
            ymax: 300.0,
            confidence: 0.9,
            reason: None,
            suggestion: None,
        };
        let (x, y) = b.center_px(1000, 2000);
        assert_eq!((x, y), (500, 500));
    }

    #[test]
    fn parse_object_accepts_fenced_json() {
        let raw = "Here you go:\n```json\n{\"found\": false, \"reason\": \"not visible\"}\n```";
        let parsed: RemoteBox = ModelClient::parse_object(raw).unwrap();
        assert!(!parsed.found);
        assert_eq!(parsed.reason.as_deref(), Some("not visible"));
    }

    #[test]
    fn parse_object_rejects_prose() {
        let res: Result<RemoteBox, _> = ModelClient::parse_object("I could not find it, sorry.");
        assert!(res.is_err());
    }
}
