use async_trait::async_trait;

use crate::classifier::ParsedTask;
use crate::error::PilotError;
use crate::executor::{AppEnv, TaskContext, TaskResult};

mod system;
mod wechat;

pub use system::SystemHandler;
pub use wechat::{validate_app_dir, WeChatHandler};

/// An app handler: owns its executor and environment, maps tasks to
/// workflows, and delegates execution. The executor only sees the
/// environment it borrows per task; there is no back-pointer.
#[async_trait]
pub trait AppHandler: Send + Sync {
    fn name(&self) -> &str;

    fn env(&self) -> &AppEnv;

    /// Natural-language entry: the handler classifies (or plans) locally.
    async fn execute_task(&self, ctx: &TaskContext, task: &str)
        -> Result<TaskResult, PilotError>;

    /// Type-routed entry: the runner already has a parsed record.
    async fn execute_task_with_workflow(
        &self,
        ctx: &TaskContext,
        task: &str,
        parsed: &ParsedTask,
    ) -> Result<TaskResult, PilotError>;
}

/// User-facing guidance shown for unusable input, with the fixed-form
/// template among the examples.
pub fn guidance_message() -> String {
    [
        "无法理解该指令。试试这些格式：",
        "  ss:张三:你好              （快捷发消息）",
        "  ss:朋友圈:今天天气真好     （快捷发朋友圈）",
        "  给张三发微信说明天见        （自然语言）",
    ]
    .join("\n")
}
