use std::io::{BufRead, Write};

use crate::executor::TaskContext;
use crate::runner::{RunOutcome, TaskRunner};

// ── ANSI colors ─────────────────────────────────────────────────────────────
const BOLD: &str = "\x1b[1m";
const DIM: &str = "\x1b[2m";
const GREEN: &str = "\x1b[32m";
const YELLOW: &str = "\x1b[33m";
const RED: &str = "\x1b[31m";
const CYAN: &str = "\x1b[36m";
const RESET: &str = "\x1b[0m";

/// Sentinels that leave the current input mode.
const SENTINELS: &[&str] = &["q", "quit", "exit", "返回"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InputMode {
    FastForm,
    Natural,
}

/// Interactive mode: a two-item menu, then a task loop until an empty line
/// or a sentinel re-offers the menu. A mid-task classification failure also
/// falls back to the menu.
pub async fn run_interactive(runner: &TaskRunner) -> anyhow::Result<i32> {
    println!("\n{CYAN}{BOLD}droidpilot — 交互模式{RESET}\n");

    loop {
        let mode = match pick_mode()? {
            Some(mode) => mode,
            None => return Ok(0),
        };

        let hint = match mode {
            InputMode::FastForm => "快捷指令（如 张三:你好 或 朋友圈:天气不错）",
            InputMode::Natural => "自然语言（如 给张三发微信说明天见）",
        };
        println!("\n  {DIM}{hint}，空行返回菜单{RESET}");

        loop {
            let Some(line) = prompt("task> ")? else {
                return Ok(0);
            };
            let line = line.trim().to_string();
            if line.is_empty() || SENTINELS.contains(&line.to_lowercase().as_str()) {
                break;
            }

            // Fast-form mode accepts the bare fields and supplies the
            // prefix itself.
            let utterance = match mode {
                InputMode::FastForm if !crate::classifier::has_fast_prefix(&line) => {
                    format!("ss:{line}")
                }
                _ => line,
            };

            let ctx = TaskContext::new();
            let outcome = runner.run_task(&ctx, &utterance).await;
            print_outcome(&outcome);

            if outcome.reselect_mode {
                println!("  {YELLOW}无法识别任务类型，请重新选择模式{RESET}");
                break;
            }
        }
    }
}

fn pick_mode() -> anyhow::Result<Option<InputMode>> {
    println!("{BOLD}请选择输入模式：{RESET}");
    println!("  1. 快捷指令 {DIM}(ss: 固定格式，零成本解析){RESET}");
    println!("  2. 自然语言 {DIM}(模型理解){RESET}");
    println!("  {DIM}q 退出{RESET}");
    loop {
        let Some(choice) = prompt("mode> ")? else {
            return Ok(None);
        };
        match choice.trim() {
            "1" => return Ok(Some(InputMode::FastForm)),
            "2" => return Ok(Some(InputMode::Natural)),
            c if SENTINELS.contains(&c.to_lowercase().as_str()) => return Ok(None),
            "" => continue,
            other => println!("  {YELLOW}未知选项 '{other}'，请输入 1 或 2{RESET}"),
        }
    }
}

/// One line from stdin; `None` on EOF.
fn prompt(label: &str) -> anyhow::Result<Option<String>> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    let read = std::io::stdin().lock().read_line(&mut line)?;
    if read == 0 {
        Ok(None)
    } else {
        Ok(Some(line))
    }
}

/// One success line with elapsed time, or the error kind with a short
/// reason and a retry suggestion where one helps.
pub fn print_outcome(outcome: &RunOutcome) {
    if outcome.success {
        println!(
            "  {GREEN}{BOLD}✅ {}{RESET} {DIM}({:.1}s){RESET}",
            outcome.message,
            outcome.elapsed.as_secs_f64()
        );
        return;
    }

    let kind = outcome.error_kind.unwrap_or("failed");
    println!(
        "  {RED}{BOLD}❌ [{kind}]{RESET} {} {DIM}({:.1}s){RESET}",
        outcome.message,
        outcome.elapsed.as_secs_f64()
    );
    if let Some(result) = &outcome.result {
        for step in result.steps.iter().filter(|s| !s.ok) {
            println!("     {DIM}step {} failed: {}{RESET}", step.step, step.detail);
        }
    }
    match kind {
        "invalid_input" => {
            // The guidance message already carries examples.
        }
        "device_unavailable" | "device_command_failed" => {
            println!("     {YELLOW}检查 adb devices 与 DEFAULT_DEVICE 设置{RESET}");
        }
        "unable_to_reach_home" => {
            println!("     {YELLOW}手动回到应用首页后重试{RESET}");
        }
        _ => {}
    }
}
