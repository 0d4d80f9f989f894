mod apps;
mod assets;
mod classifier;
mod config;
mod device;
mod error;
mod executor;
mod locator;
mod model;
mod registry;
mod runner;
mod shell;
mod workflow;

use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};

use crate::config::Config;
use crate::device::open_device;
use crate::executor::TaskContext;
use crate::model::ModelClient;
use crate::runner::TaskRunner;

#[derive(Parser)]
#[command(
    name = "droidpilot",
    version,
    about = "Drive an Android device from the host to complete natural-language tasks"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<SubCommand>,
}

#[derive(Parser)]
enum SubCommand {
    /// List connected adb devices
    Devices,
    /// Show discovered app modules
    Modules,
    /// Capture one screenshot to a file
    Screenshot {
        /// Output path
        #[arg(default_value = "screenshot.png")]
        output: String,
    },
    /// Run a single task and exit
    Run {
        /// The task utterance (fixed-form or natural language)
        task: Vec<String>,
    },
}

/// Exit codes: 0 success, 1 task failure or user cancel, 2 configuration or
/// device problems.
const EXIT_OK: i32 = 0;
const EXIT_TASK_FAILED: i32 = 1;
const EXIT_ENVIRONMENT: i32 = 2;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "droidpilot=info".into()),
        )
        .init();

    let cli = Cli::parse();
    std::process::exit(run(cli).await);
}

async fn run(cli: Cli) -> i32 {
    // `devices` needs no configuration at all.
    if matches!(cli.command, Some(SubCommand::Devices)) {
        return match device::list_adb_devices() {
            Ok(devices) if devices.is_empty() => {
                println!("no devices connected");
                EXIT_ENVIRONMENT
            }
            Ok(devices) => {
                for serial in devices {
                    println!("{serial}");
                }
                EXIT_OK
            }
            Err(e) => {
                error!("{e}");
                EXIT_ENVIRONMENT
            }
        };
    }

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e}");
            return EXIT_ENVIRONMENT;
        }
    };

    let device = open_device(&config);
    info!(
        "device: {} ({})",
        device.name(),
        if config.debug.mock_device { "mock" } else { "adb" }
    );

    match cli.command {
        Some(SubCommand::Screenshot { output }) => {
            let dev = Arc::clone(&device);
            let shot = tokio::task::spawn_blocking(move || dev.screenshot()).await;
            match shot {
                Ok(Ok(shot)) => {
                    if let Err(e) = std::fs::write(&output, &shot.png) {
                        error!("cannot write {output}: {e}");
                        return EXIT_ENVIRONMENT;
                    }
                    println!(
                        "saved {output} ({}x{}, crop offset {})",
                        shot.width, shot.height, shot.crop_top
                    );
                    EXIT_OK
                }
                Ok(Err(e)) => {
                    error!("screenshot failed: {e}");
                    EXIT_ENVIRONMENT
                }
                Err(e) => {
                    error!("screenshot task failed: {e}");
                    EXIT_ENVIRONMENT
                }
            }
        }
        Some(SubCommand::Modules) => {
            let model = Arc::new(ModelClient::new(
                config.llm.clone(),
                config.classifier.secondary.clone(),
            ));
            let runner = TaskRunner::new(config, device, model);
            let modules = runner.registry().modules();
            if modules.is_empty() {
                println!("no app modules discovered");
                return EXIT_OK;
            }
            for module in modules {
                let assets_ok = apps::validate_app_dir(&module.dir);
                println!(
                    "{:<12} {:<24} {} {}",
                    module.info.name,
                    module.info.package_id,
                    module.info.keywords.join(","),
                    if assets_ok { "" } else { "(no image assets)" }
                );
                if !module.info.description.is_empty() {
                    println!("  {}", module.info.description);
                }
            }
            EXIT_OK
        }
        Some(SubCommand::Run { task }) => {
            let utterance = task.join(" ");
            if utterance.trim().is_empty() {
                error!("empty task; usage: droidpilot run <task>");
                return EXIT_TASK_FAILED;
            }
            let model = Arc::new(ModelClient::new(
                config.llm.clone(),
                config.classifier.secondary.clone(),
            ));
            let runner = TaskRunner::new(config, device, model);

            // Ctrl-C cancels the task; the executor still resets the device
            // to home before returning.
            let ctx = TaskContext::new();
            let cancel = ctx.cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    cancel.cancel();
                }
            });

            let outcome = runner.run_task(&ctx, &utterance).await;
            shell::print_outcome(&outcome);
            if outcome.success {
                EXIT_OK
            } else if outcome.is_environment_failure() {
                EXIT_ENVIRONMENT
            } else {
                EXIT_TASK_FAILED
            }
        }
        Some(SubCommand::Devices) => unreachable!("handled above"),
        None => {
            let model = Arc::new(ModelClient::new(
                config.llm.clone(),
                config.classifier.secondary.clone(),
            ));
            let runner = TaskRunner::new(config, device, model);
            match shell::run_interactive(&runner).await {
                Ok(code) => code,
                Err(e) => {
                    error!("shell error: {e}");
                    EXIT_TASK_FAILED
                }
            }
        }
    }
}
