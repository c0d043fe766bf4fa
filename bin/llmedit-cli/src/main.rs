//! llmedit – command-line entry point.
//!
//! Startup order:
//! 1. Parse arguments and load configuration (file plus environment).
//! 2. Initialise structured tracing.
//! 3. Build settings, prompt catalog and generation pipeline.
//! 4. Run the requested operation through the task service and print it.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use llmedit_core::prompt::supported_translation_languages;
use llmedit_core::{
    Config, GenerationPipeline, InMemorySettings, ProcessingContext, PromptCategory, Provider,
    StandardSessionFactory, TaskService, into_task,
};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[command(name = "llmedit", version, about = "Proofread, reformat and translate text with a local LLM")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, short, env = "LLMEDIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a prompt over text from `--text` or stdin.
    Run {
        /// Prompt id, e.g. `prompt_proofread_base`.
        #[arg(long, short)]
        prompt: String,
        #[arg(long, short)]
        text: Option<String>,
        /// Extra template parameters as `name=value`.
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// Translate text between two supported languages.
    Translate {
        #[arg(long, short)]
        text: Option<String>,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        /// Word-level dictionary output instead of a plain translation.
        #[arg(long)]
        dictionary: bool,
        #[command(flatten)]
        model: ModelArgs,
    },
    /// List prompts, optionally for one category.
    Prompts {
        #[arg(long)]
        category: Option<PromptCategory>,
    },
    /// List supported translation languages.
    Languages,
    /// List registered models and whether their weights are present.
    Models,
}

#[derive(Debug, clap::Args)]
struct ModelArgs {
    #[arg(long)]
    provider: Option<Provider>,
    #[arg(long)]
    model: Option<String>,
    /// Override the model's default temperature.
    #[arg(long)]
    temperature: Option<f64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::from_env(),
    };

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    init_tracing(&config);
    debug!(version = env!("CARGO_PKG_VERSION"), "llmedit starting");

    // ── 3. Dispatch ────────────────────────────────────────────────────────────
    match cli.command {
        Command::Run {
            prompt,
            text,
            params,
            model,
        } => {
            let text = read_text(text).await?;
            let ctx = params
                .into_iter()
                .fold(ProcessingContext::for_text(prompt, text), |ctx, (k, v)| {
                    ctx.with_parameter(k, v)
                });
            let output = execute(&config, &model, ctx).await?;
            println!("{output}");
        }
        Command::Translate {
            text,
            from,
            to,
            dictionary,
            model,
        } => {
            let text = read_text(text).await?;
            let from = from.unwrap_or_else(|| config.llm.source_language.clone());
            let to = to.unwrap_or_else(|| config.llm.target_language.clone());
            for language in [&from, &to] {
                if !supported_translation_languages().contains(&language.as_str()) {
                    bail!("unsupported language '{language}'; see `llmedit languages`");
                }
            }
            let prompt_id = if dictionary {
                "prompt_translate_dictionary"
            } else {
                "prompt_translate_base"
            };
            let ctx = ProcessingContext::for_translation(prompt_id, text, from, to);
            let output = execute(&config, &model, ctx).await?;
            println!("{output}");
        }
        Command::Prompts { category } => {
            let catalog = config.catalog()?;
            let prompts = match category {
                Some(category) => catalog.by_category(category),
                None => catalog.iter().collect(),
            };
            for prompt in prompts {
                println!("{:<44} {:<10} {}", prompt.id, prompt.category, prompt.name);
            }
        }
        Command::Languages => {
            for language in supported_translation_languages() {
                println!("{language}");
            }
        }
        Command::Models => {
            let registry = config.registry();
            let available = registry.available_local(&config.paths.models_dir);
            for model in registry.iter() {
                let status = match model.provider {
                    Provider::Ollama => "remote",
                    Provider::LlamaCpp if available.contains(&model) => "available",
                    Provider::LlamaCpp => "missing",
                };
                println!("{:<10} {:<24} {:<10} {}", model.provider, model.name, status, model.file_name);
            }
        }
    }

    Ok(())
}

/// Run one request through the task service and wait for its callback.
async fn execute(config: &Config, args: &ModelArgs, ctx: ProcessingContext) -> anyhow::Result<String> {
    let settings = Arc::new(InMemorySettings::new(config.settings_state()));
    if let Some(provider) = args.provider {
        settings.set_provider(provider);
    }
    if let Some(model) = &args.model {
        settings.set_model_name(Some(model.clone()));
    }
    if let Some(temperature) = args.temperature {
        settings.set_temperature(temperature);
        settings.set_temperature_enabled(true);
    }

    let catalog = Arc::new(config.catalog()?);
    let factory = StandardSessionFactory::from_config(config);
    let pipeline = Arc::new(GenerationPipeline::new(catalog, settings, factory));

    let service = TaskService::start(config.task_service_config());
    service.subscribe_busy_state_changed(|busy| debug!(busy, "task service busy state"));

    let (reply_tx, reply_rx) = oneshot::channel();
    let task = into_task(Arc::clone(&pipeline), "cli", ctx).on_finished(move |result| {
        let _ = reply_tx.send(result.clone());
    });
    service.submit(task).await?;
    info!(task_id = "cli", "request submitted");

    let result = tokio::select! {
        result = reply_rx => result.context("task service dropped the request")?,
        _ = tokio::signal::ctrl_c() => {
            warn!("interrupted; waiting for the current request to stop");
            service.cancel("cli").await;
            bail!("interrupted");
        }
    };

    // Sessions may own blocking HTTP clients or model weights; tear them down
    // off the async executor.
    tokio::task::spawn_blocking(move || {
        pipeline.unload();
        drop(pipeline);
    })
    .await?;

    if result.has_error {
        bail!("{}", result.error_message);
    }
    Ok(result.content.unwrap_or_default())
}

async fn read_text(text: Option<String>) -> anyhow::Result<String> {
    match text {
        Some(text) => Ok(text),
        None => tokio::task::spawn_blocking(|| {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read text from stdin")?;
            Ok::<_, anyhow::Error>(buf)
        })
        .await?,
    }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(name, value)| (name.trim().to_owned(), value.to_owned()))
        .filter(|(name, _)| !name.is_empty())
        .ok_or_else(|| format!("expected name=value, got '{raw}'"))
}

fn init_tracing(config: &Config) {
    // Build the log-level filter, warning loudly if the configured value is
    // not a valid tracing filter expression.
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match config.log.level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: LLMEDIT_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    config.log.level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_writer(std::io::stderr);

    if config.log.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_split_on_first_equals() {
        assert_eq!(
            parse_param("user_text=a=b").unwrap(),
            ("user_text".to_owned(), "a=b".to_owned())
        );
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=x").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }

    #[test]
    fn provider_flag_parses() {
        let cli = Cli::try_parse_from([
            "llmedit", "run", "-p", "prompt_proofread_base", "-t", "x", "--provider", "ollama",
            "--model", "llama3", "--param", "tone=dry",
        ])
        .unwrap();
        match cli.command {
            Command::Run { model, params, .. } => {
                assert_eq!(model.provider, Some(Provider::Ollama));
                assert_eq!(model.model.as_deref(), Some("llama3"));
                assert_eq!(params, vec![("tone".to_owned(), "dry".to_owned())]);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
