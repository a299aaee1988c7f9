use clap::{Parser, Subcommand};
use switchboard::service;
use switchboard_core::config;
use switchboard_llm::LlmService;

#[derive(Parser)]
#[command(
    name = "switchboard",
    version,
    about = "Multi-channel conversational agent host"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to config file.
    #[arg(short, long, default_value = "config.yaml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the host.
    Start,
    /// Check configuration and LLM backend availability.
    Status,
    /// Send a one-shot message to the agent.
    Ask {
        /// The message to send.
        #[arg(trailing_var_arg = true)]
        message: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    match cli.command {
        Commands::Start => {
            let cfg = config::load(&cli.config)?;
            service::run(cfg).await?;
        }
        Commands::Status => {
            let cfg = config::load(&cli.config)?;
            println!("switchboard — status check\n");
            println!("Config: {}", cli.config);
            println!("Persona: {}", cfg.persona.name);

            let llm = LlmService::from_config(&cfg.llm)?;
            let available = llm.is_available().await;
            println!(
                "Backend {}: {}",
                llm.backend_name(),
                if available { "available" } else { "not available" }
            );

            let enabled: Vec<&str> = cfg
                .channels
                .iter()
                .filter(|(_, c)| c.enabled)
                .map(|(id, _)| id.as_str())
                .collect();
            println!("Channels: {}", enabled.join(", "));
        }
        Commands::Ask { message } => {
            if message.is_empty() {
                anyhow::bail!("no message provided. Usage: switchboard ask <message>");
            }
            let prompt = message.join(" ");
            let cfg = config::load(&cli.config)?;
            let llm = LlmService::from_config(&cfg.llm)?;
            if !llm.is_available().await {
                anyhow::bail!("backend '{}' is not available", llm.backend_name());
            }
            let response = llm.complete(&cfg.persona.system_prompt, &prompt).await?;
            println!("{response}");
        }
    }

    Ok(())
}
