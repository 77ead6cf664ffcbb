use anyhow::{Context, Result};
use clap::Parser;

use crate::orchestrator::ProbeConfig;

/// ModelProbe - OpenAI-compatible endpoint validation and benchmarking
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct CliArgs {
    /// Endpoint base URL, e.g. https://api.openai.com
    #[arg(short = 'u', long, env = "PROBE_ENDPOINT")]
    pub endpoint: Option<String>,

    /// API key sent as a Bearer token
    #[arg(short = 'k', long, env = "PROBE_API_KEY")]
    pub api_key: Option<String>,

    /// Comma-separated model ids; fetched from /v1/models when omitted
    #[arg(short = 'm', long, env = "PROBE_MODELS")]
    pub models: Option<String>,

    /// Prompt sent to every model
    #[arg(
        long,
        env = "PROBE_PROMPT",
        default_value = "Tell me a joke in exactly ten words"
    )]
    pub prompt: String,

    /// Base request timeout in seconds, scaled up for slow model families
    #[arg(short = 't', long, env = "PROBE_TIMEOUT", default_value = "30")]
    pub timeout: u64,

    /// Probes run at once; further models wait for the current group
    #[arg(short = 'c', long, env = "PROBE_CONCURRENCY", default_value = "5")]
    pub concurrency: usize,

    /// Probe via streaming responses instead of complete bodies
    #[arg(short = 's', long, env = "PROBE_STREAM")]
    pub stream: bool,

    /// Also query billing quota before probing
    #[arg(long, env = "PROBE_QUOTA")]
    pub quota: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub endpoint: String,
    pub api_key: String,
    /// Empty means discover via the models endpoint
    pub models: Vec<String>,
    pub prompt: String,
    pub timeout_secs: u64,
    pub concurrency: usize,
    pub stream: bool,
    pub quota: bool,
    pub log_level: String,
}

impl Config {
    /// Load configuration with priority: CLI > ENV > defaults.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let config = Config {
            endpoint: args
                .endpoint
                .context("endpoint is required (use -u or set PROBE_ENDPOINT)")?,
            api_key: args
                .api_key
                .context("API key is required (use -k or set PROBE_API_KEY)")?,
            models: args
                .models
                .map(|list| parse_model_list(&list))
                .unwrap_or_default(),
            prompt: args.prompt,
            timeout_secs: args.timeout,
            concurrency: args.concurrency,
            stream: args.stream,
            quota: args.quota,
            log_level: args.log_level,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.endpoint.starts_with("http://") && !self.endpoint.starts_with("https://") {
            anyhow::bail!("endpoint must start with http:// or https://");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("timeout must be at least 1 second");
        }
        if self.concurrency == 0 {
            anyhow::bail!("concurrency must be at least 1");
        }
        Ok(())
    }

    pub fn to_probe_config(&self) -> ProbeConfig {
        ProbeConfig {
            endpoint: self.endpoint.clone(),
            api_key: self.api_key.clone(),
            prompt: self.prompt.clone(),
            base_timeout_ms: self.timeout_secs * 1000,
            concurrency: self.concurrency,
            stream: self.stream,
        }
    }
}

fn parse_model_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect()
}
