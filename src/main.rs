use anyhow::Result;

use modelprobe::config::Config;
use modelprobe::events::ProbeEvent;
use modelprobe::orchestrator::TestOrchestrator;
use modelprobe::remote;
use modelprobe::transport::HttpTransport;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    tracing::info!("ModelProbe starting");
    tracing::info!(endpoint = %config.endpoint, stream = config.stream, "probe target");

    let transport = HttpTransport::new()?;

    if config.quota {
        match remote::fetch_quota(transport.client(), &config.endpoint, &config.api_key).await {
            Ok(quota) => {
                let remaining = quota
                    .remaining_usd()
                    .map(|r| format!("{:.2}", r))
                    .unwrap_or_else(|| "n/a".to_string());
                tracing::info!(
                    used_usd = %format!("{:.2}", quota.used_usd),
                    remaining_usd = %remaining,
                    "billing quota"
                );
            }
            Err(e) => tracing::warn!("quota lookup failed: {}", e),
        }
    }

    let models = if config.models.is_empty() {
        tracing::info!("no models given, discovering via /v1/models");
        remote::fetch_model_list(transport.client(), &config.endpoint, &config.api_key).await?
    } else {
        config.models.clone()
    };
    if models.is_empty() {
        anyhow::bail!("no models to probe");
    }
    tracing::info!(count = models.len(), "probing models");

    let orchestrator = TestOrchestrator::new(transport);
    orchestrator.events().subscribe(|event| match event {
        ProbeEvent::Valid(o) | ProbeEvent::StreamValid(o) => {
            tracing::info!(
                model = %o.model,
                response_time_ms = o.response_time_ms,
                tokens_per_second = o.tokens_per_second,
                "valid"
            );
        }
        ProbeEvent::Inconsistent(o) => {
            tracing::warn!(model = %o.model, returned = %o.returned_model, "inconsistent");
        }
        ProbeEvent::Invalid(o) | ProbeEvent::StreamInvalid(o) => {
            tracing::error!(model = %o.model, "{}", o.message);
        }
        ProbeEvent::StreamEmpty(o) => {
            tracing::warn!(model = %o.model, "{}", o.warning);
        }
        ProbeEvent::Error { model, message } => {
            tracing::error!(model = %model, "{}", message);
        }
        _ => {}
    });

    let report = orchestrator.run(&models, &config.to_probe_config()).await;
    report.print_summary();

    Ok(())
}
