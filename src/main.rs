use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use quota_guard::health::HealthChecker;
use quota_guard::{ApiRequest, BucketKey, Config, Error, ResilientExecutor};
use reqwest::Method;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "quota-guard")]
#[command(about = "Rate-budgeted, retrying calls against a rate-limited HTTP API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Perform one call through the rate budget and print the response
    Call {
        method: String,
        url: String,

        /// JSON request body
        #[arg(short, long)]
        data: Option<String>,

        /// Extra header as NAME:VALUE, repeatable
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        #[arg(long, default_value_t = 3)]
        max_retries: u32,

        /// Overall deadline in seconds, backoff included
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Show the bucket a URL is accounted against
    Bucket { url: String },
    /// Forget what was learned for a URL's bucket
    Reset { url: String },
    /// Check the bucket store
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();

    let config = Config::from_env().context("Failed to load configuration")?;

    // Logs go to stderr so command output stays parseable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("quota_guard={}", config.log_level).into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::debug!(
        api_host = %config.api_host,
        shared_store = config.shared_store_endpoint.is_some(),
        "Configuration loaded"
    );

    let executor = ResilientExecutor::from_config(&config)
        .await
        .context("Failed to initialize executor")?;

    match cli.command {
        Commands::Call {
            method,
            url,
            data,
            headers,
            max_retries,
            timeout,
        } => {
            let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                .map_err(|_| anyhow!("invalid HTTP method '{}'", method))?;
            let mut request = ApiRequest::new(method, url).max_retries(max_retries);
            for header in headers {
                let (name, value) = header
                    .split_once(':')
                    .ok_or_else(|| anyhow!("header '{}' is not NAME:VALUE", header))?;
                request = request.header(name.trim(), value.trim());
            }
            if let Some(data) = data {
                let body = serde_json::from_str(&data).context("request body is not valid JSON")?;
                request = request.json(body);
            }
            if let Some(secs) = timeout {
                request = request.timeout(Duration::from_secs(secs));
            }

            match executor.execute(request).await {
                Ok(response) => {
                    println!("{}", response.status_code);
                    println!("{}", response.body);
                }
                Err(Error::Client { status, response }) => {
                    eprintln!("Error: API returned status {}", status);
                    println!("{}", response.body);
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Commands::Bucket { url } => match executor.classifier().classify(&url) {
            BucketKey::Throttled(key) => {
                let bucket = executor.store().get_or_init(&key).await?;
                println!("{}", serde_json::to_string_pretty(&bucket)?);
            }
            BucketKey::Unthrottled => println!("{} is not rate limited", url),
        },
        Commands::Reset { url } => match executor.classifier().classify(&url) {
            BucketKey::Throttled(key) => {
                executor.store().reset(&key).await?;
                println!("Reset bucket {}", key);
            }
            BucketKey::Unthrottled => bail!("{} is not rate limited", url),
        },
        Commands::Health => {
            let health = HealthChecker::new(executor.store().clone()).check_health().await;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
    }

    Ok(())
}
