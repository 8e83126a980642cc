//! edgegate - CI helper for EdgeGate.
//!
//! Exit codes, consumed by pipeline scripts:
//!
//! - 0: run passed
//! - 1: run failed (a required gate failed)
//! - 2: run errored
//! - 3: authentication or configuration problem
//!
//! All requests are signed with the workspace's CI secret using the
//! HMAC-SHA256 scheme the ingress verifies; a fresh random nonce is
//! generated per request.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rand::RngCore;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use edgegate_core::bundle;
use edgegate_core::ciauth;

const EXIT_PASSED: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_ERROR: u8 = 2;
const EXIT_CONFIG: u8 = 3;

/// edgegate - trigger gated runs and verify their evidence
#[derive(Parser, Debug)]
#[command(name = "edgegate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// EdgeGate base URL
    #[arg(long, env = "EDGEGATE_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Workspace id
    #[arg(long, env = "EDGEGATE_WORKSPACE")]
    workspace: Option<String>,

    /// CI secret (prefer --secret-file or EDGEGATE_CI_SECRET)
    #[arg(long, env = "EDGEGATE_CI_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Read the CI secret from a file
    #[arg(long)]
    secret_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Trigger a run and optionally wait for its verdict
    Trigger {
        /// Pipeline name
        #[arg(long)]
        pipeline: String,

        /// Model artifact id to test
        #[arg(long)]
        model_artifact_id: String,

        /// Poll until the run is terminal
        #[arg(long)]
        wait: bool,

        /// Poll interval in seconds while waiting
        #[arg(long, default_value = "5")]
        poll_seconds: u64,
    },

    /// Fetch a run's status; the exit code encodes the verdict
    Status {
        /// Run id
        run_id: String,
    },

    /// Check connectivity and credentials against the ingress
    Ping,

    /// Verify a downloaded evidence bundle offline
    VerifyBundle {
        /// Path to the bundle zip
        bundle: PathBuf,

        /// Hex Ed25519 public key; fetched from the server when omitted
        #[arg(long)]
        public_key: Option<String>,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

fn run(cli: Cli) -> Result<u8> {
    match &cli.command {
        Commands::Trigger {
            pipeline,
            model_artifact_id,
            wait,
            poll_seconds,
        } => trigger(&cli, pipeline, model_artifact_id, *wait, *poll_seconds),
        Commands::Status { run_id } => status(&cli, run_id),
        Commands::Ping => ping(&cli),
        Commands::VerifyBundle { bundle, public_key } => {
            verify_bundle(&cli, bundle, public_key.as_deref())
        }
    }
}

/// Signed request plumbing shared by every authenticated command.
struct Client {
    http: reqwest::blocking::Client,
    base_url: String,
    workspace: String,
    secret: Vec<u8>,
}

impl Client {
    fn from_cli(cli: &Cli) -> Result<Self> {
        let workspace = cli
            .workspace
            .clone()
            .context("missing workspace: pass --workspace or set EDGEGATE_WORKSPACE")?;
        let secret = match (&cli.secret_file, &cli.secret) {
            (Some(path), _) => std::fs::read_to_string(path)
                .with_context(|| format!("reading secret file {}", path.display()))?
                .trim()
                .as_bytes()
                .to_vec(),
            (None, Some(secret)) => secret.as_bytes().to_vec(),
            (None, None) => {
                bail!("missing CI secret: pass --secret-file or set EDGEGATE_CI_SECRET")
            }
        };
        Ok(Self {
            http: reqwest::blocking::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .context("building HTTP client")?,
            base_url: cli.url.trim_end_matches('/').to_string(),
            workspace,
            secret,
        })
    }

    fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Vec<u8>,
    ) -> Result<(reqwest::StatusCode, serde_json::Value)> {
        let timestamp = chrono::Utc::now().to_rfc3339();
        let nonce = fresh_nonce();
        let signature = ciauth::compute_signature(&self.secret, &timestamp, &nonce, &body);

        let response = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .header(ciauth::WORKSPACE_HEADER, &self.workspace)
            .header(ciauth::TIMESTAMP_HEADER, &timestamp)
            .header(ciauth::NONCE_HEADER, &nonce)
            .header(ciauth::SIGNATURE_HEADER, &signature)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .context("request failed")?;

        let status = response.status();
        let json = response
            .json::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null);
        Ok((status, json))
    }
}

fn fresh_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn trigger(
    cli: &Cli,
    pipeline: &str,
    model_artifact_id: &str,
    wait: bool,
    poll_seconds: u64,
) -> Result<u8> {
    let client = Client::from_cli(cli)?;
    let body = serde_json::to_vec(&serde_json::json!({
        "pipeline": pipeline,
        "model_artifact_id": model_artifact_id,
    }))?;

    let (status, json) = client.send(reqwest::Method::POST, "/v1/ci/github/run", body)?;
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::CONFLICT {
        eprintln!("authentication rejected: {json}");
        return Ok(EXIT_CONFIG);
    }
    if status != reqwest::StatusCode::ACCEPTED {
        eprintln!("trigger rejected ({status}): {json}");
        return Ok(EXIT_CONFIG);
    }

    let run_id = json["run_id"]
        .as_str()
        .context("response missing run_id")?
        .to_string();
    println!("{run_id}");

    if !wait {
        return Ok(EXIT_PASSED);
    }
    poll_until_terminal(&client, &run_id, poll_seconds)
}

fn status(cli: &Cli, run_id: &str) -> Result<u8> {
    let client = Client::from_cli(cli)?;
    let (status, json) =
        client.send(reqwest::Method::GET, &format!("/v1/ci/runs/{run_id}"), Vec::new())?;
    if !status.is_success() {
        eprintln!("status fetch failed ({status}): {json}");
        return Ok(EXIT_CONFIG);
    }
    println!("{json}");
    Ok(verdict_exit_code(&json))
}

fn poll_until_terminal(client: &Client, run_id: &str, poll_seconds: u64) -> Result<u8> {
    loop {
        let (status, json) =
            client.send(reqwest::Method::GET, &format!("/v1/ci/runs/{run_id}"), Vec::new())?;
        if !status.is_success() {
            eprintln!("status fetch failed ({status}): {json}");
            return Ok(EXIT_CONFIG);
        }
        match json["state"].as_str() {
            Some("passed" | "failed" | "error") => {
                println!("{json}");
                return Ok(verdict_exit_code(&json));
            }
            Some(state) => {
                tracing::info!(run_id, state, "run in progress");
                std::thread::sleep(Duration::from_secs(poll_seconds.max(1)));
            }
            None => bail!("malformed status response: {json}"),
        }
    }
}

fn verdict_exit_code(json: &serde_json::Value) -> u8 {
    match json["state"].as_str() {
        Some("passed") => EXIT_PASSED,
        Some("failed") => EXIT_FAILED,
        _ => EXIT_ERROR,
    }
}

fn ping(cli: &Cli) -> Result<u8> {
    let client = Client::from_cli(cli)?;
    let (status, json) = client.send(reqwest::Method::GET, "/v1/ci/status", Vec::new())?;
    if status.is_success() {
        println!("{json}");
        Ok(EXIT_PASSED)
    } else {
        eprintln!("ping failed ({status}): {json}");
        Ok(EXIT_CONFIG)
    }
}

fn verify_bundle(cli: &Cli, bundle_path: &PathBuf, public_key: Option<&str>) -> Result<u8> {
    let zip = std::fs::read(bundle_path)
        .with_context(|| format!("reading bundle {}", bundle_path.display()))?;

    // Pull the key id out of the (unverified) summary first, then resolve
    // the public key and verify properly.
    let key_hex = match public_key {
        Some(hex) => hex.to_string(),
        None => {
            let entries = bundle::read_zip(&zip).context("bundle is not a valid archive")?;
            let (_, summary_bytes) = entries
                .iter()
                .find(|(name, _)| name == bundle::SUMMARY_NAME)
                .context("bundle has no summary.json")?;
            let summary: serde_json::Value = serde_json::from_slice(summary_bytes)?;
            let key_id = summary["signing"]["public_key_id"]
                .as_str()
                .context("summary names no signing key")?;

            let url = format!("{}/v1/signing-keys/{key_id}", cli.url.trim_end_matches('/'));
            let response: serde_json::Value = reqwest::blocking::get(&url)
                .with_context(|| format!("fetching {url}"))?
                .json()?;
            response["public_key"]
                .as_str()
                .context("signing-key response missing public_key")?
                .to_string()
        }
    };

    match bundle::verify_bundle(&zip, &key_hex) {
        Ok(summary) => {
            println!(
                "bundle verified: run {} {} (signed with {})",
                summary.run_id, summary.results.status, summary.signing.public_key_id
            );
            Ok(match summary.results.status.as_str() {
                "passed" => EXIT_PASSED,
                "failed" => EXIT_FAILED,
                _ => EXIT_ERROR,
            })
        }
        Err(e) => {
            eprintln!("bundle verification failed: {e}");
            Ok(EXIT_ERROR)
        }
    }
}
