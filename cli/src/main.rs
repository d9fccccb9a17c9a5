use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, Table};
use common::{
    AdvancedOptions, CancelResponse, ConfigResponse, ErrorBody, JobSnapshot, JobSummary,
    MessageResponse, StartScanRequest, StartScanResponse, ToolSelection,
};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about = "Client for the scanhive scan daemon", long_about = None)]
struct Cli {
    /// Daemon base URL
    #[arg(long, env = "SCANHIVE_SERVER", default_value = "http://127.0.0.1:5050")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a scan against one or more targets
    Start {
        /// Targets to scan (hosts, IPs, or domains)
        targets: Vec<String>,
        /// Tool ids to run, repeatable
        #[arg(short, long)]
        tool: Vec<String>,
        /// Scan profile id, used when no tools are given
        #[arg(short, long)]
        profile: Option<String>,
        /// Human-readable name for the job
        #[arg(short, long)]
        name: Option<String>,
        /// Per-tool timeout override in seconds
        #[arg(long)]
        tool_timeout: Option<u64>,
        /// Whole-job timeout in seconds
        #[arg(long)]
        job_timeout: Option<u64>,
        /// Stay attached and stream logs until the job finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// Show the status of a job
    Status {
        id: String,
        /// Keep polling and streaming new log lines
        #[arg(short, long)]
        follow: bool,
    },
    /// Request cancellation of a running job
    Cancel { id: String },
    /// List all jobs, newest first
    List,
    /// Show the available tools and profiles
    Config,
    /// Delete a finished job and its data
    Delete { id: String },
    /// Download a job's results archive
    Download {
        id: String,
        /// Directory to write the archive into
        #[arg(short, long, default_value = ".")]
        output: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let client = reqwest::Client::new();
    let server = cli.server.trim_end_matches('/').to_string();

    match cli.command {
        Commands::Start {
            targets,
            tool,
            profile,
            name,
            tool_timeout,
            job_timeout,
            follow,
        } => {
            if targets.is_empty() {
                bail!("At least one target is required");
            }
            let req = StartScanRequest {
                targets,
                tools: tool
                    .into_iter()
                    .map(|id| ToolSelection {
                        id,
                        cli_params: BTreeMap::new(),
                        additional_args: String::new(),
                    })
                    .collect(),
                profile_id: profile,
                scan_name: name,
                advanced_options: AdvancedOptions {
                    tool_timeout,
                    job_timeout,
                },
            };
            let response = client
                .post(format!("{}/api/scan/start", server))
                .json(&req)
                .send()
                .await?;
            let started: StartScanResponse = decode(response).await?;
            println!("{}", started.message);
            if follow {
                follow_job(&client, &server, started.job_id.as_str()).await?;
            } else {
                println!("Follow with: scanhive status {} --follow", started.job_id);
            }
        }
        Commands::Status { id, follow } => {
            if follow {
                follow_job(&client, &server, &id).await?;
            } else {
                let snapshot = fetch_status(&client, &server, &id, 0).await?;
                print_snapshot(&snapshot);
            }
        }
        Commands::Cancel { id } => {
            let response = client
                .post(format!("{}/api/scan/cancel/{}", server, id))
                .send()
                .await?;
            let cancelled: CancelResponse = decode(response).await?;
            println!("{} (status: {})", cancelled.message, cancelled.status);
        }
        Commands::List => {
            let response = client.get(format!("{}/api/jobs", server)).send().await?;
            let jobs: Vec<JobSummary> = decode(response).await?;
            if jobs.is_empty() {
                println!("No jobs.");
                return Ok(());
            }
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(["ID", "Name", "Status", "Progress", "Targets", "Started"]);
            for job in jobs {
                table.add_row([
                    Cell::new(job.id.as_str()),
                    Cell::new(&job.name),
                    Cell::new(job.status),
                    Cell::new(format!("{}%", job.overall_progress)),
                    Cell::new(job.targets.join(", ")),
                    Cell::new(job.timestamp.format("%Y-%m-%d %H:%M:%S")),
                ]);
            }
            println!("{}", table);
        }
        Commands::Config => {
            let response = client.get(format!("{}/api/config", server)).send().await?;
            let config: ConfigResponse = decode(response).await?;
            let mut table = Table::new();
            table.load_preset(UTF8_FULL);
            table.set_header(["Tool", "Phase", "Description"]);
            for tool in config.tools.values() {
                table.add_row([&tool.id, &tool.phase, &tool.description]);
            }
            println!("{}", table);
            let profiles: Vec<&str> = config.profiles.keys().map(String::as_str).collect();
            println!("Profiles: {}", profiles.join(", "));
        }
        Commands::Delete { id } => {
            let response = client
                .delete(format!("{}/api/scan/delete/{}", server, id))
                .send()
                .await?;
            let deleted: MessageResponse = decode(response).await?;
            println!("{}", deleted.message);
        }
        Commands::Download { id, output } => {
            let response = client
                .get(format!("{}/api/results/download/{}", server, id))
                .send()
                .await?;
            if !response.status().is_success() {
                bail!(error_message(response).await);
            }
            let bytes = response.bytes().await?;
            let path = std::path::Path::new(&output).join(format!("{}_results.zip", id));
            std::fs::write(&path, &bytes)
                .with_context(|| format!("Failed to write {:?}", path))?;
            println!("Saved {} bytes to {}", bytes.len(), path.display());
        }
    }

    Ok(())
}

async fn fetch_status(
    client: &reqwest::Client,
    server: &str,
    id: &str,
    log_offset: usize,
) -> anyhow::Result<JobSnapshot> {
    let response = client
        .get(format!(
            "{}/api/scan/status/{}?log_offset={}",
            server, id, log_offset
        ))
        .send()
        .await?;
    decode(response).await
}

/// Poll the status endpoint, printing only log entries not seen yet.
async fn follow_job(client: &reqwest::Client, server: &str, id: &str) -> anyhow::Result<()> {
    let mut offset = 0;
    loop {
        let snapshot = fetch_status(client, server, id, offset).await?;
        for entry in &snapshot.logs {
            println!(
                "[{}][{:>7}] {}",
                entry.timestamp.format("%H:%M:%S"),
                format!("{:?}", entry.level).to_lowercase(),
                entry.message
            );
        }
        offset += snapshot.logs.len();

        if snapshot.status.is_terminal() {
            println!(
                "Job {} finished: {} ({}%)",
                id, snapshot.status, snapshot.overall_progress
            );
            if snapshot.zip_path.is_some() {
                println!("Results: scanhive download {}", id);
            }
            return Ok(());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

fn print_snapshot(snapshot: &JobSnapshot) {
    println!("Job:      {}", snapshot.job_id);
    println!("Name:     {}", snapshot.name);
    println!("Status:   {}", snapshot.status);
    println!("Progress: {}%", snapshot.overall_progress);
    println!("Targets:  {}", snapshot.targets.join(", "));
    if let Some(err) = &snapshot.error_message {
        println!("Error:    {}", err);
    }
    if !snapshot.tool_progress.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_header(["Unit", "Status", "Output"]);
        for (key, unit) in &snapshot.tool_progress {
            table.add_row([
                Cell::new(key),
                Cell::new(format!("{:?}", unit.status).to_lowercase()),
                Cell::new(unit.output_file.as_deref().unwrap_or("-")),
            ]);
        }
        println!("{}", table);
    }
    if snapshot.zip_path.is_some() {
        println!("Results archive available: scanhive download {}", snapshot.job_id);
    }
}

async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> anyhow::Result<T> {
    if !response.status().is_success() {
        bail!(error_message(response).await);
    }
    Ok(response.json().await?)
}

async fn error_message(response: reqwest::Response) -> String {
    let status = response.status();
    match response.json::<ErrorBody>().await {
        Ok(body) => body.error,
        Err(_) => format!("Request failed with status {}", status),
    }
}
