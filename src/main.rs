use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use jobrelay::config::{parse_worker_list, CoordinatorConfig, SandboxConfig, WorkerConfig};
use jobrelay::grpc::client::connect_coordinator;
use jobrelay::grpc::{health_state_label, job_state_label};
use jobrelay::node::{CoordinatorNode, WorkerNode};
use jobrelay::proto::coordinator_service_client::CoordinatorServiceClient;
use jobrelay::proto::{GetJobStatusRequest, ListWorkersRequest, SubmitJobRequest};
use jobrelay::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "jobrelay")]
#[command(version)]
#[command(about = "Dispatch containerized jobs from a coordinator to a pool of workers")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the coordinator
    Coordinator(CoordinatorArgs),

    /// Start a worker node
    Worker(WorkerArgs),

    /// Job management commands
    Job {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: JobCommands,
    },

    /// List the workers known to the coordinator
    Workers {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CoordinatorArgs {
    /// TOML file with coordinator settings and a [[workers]] list
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to serve the coordinator API on
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Address for the HTTP dashboard (optional)
    #[arg(long)]
    dashboard: Option<SocketAddr>,

    /// Static workers (comma-separated, format: "id=host:port")
    /// Example: "w1=127.0.0.1:7101,w2=127.0.0.1:7102"
    #[arg(long)]
    workers: Option<String>,

    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Milliseconds without a heartbeat before a worker is unhealthy
    #[arg(long)]
    worker_timeout_ms: Option<u64>,

    #[arg(long)]
    health_check_interval_ms: Option<u64>,

    #[arg(long)]
    dispatch_timeout_ms: Option<u64>,

    /// Milliseconds a worker may stay unhealthy before it is removed
    #[arg(long)]
    removal_grace_ms: Option<u64>,

    /// Directory for terminal status records
    #[arg(long)]
    status_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Worker ID (unique within the pool)
    #[arg(long)]
    id: String,

    /// Address to serve the dispatch protocol on
    #[arg(long, default_value = "127.0.0.1:7100")]
    listen: SocketAddr,

    /// Address the coordinator should dial (defaults to the listen address)
    #[arg(long)]
    advertise: Option<String>,

    #[arg(long, default_value = "http://127.0.0.1:7000")]
    coordinator: String,

    #[arg(long, default_value = "1000")]
    heartbeat_interval_ms: u64,

    #[arg(long, default_value = "30000")]
    fetch_timeout_ms: u64,

    /// Allow job containers network access
    #[arg(long)]
    allow_network: bool,

    /// Container memory limit (e.g. "512m")
    #[arg(long, default_value = "512m")]
    memory: String,

    /// Container CPU limit (e.g. "1.0")
    #[arg(long, default_value = "1.0")]
    cpus: String,

    /// Keep job images after they have run
    #[arg(long)]
    keep_images: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Coordinator address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:7000")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum JobCommands {
    /// Submit a job
    Submit {
        /// Recipe URL, or a JSON task document with a "recipe_url" field
        task: String,

        /// Explicit job ID (generated when omitted)
        #[arg(long)]
        id: Option<String>,
    },
    /// Get status of a specific job
    Status { job_id: String },
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct JobSubmitOutput {
    job_id: String,
    submitted_at_ms: i64,
}

#[derive(Serialize)]
struct JobStatusOutput {
    job_id: String,
    state: String,
    task: String,
    assigned_worker: String,
    retry_count: u32,
    error: String,
    submitted_at_ms: i64,
    scheduled_at_ms: Option<i64>,
    completed_at_ms: Option<i64>,
}

#[derive(Serialize)]
struct WorkerOutput {
    worker_id: String,
    address: String,
    health: String,
    busy: bool,
    assigned_job: String,
    last_heartbeat_ms_ago: u64,
}

// =============================================================================
// Server Implementation
// =============================================================================

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn coordinator_config(args: CoordinatorArgs) -> Result<CoordinatorConfig, Box<dyn std::error::Error>> {
    let mut config = match &args.config {
        Some(path) => CoordinatorConfig::from_file(path)?,
        None => CoordinatorConfig::default(),
    };

    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if args.dashboard.is_some() {
        config.dashboard_addr = args.dashboard;
    }
    if let Some(raw) = &args.workers {
        config.workers.extend(parse_worker_list(raw)?);
    }
    if let Some(v) = args.queue_capacity {
        config.queue_capacity = v;
    }
    if let Some(v) = args.worker_timeout_ms {
        config.worker_timeout_ms = v;
    }
    if let Some(v) = args.health_check_interval_ms {
        config.health_check_interval_ms = v;
    }
    if let Some(v) = args.dispatch_timeout_ms {
        config.dispatch_timeout_ms = v;
    }
    if let Some(v) = args.removal_grace_ms {
        config.removal_grace_ms = v;
    }
    if let Some(dir) = args.status_dir {
        config.status_dir = dir;
    }

    config.validate()?;
    Ok(config)
}

async fn run_coordinator(args: CoordinatorArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = coordinator_config(args)?;
    tracing::info!(
        listen_addr = %config.listen_addr,
        dashboard_addr = ?config.dashboard_addr,
        workers = ?config.workers.iter().map(|w| format!("{}={}", w.id, w.address)).collect::<Vec<_>>(),
        queue_capacity = config.queue_capacity,
        "Starting jobrelay coordinator"
    );

    let shutdown = install_shutdown_handler()?;
    let node = CoordinatorNode::new(config).await?;
    node.run(shutdown).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = WorkerConfig {
        advertise_addr: args.advertise,
        coordinator_url: args.coordinator,
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        fetch_timeout_ms: args.fetch_timeout_ms,
        sandbox: SandboxConfig {
            network_disabled: !args.allow_network,
            memory_limit: Some(args.memory),
            cpu_limit: Some(args.cpus),
            remove_image: !args.keep_images,
        },
        ..WorkerConfig::new(args.id, args.listen)
    };
    config.validate()?;

    tracing::info!(
        worker_id = %config.worker_id,
        listen_addr = %config.listen_addr,
        coordinator = %config.coordinator_url,
        "Starting jobrelay worker"
    );

    let shutdown = install_shutdown_handler()?;
    let node = WorkerNode::new(config).await?;
    node.run(shutdown).await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_job_submit(
    client: &mut CoordinatorServiceClient<Channel>,
    task: String,
    id: Option<String>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = match client
        .submit_job(SubmitJobRequest {
            job_id: id.unwrap_or_default(),
            task_payload: task,
        })
        .await
    {
        Ok(response) => response.into_inner(),
        Err(status) => {
            eprintln!("Error: Job submission failed: {}", status.message());
            std::process::exit(1);
        }
    };

    match output_format {
        OutputFormat::Json => {
            let output = JobSubmitOutput {
                job_id: response.job_id,
                submitted_at_ms: response.submitted_at_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job submitted successfully!");
            println!("Job ID: {}", response.job_id);
        }
    }
    Ok(())
}

async fn handle_job_status(
    client: &mut CoordinatorServiceClient<Channel>,
    job_id: String,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .get_job_status(GetJobStatusRequest { job_id })
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output = JobStatusOutput {
                state: job_state_label(response.state).to_string(),
                job_id: response.job_id,
                task: response.task_payload,
                assigned_worker: response.assigned_worker,
                retry_count: response.retry_count,
                error: response.error,
                submitted_at_ms: response.submitted_at_ms,
                scheduled_at_ms: response.scheduled_at_ms,
                completed_at_ms: response.completed_at_ms,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Job ID:          {}", response.job_id);
            println!("State:           {}", job_state_label(response.state));
            println!("Task:            {}", response.task_payload);
            if !response.assigned_worker.is_empty() {
                println!("Assigned Worker: {}", response.assigned_worker);
            }
            if response.retry_count > 0 {
                println!("Retries:         {}", response.retry_count);
            }
            if !response.error.is_empty() {
                println!("Error:");
                for line in response.error.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

async fn handle_workers(
    client: &mut CoordinatorServiceClient<Channel>,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client
        .list_workers(ListWorkersRequest {})
        .await?
        .into_inner();

    match output_format {
        OutputFormat::Json => {
            let output: Vec<WorkerOutput> = response
                .workers
                .into_iter()
                .map(|w| WorkerOutput {
                    health: health_state_label(w.health).to_string(),
                    worker_id: w.worker_id,
                    address: w.address,
                    busy: w.busy,
                    assigned_job: w.assigned_job,
                    last_heartbeat_ms_ago: w.last_heartbeat_ms_ago,
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            if response.workers.is_empty() {
                println!("No workers registered.");
                return Ok(());
            }
            println!(
                "{:<16} {:<22} {:<10} {:<38} LAST SEEN",
                "WORKER", "ADDRESS", "HEALTH", "JOB"
            );
            println!("{}", "-".repeat(100));
            for w in response.workers {
                let job = if w.assigned_job.is_empty() {
                    "-".to_string()
                } else {
                    w.assigned_job
                };
                println!(
                    "{:<16} {:<22} {:<10} {:<38} {}ms ago",
                    w.worker_id,
                    w.address,
                    health_state_label(w.health),
                    job,
                    w.last_heartbeat_ms_ago
                );
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Coordinator(coordinator_args) => {
            run_coordinator(coordinator_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Job { client, command } => {
            let mut grpc_client = connect_coordinator(&client.addr).await?;
            match command {
                JobCommands::Submit { task, id } => {
                    handle_job_submit(&mut grpc_client, task, id, &client.output).await?;
                }
                JobCommands::Status { job_id } => {
                    handle_job_status(&mut grpc_client, job_id, &client.output).await?;
                }
            }
        }
        Commands::Workers { client } => {
            let mut grpc_client = connect_coordinator(&client.addr).await?;
            handle_workers(&mut grpc_client, &client.output).await?;
        }
    }

    Ok(())
}
