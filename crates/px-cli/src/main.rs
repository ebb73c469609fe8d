#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod client;
mod commands;

use clap::{Parser, Subcommand};

use client::{ApiClient, CliError};

/// phoenix CLI -- drive the observability cost-optimization control plane.
#[derive(Parser)]
#[command(name = "px", version, about)]
struct Cli {
    /// Base URL of the Phoenix API.
    #[arg(short = 'u', long, global = true, env = "PHOENIX_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// A/B experiments over pipeline configurations.
    Experiment {
        #[command(subcommand)]
        command: ExperimentCommands,
    },
    /// Versioned pipeline deployments.
    Deployment {
        #[command(subcommand)]
        command: DeploymentCommands,
    },
    /// Pipeline templates, validation, and rendering.
    Pipeline {
        #[command(subcommand)]
        command: PipelineCommands,
    },
    /// Registered agents.
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Obtain and cache an operator token.
    Login {
        #[arg(short = 'U', long)]
        username: String,
        #[arg(short = 'p', long)]
        password: String,
    },
    /// Revoke the cached token.
    Logout,
}

#[derive(Subcommand)]
enum ExperimentCommands {
    /// Create an experiment.
    Create {
        /// Experiment name.
        name: String,
        /// Baseline pipeline template.
        #[arg(short = 'b', long)]
        baseline: String,
        /// Candidate pipeline template.
        #[arg(short = 'c', long)]
        candidate: String,
        /// Target host id (repeatable).
        #[arg(short = 'H', long = "host")]
        hosts: Vec<String>,
        /// Capability selector, cap:<name> (repeatable).
        #[arg(short = 's', long = "selector")]
        selectors: Vec<String>,
        /// Experiment duration in seconds.
        #[arg(short = 'd', long, default_value_t = 3600)]
        duration_secs: u64,
        /// Vendor/template parameter KEY=VALUE (repeatable).
        #[arg(short = 'P', long = "param")]
        params: Vec<String>,
        /// Minimum cardinality reduction percent for a promote verdict.
        #[arg(long)]
        min_reduction: Option<f64>,
    },
    /// List experiments.
    List {
        /// Filter by phase (pending, running, completed, ...).
        #[arg(long)]
        phase: Option<String>,
    },
    /// Show one experiment.
    Get { id: String },
    /// Cancel an active experiment or delete an inactive one.
    Delete { id: String },
    /// Start deployment of both variants.
    Start { id: String },
    /// Stop early and analyze.
    Stop { id: String },
    /// Promote the winning candidate into a deployment.
    Promote { id: String },
    /// Tear the candidate down and revert a promotion.
    Rollback { id: String },
    /// Phase and task tallies.
    Status { id: String },
    /// Stored results and live per-variant aggregates.
    Metrics { id: String },
}

#[derive(Subcommand)]
enum DeploymentCommands {
    /// Create a deployment (version 1).
    Create {
        name: String,
        /// Pipeline template name.
        #[arg(short = 't', long)]
        template: String,
        #[arg(short = 'n', long, default_value = "default")]
        namespace: String,
        /// Target node (repeatable).
        #[arg(short = 'N', long = "node")]
        nodes: Vec<String>,
        /// Template parameter KEY=VALUE (repeatable).
        #[arg(short = 'P', long = "param")]
        params: Vec<String>,
    },
    /// List deployments.
    List {
        #[arg(long, default_value_t = false)]
        include_deleted: bool,
    },
    /// Show one deployment.
    Get { id: String },
    /// Apply a new spec as the next version.
    Update {
        id: String,
        #[arg(short = 't', long)]
        template: Option<String>,
        #[arg(short = 'P', long = "param")]
        params: Vec<String>,
        #[arg(long)]
        note: Option<String>,
    },
    /// Soft-delete a deployment.
    Delete { id: String },
    /// Roll back to a prior version's snapshot.
    Rollback {
        id: String,
        #[arg(short = 'v', long)]
        target_version: i64,
        #[arg(long)]
        note: Option<String>,
    },
    /// Version history, newest first.
    Versions { id: String },
    /// The active configuration snapshot.
    Config { id: String },
}

#[derive(Subcommand)]
enum PipelineCommands {
    /// List built-in templates.
    Templates,
    /// Validate a pipeline configuration file (JSON).
    Validate {
        /// Path to the configuration document.
        file: String,
    },
    /// Render a template with variables.
    Render {
        /// Template name.
        template: String,
        /// Variable KEY=VALUE (repeatable).
        #[arg(short = 'V', long = "var")]
        variables: Vec<String>,
    },
}

#[derive(Subcommand)]
enum AgentCommands {
    /// List registered agents with derived liveness.
    List,
    /// Tasks targeted at or held by a host.
    Tasks { host_id: String },
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let api_url = cli
        .api_url
        .unwrap_or_else(|| "http://127.0.0.1:8080".to_string());
    let client = ApiClient::new(&api_url);

    match cli.command {
        Commands::Experiment { command } => match command {
            ExperimentCommands::Create {
                name,
                baseline,
                candidate,
                hosts,
                selectors,
                duration_secs,
                params,
                min_reduction,
            } => {
                commands::experiment::create(
                    &client,
                    &name,
                    &baseline,
                    &candidate,
                    hosts,
                    selectors,
                    duration_secs,
                    params,
                    min_reduction,
                )
                .await
            }
            ExperimentCommands::List { phase } => {
                commands::experiment::list(&client, phase.as_deref()).await
            }
            ExperimentCommands::Get { id } => commands::experiment::get(&client, &id).await,
            ExperimentCommands::Delete { id } => commands::experiment::delete(&client, &id).await,
            ExperimentCommands::Start { id } => {
                commands::experiment::action(&client, &id, "start").await
            }
            ExperimentCommands::Stop { id } => {
                commands::experiment::action(&client, &id, "stop").await
            }
            ExperimentCommands::Promote { id } => {
                commands::experiment::action(&client, &id, "promote").await
            }
            ExperimentCommands::Rollback { id } => {
                commands::experiment::action(&client, &id, "rollback").await
            }
            ExperimentCommands::Status { id } => commands::experiment::status(&client, &id).await,
            ExperimentCommands::Metrics { id } => commands::experiment::metrics(&client, &id).await,
        },
        Commands::Deployment { command } => match command {
            DeploymentCommands::Create {
                name,
                template,
                namespace,
                nodes,
                params,
            } => {
                commands::deployment::create(&client, &name, &template, &namespace, nodes, params)
                    .await
            }
            DeploymentCommands::List { include_deleted } => {
                commands::deployment::list(&client, include_deleted).await
            }
            DeploymentCommands::Get { id } => commands::deployment::get(&client, &id).await,
            DeploymentCommands::Update {
                id,
                template,
                params,
                note,
            } => commands::deployment::update(&client, &id, template, params, note).await,
            DeploymentCommands::Delete { id } => commands::deployment::delete(&client, &id).await,
            DeploymentCommands::Rollback {
                id,
                target_version,
                note,
            } => commands::deployment::rollback(&client, &id, target_version, note).await,
            DeploymentCommands::Versions { id } => {
                commands::deployment::versions(&client, &id).await
            }
            DeploymentCommands::Config { id } => commands::deployment::config(&client, &id).await,
        },
        Commands::Pipeline { command } => match command {
            PipelineCommands::Templates => commands::pipeline::templates(&client).await,
            PipelineCommands::Validate { file } => {
                commands::pipeline::validate(&client, &file).await
            }
            PipelineCommands::Render {
                template,
                variables,
            } => commands::pipeline::render(&client, &template, variables).await,
        },
        Commands::Agent { command } => match command {
            AgentCommands::List => commands::agent::list(&client).await,
            AgentCommands::Tasks { host_id } => commands::agent::tasks(&client, &host_id).await,
        },
        Commands::Login { username, password } => {
            commands::auth::login(&client, &username, &password).await
        }
        Commands::Logout => commands::auth::logout(&client).await,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let result = tokio::select! {
        result = run(cli) => result,
        _ = tokio::signal::ctrl_c() => Err(CliError::Cancelled),
    };
    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(err.exit_code());
    }
}
