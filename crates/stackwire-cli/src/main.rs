//! stackwire - deploy the analytics dashboards resource graph
//!
//! ## Commands
//!
//! - `plan`: Show deploy order, levels, parameters and lint warnings
//! - `deploy`: Apply the definition and publish group outputs
//! - `destroy`: Tear down everything recorded for the deployment
//! - `outputs`: Print published group outputs as JSON
//! - `state`: Summarize what is recorded for the deployment
//!
//! Resources are provisioned through the simulated backend; custom
//! resources go to an in-process handler unless `--handler-url` is given.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use stackwire_core::blueprint;
use stackwire_core::obs::DeploySpan;
use stackwire_core::{
    parse_override, CallbackHandler, ControllerConfig, DeployConfig, DeployPlan, DeployReport,
    Deployment, DeploymentContext, ExecutorConfig, GrantRegistry, HttpCallbackHandler,
    HttpHandlerConfig, LifecycleController, LocalHandler, ResourceKind, SimulatedBackend,
    UniquenessToken,
};
use stackwire_state::fakes::MemoryDeployLedger;
use stackwire_state::{DeploymentId, DeploymentState, FileStateStore, StateStore};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "stackwire")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Declarative resource-graph deployments", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// JSON file with deploy settings (prefix, region, account, timeouts)
    #[arg(long, global = true, env = "STACKWIRE_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding deployment state
    #[arg(long, global = true, env = "STACKWIRE_STATE_DIR", default_value = ".stackwire")]
    state_dir: PathBuf,

    /// Deployment name
    #[arg(short, long, global = true, env = "STACKWIRE_DEPLOYMENT", default_value = "dashboards")]
    deployment: String,

    /// Region override
    #[arg(long, global = true, env = "STACKWIRE_REGION")]
    region: Option<String>,

    /// Account id override
    #[arg(long, global = true, env = "STACKWIRE_ACCOUNT")]
    account: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the deploy plan without applying it
    Plan {
        /// Parameter override (key=value), repeatable
        #[arg(short, long = "param")]
        params: Vec<String>,
    },

    /// Apply the definition
    Deploy {
        /// Parameter override (key=value), repeatable
        #[arg(short, long = "param")]
        params: Vec<String>,

        #[command(flatten)]
        handler: HandlerArgs,
    },

    /// Tear down everything recorded for the deployment
    Destroy {
        #[command(flatten)]
        handler: HandlerArgs,
    },

    /// Print published group outputs as JSON
    Outputs {
        /// Only this group
        #[arg(short, long)]
        group: Option<String>,
    },

    /// Summarize recorded state
    State,
}

#[derive(clap::Args)]
struct HandlerArgs {
    /// Endpoint of the custom-resource handler (in-process handler if omitted)
    #[arg(long, env = "STACKWIRE_HANDLER_URL")]
    handler_url: Option<String>,

    /// Bearer token for the handler endpoint
    #[arg(long, env = "STACKWIRE_HANDLER_TOKEN", requires = "handler_url")]
    handler_token: Option<String>,
}

impl HandlerArgs {
    fn build(&self) -> Result<Arc<dyn CallbackHandler>> {
        match &self.handler_url {
            Some(url) => {
                let mut config = HttpHandlerConfig::new(url);
                if let Some(token) = &self.handler_token {
                    config = config.with_token(token);
                }
                let handler = HttpCallbackHandler::new(config)
                    .context("Failed to build HTTP handler client")?;
                info!(endpoint = %handler.endpoint(), "using remote custom-resource handler");
                Ok(Arc::new(handler))
            }
            None => Ok(Arc::new(LocalHandler::new())),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    stackwire_core::init_tracing(cli.json, level);

    let workspace = Workspace::open(&cli)?;

    match cli.command {
        Commands::Plan { params } => cmd_plan(&workspace, &params).await,
        Commands::Deploy { params, handler } => {
            let report = cmd_deploy(&workspace, &params, handler.build()?).await?;
            ensure_success("deploy", &report)
        }
        Commands::Destroy { handler } => {
            let report = cmd_destroy(&workspace, handler.build()?).await?;
            ensure_success("destroy", &report)
        }
        Commands::Outputs { group } => cmd_outputs(&workspace, group.as_deref()).await,
        Commands::State => cmd_state(&workspace).await,
    }
}

/// Settings and state shared by every command.
struct Workspace {
    config: DeployConfig,
    deployment: DeploymentId,
    store: Arc<FileStateStore>,
}

impl Workspace {
    fn open(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => DeployConfig::from_file(path)
                .context(format!("Failed to load config from {:?}", path))?,
            None => DeployConfig::default(),
        };
        if let Some(region) = &cli.region {
            config.region = region.clone();
        }
        if let Some(account) = &cli.account {
            config.account = account.clone();
        }
        config.validate().context("Invalid deploy settings")?;

        let deployment = DeploymentId::new(cli.deployment.as_str());
        deployment
            .validate()
            .context(format!("Invalid deployment name '{}'", cli.deployment))?;

        let store = FileStateStore::new(&cli.state_dir)
            .context(format!("Failed to open state directory {:?}", cli.state_dir))?;
        Ok(Self {
            config,
            deployment,
            store: Arc::new(store),
        })
    }

    async fn load(&self) -> Result<DeploymentState> {
        Ok(self.store.load(&self.deployment).await?)
    }

    /// Compose the blueprint with `ctx` and plan it with `params`.
    fn plan(&self, ctx: &DeploymentContext, params: &[String]) -> Result<DeployPlan> {
        let overrides = parse_params(params)?;
        let mut grants = GrantRegistry::new();
        let composer = blueprint::dashboards(ctx, &mut grants)?;
        let plan = composer.plan(&overrides).context("Failed to plan deployment")?;
        info!(
            steps = plan.steps.len(),
            grants = grants.len(),
            "deployment planned"
        );
        Ok(plan)
    }

    /// An executor whose simulated backend knows every resource already
    /// recorded in state.
    async fn executor(&self, handler: Arc<dyn CallbackHandler>) -> Result<Deployment> {
        let backend = SimulatedBackend::new(&self.config.region, &self.config.account);
        for record in self.load().await?.resources.into_values() {
            for pending in record.pending_deletes {
                backend.adopt(
                    pending.backend_id,
                    ResourceKind::from_label(&pending.kind),
                    BTreeMap::new(),
                );
            }
            backend.adopt(
                record.backend_id,
                ResourceKind::from_label(&record.kind),
                record.attributes,
            );
        }
        let controller = LifecycleController::new(
            self.deployment.clone(),
            handler,
            self.store.clone(),
            ControllerConfig::from(&self.config),
        );
        Ok(Deployment::new(
            self.deployment.clone(),
            Arc::new(backend),
            Arc::new(controller),
            self.store.clone(),
            Arc::new(MemoryDeployLedger::new()),
            ExecutorConfig::from(&self.config),
        ))
    }
}

fn parse_params(params: &[String]) -> Result<BTreeMap<String, String>> {
    let mut overrides = BTreeMap::new();
    for raw in params {
        let (key, value) = parse_override(raw)?;
        if overrides.insert(key.clone(), value).is_some() {
            bail!("Parameter '{}' given more than once", key);
        }
    }
    Ok(overrides)
}

/// Plan without touching state. Names use the stored token when there is
/// one, otherwise a throwaway token that the first deploy will replace.
async fn cmd_plan(workspace: &Workspace, params: &[String]) -> Result<()> {
    let state = workspace.load().await?;
    let (token, provisional) = match state.uniqueness_token {
        Some(ref token) => (UniquenessToken::parse(token)?, false),
        None => (UniquenessToken::generate(), true),
    };
    let ctx = DeploymentContext::new(workspace.deployment.clone(), token, &workspace.config);
    let plan = workspace.plan(&ctx, params)?;
    print!("{}", render_plan(&plan, &state));
    if provisional {
        println!();
        println!("(physical names use a provisional token until the first deploy)");
    }
    Ok(())
}

fn render_plan(plan: &DeployPlan, state: &DeploymentState) -> String {
    let mut out = String::new();
    out.push_str("Parameters:\n");
    for (name, value) in plan.params.iter() {
        out.push_str(&format!("  {:<24} {}\n", name, value));
    }
    for (level, steps) in plan.levels().iter().enumerate() {
        out.push_str(&format!("Level {}:\n", level));
        for step in steps {
            let known = state.resources.contains_key(&step.address)
                || state.custom_resources.contains_key(&step.address);
            let marker = if known { "~" } else { "+" };
            out.push_str(&format!(
                "  {} {:<48} {}\n",
                marker, step.address, step.resource.kind
            ));
        }
    }
    let stale: Vec<&String> = state
        .resources
        .keys()
        .chain(state.custom_resources.keys())
        .filter(|a| !plan.contains(a))
        .collect();
    if !stale.is_empty() {
        out.push_str("Removed from definition:\n");
        for address in stale {
            out.push_str(&format!("  - {}\n", address));
        }
    }
    if !plan.warnings.is_empty() {
        out.push_str("Warnings:\n");
        for warning in &plan.warnings {
            out.push_str(&format!("  ! {}\n", warning));
        }
    }
    out
}

/// Cancel the run on Ctrl-C; the current level finishes first.
fn cancel_on_ctrl_c(deployment: &Deployment) {
    let cancel = deployment.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current level");
            cancel.cancel();
        }
    });
}

async fn cmd_deploy(
    workspace: &Workspace,
    params: &[String],
    handler: Arc<dyn CallbackHandler>,
) -> Result<DeployReport> {
    let _span = DeploySpan::enter(workspace.deployment.as_str(), "deploy");
    let ctx = DeploymentContext::load_or_init(
        workspace.store.as_ref(),
        workspace.deployment.clone(),
        &workspace.config,
    )
    .await?;
    let plan = workspace.plan(&ctx, params)?;
    let deployment = workspace.executor(handler).await?;
    cancel_on_ctrl_c(&deployment);

    let report = deployment.deploy(&plan).await?;
    print!("{}", render_report(&report));
    Ok(report)
}

async fn cmd_destroy(
    workspace: &Workspace,
    handler: Arc<dyn CallbackHandler>,
) -> Result<DeployReport> {
    let _span = DeploySpan::enter(workspace.deployment.as_str(), "destroy");
    let deployment = workspace.executor(handler).await?;
    cancel_on_ctrl_c(&deployment);

    let report = deployment.destroy().await?;
    print!("{}", render_report(&report));
    Ok(report)
}

fn render_report(report: &DeployReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("Run: {}\n", report.run_id));
    for (address, action) in report.settled.iter().chain(report.removed.iter()) {
        out.push_str(&format!("  {:<10} {}\n", action, address));
    }
    for failure in &report.failed {
        out.push_str(&format!("  {:<10} {}: {}\n", "failed", failure.address, failure.error));
    }
    for address in &report.skipped {
        out.push_str(&format!("  {:<10} {}\n", "skipped", address));
    }
    for warning in &report.warnings {
        out.push_str(&format!("Warning: {}\n", warning));
    }
    for (group, outputs) in &report.outputs {
        for (name, value) in outputs {
            out.push_str(&format!("{}.{} = {}\n", group, name, value));
        }
    }
    out
}

fn ensure_success(action: &str, report: &DeployReport) -> Result<()> {
    if report.cancelled {
        bail!("{} cancelled", action);
    }
    if !report.failed.is_empty() {
        bail!("{} finished with {} failure(s)", action, report.failed.len());
    }
    Ok(())
}

async fn cmd_outputs(workspace: &Workspace, group: Option<&str>) -> Result<()> {
    let state = workspace.load().await?;
    let json = match group {
        Some(group) => {
            let outputs = state
                .outputs
                .get(group)
                .context(format!("Group '{}' has no published outputs", group))?;
            serde_json::to_string_pretty(outputs)?
        }
        None => serde_json::to_string_pretty(&state.outputs)?,
    };
    println!("{}", json);
    Ok(())
}

async fn cmd_state(workspace: &Workspace) -> Result<()> {
    let state = workspace.load().await?;
    print!("{}", render_state(&state));
    Ok(())
}

fn render_state(state: &DeploymentState) -> String {
    let mut out = String::new();
    out.push_str(&format!("Deployment: {}\n", state.deployment_id));
    out.push_str(&format!(
        "Token:      {}\n",
        state.uniqueness_token.as_deref().unwrap_or("(none)")
    ));
    if state.is_empty() {
        out.push_str("Nothing recorded.\n");
        return out;
    }
    out.push_str(&format!("Resources ({}):\n", state.resources.len()));
    for record in state.resources.values() {
        out.push_str(&format!(
            "  {:<48} {:<36} {}\n",
            record.address, record.kind, record.backend_id
        ));
    }
    out.push_str(&format!(
        "Custom resources ({}):\n",
        state.custom_resources.len()
    ));
    for record in state.custom_resources.values() {
        out.push_str(&format!(
            "  {:<48} {} ({})\n",
            record.address, record.physical_id, record.removal_policy
        ));
        for old in &record.pending_deletes {
            out.push_str(&format!("    pending delete: {}\n", old));
        }
    }
    out.push_str("Outputs:\n");
    for (group, outputs) in &state.outputs {
        for (name, value) in outputs {
            out.push_str(&format!("  {}.{} = {}\n", group, name, value));
        }
    }
    out
}
