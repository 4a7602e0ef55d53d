use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use nodeflow::{
    config::OrchestratorConfig,
    logger::init_tracing,
    manifest::NodeManifest,
    orchestrator::Orchestrator,
    workflow::{ErrorStrategy, NodeOutcome, WorkflowDefinition, WorkflowParser},
};
use serde_json::Value;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "nodeflow", about = "Node discovery, supervision and workflow execution", version)]
struct Cli {
    /// Orchestrator config file (YAML). Environment overrides still apply.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Discover nodes and keep supervising them until Ctrl-C
    Run(RunArgs),

    /// List the nodes found under the nodes directory
    Nodes,

    /// Validate or run workflows
    Workflow(WorkflowArgs),

    /// Write JSON schemas for manifests and workflows
    Schema {
        #[arg(long, default_value = "schemas")]
        out: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Start every discovered node right away
    #[arg(long)]
    start_all: bool,
}

#[derive(Args, Debug)]
struct WorkflowArgs {
    #[command(subcommand)]
    command: WorkflowCommands,
}

#[derive(Subcommand, Debug)]
enum WorkflowCommands {
    Validate {
        file: PathBuf,
    },
    Run {
        file: PathBuf,
        /// Run input as key=value; values that parse as JSON keep their type
        #[arg(long = "input", value_parser = parse_input)]
        inputs: Vec<(String, Value)>,
        /// skip_dependents, fail_fast or continue_on_error
        #[arg(long, default_value_t = ErrorStrategy::SkipDependents)]
        strategy: ErrorStrategy,
    },
}

fn parse_input(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw.split_once('=').ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.trim().to_string(), value))
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = OrchestratorConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    init_tracing(&config.log_level, config.log_dir.as_deref())?;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => run(config, args).await,
        Commands::Nodes => list_nodes(config).await,
        Commands::Workflow(args) => match args.command {
            WorkflowCommands::Validate { file } => validate_workflow(file),
            WorkflowCommands::Run { file, inputs, strategy } => {
                run_workflow(config, file, inputs.into_iter().collect(), strategy).await
            }
        },
        Commands::Schema { out } => write_schemas(out),
    }
}

async fn run(config: OrchestratorConfig, args: RunArgs) -> anyhow::Result<()> {
    info!(nodes_dir = %config.nodes_dir.display(), "nodeflow starting up");
    let mut orch = Orchestrator::new(config);
    let found = orch.discover_once().await;
    println!("Discovered {found} node(s)");
    if args.start_all {
        let nodes = orch.registry().all_nodes();
        let started = orch.lifecycle().start_all(&nodes).await;
        println!("Started {started} node(s)");
    }
    orch.start();

    println!("nodeflow running; press Ctrl-C to exit");
    tokio::signal::ctrl_c().await?;

    println!("\nShutting down…");
    let removed = orch.shutdown().await;
    info!(removed, "nodeflow shut down");
    Ok(())
}

async fn list_nodes(config: OrchestratorConfig) -> anyhow::Result<()> {
    let orch = Orchestrator::new(config);
    orch.discover_once().await;
    let nodes = orch.registry().all_nodes();
    if nodes.is_empty() {
        println!("No nodes under {}", orch.config().nodes_dir.display());
        return Ok(());
    }
    println!("{:<24} {:<24} {:<22} MANIFEST", "ID", "TYPE", "STATUS");
    for node in nodes {
        println!(
            "{:<24} {:<24} {:<22} {}",
            node.id(),
            node.node_type(),
            node.status_string(),
            node.manifest_path().display()
        );
    }
    Ok(())
}

fn load_workflow(file: &Path) -> anyhow::Result<WorkflowDefinition> {
    let mut parser = WorkflowParser::new();
    match parser.parse_file(file) {
        Ok(def) => {
            for w in parser.warnings() {
                println!("⚠️  {w}");
            }
            Ok(def)
        }
        Err(e) => {
            for msg in parser.errors() {
                println!("❌ {msg}");
            }
            error!("{e}");
            bail!("workflow {} is invalid", file.display())
        }
    }
}

fn validate_workflow(file: PathBuf) -> anyhow::Result<()> {
    let def = load_workflow(&file)?;
    let levels = def.execution_levels()?;
    println!("✅ Workflow `{}` is valid: {} node(s) in {} level(s).", def.id, def.enabled_nodes().count(), levels.len());
    for (depth, level) in levels.iter().enumerate() {
        println!("  {depth}: {}", level.join(", "));
    }
    Ok(())
}

async fn run_workflow(
    config: OrchestratorConfig,
    file: PathBuf,
    inputs: BTreeMap<String, Value>,
    strategy: ErrorStrategy,
) -> anyhow::Result<()> {
    let def = load_workflow(&file)?;
    let mut orch = Orchestrator::new(config);
    orch.discover_once().await;
    let result = orch.run_workflow(&def, inputs, strategy).await;
    orch.shutdown().await;
    let report = result?;

    for id in &report.order {
        match report.outcome(id) {
            Some(NodeOutcome::Success { attempts, .. }) => println!("✅ {id} ({attempts} attempt(s))"),
            Some(NodeOutcome::Failed { code, message, .. }) => println!("❌ {id}: [{code}] {message}"),
            Some(NodeOutcome::Skipped { reason }) => println!("⏭️  {id}: {reason}"),
            None => {}
        }
    }
    println!("{}", serde_json::to_string_pretty(&report.outputs)?);
    if !report.success {
        bail!("workflow `{}` failed after {}ms", report.workflow_id, report.elapsed_ms);
    }
    println!("Workflow `{}` finished in {}ms", report.workflow_id, report.elapsed_ms);
    Ok(())
}

fn write_schemas(out: PathBuf) -> anyhow::Result<()> {
    fs::create_dir_all(&out).with_context(|| format!("failed to create {}", out.display()))?;
    let schemas = [
        ("manifest.schema.json", schemars::schema_for!(NodeManifest)),
        ("workflow.schema.json", schemars::schema_for!(WorkflowDefinition)),
    ];
    for (name, schema) in schemas {
        let path = out.join(name);
        fs::write(&path, serde_json::to_string_pretty(&schema)?)
            .with_context(|| format!("failed to write {}", path.display()))?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn inputs_keep_json_types() {
        assert_eq!(parse_input("depth=3").unwrap(), ("depth".to_string(), json!(3)));
        assert_eq!(parse_input("root=/srv/data").unwrap(), ("root".to_string(), json!("/srv/data")));
        assert_eq!(parse_input("q=a=b").unwrap(), ("q".to_string(), json!("a=b")));
        assert!(parse_input("novalue").is_err());
    }

    #[test]
    fn cli_parses_workflow_run() {
        let cli = Cli::parse_from([
            "nodeflow", "--log-level", "debug", "workflow", "run", "wf.yaml", "--input", "a=1", "--strategy", "fail_fast",
        ]);
        let Some(Commands::Workflow(WorkflowArgs { command: WorkflowCommands::Run { inputs, strategy, .. } })) =
            cli.command
        else {
            panic!("wrong command");
        };
        assert_eq!(inputs, vec![("a".to_string(), json!(1))]);
        assert_eq!(strategy, ErrorStrategy::FailFast);
    }
}
