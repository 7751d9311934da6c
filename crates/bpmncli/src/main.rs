// crates/bpmncli/src/main.rs

use anyhow::{bail, Context, Result};
use bpmncore::{
    DataDefinition, DataType, EngineEvent, Expression, FlowNodeDefinition, FlowNodeState,
    GatewayType, Operation, ProcessDefinition, ProcessInstanceId, Value,
};
use bpmnruntime::{
    validate_definition, EngineConfig, ExpressionResolver, FlowNodeFilter, ProcessEngine,
    SearchOptions,
};
use clap::{Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "bpmn")]
#[command(about = "BPMN process engine CLI", long_about = None)]
struct Cli {
    /// Engine configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Show debug logs
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Deploy a process definition and run one instance in memory
    Run {
        /// Path to process definition JSON file
        #[arg(short, long)]
        file: PathBuf,

        /// Contract inputs as a JSON object
        #[arg(short, long)]
        input: Option<String>,

        /// Execute every ready user task as the system user
        #[arg(long)]
        complete_tasks: bool,
    },

    /// Validate a process definition file
    Validate {
        /// Path to process definition JSON file
        file: PathBuf,
    },

    /// List expression evaluators and data methods
    Evaluators,

    /// Write an example process definition
    Init {
        /// Output file path
        #[arg(short, long, default_value = "process.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Commands::Run {
            file,
            input,
            complete_tasks,
        } => {
            let config = EngineConfig::load(cli.config.as_deref())?;
            run_process(config, &file, input, complete_tasks).await?;
        }
        Commands::Validate { file } => validate_file(&file)?,
        Commands::Evaluators => list_evaluators(),
        Commands::Init { output } => create_example(&output)?,
    }

    Ok(())
}

fn load_definition(file: &Path) -> Result<ProcessDefinition> {
    let json = std::fs::read_to_string(file)
        .with_context(|| format!("cannot read {}", file.display()))?;
    serde_json::from_str(&json).with_context(|| format!("{} is not a process definition", file.display()))
}

fn parse_inputs(input: Option<String>) -> Result<BTreeMap<String, Value>> {
    let Some(input) = input else {
        return Ok(BTreeMap::new());
    };
    match serde_json::from_str(&input)? {
        serde_json::Value::Object(entries) => Ok(entries
            .into_iter()
            .map(|(name, value)| (name, Value::from(value)))
            .collect()),
        _ => bail!("Input must be a JSON object"),
    }
}

async fn run_process(
    config: EngineConfig,
    file: &Path,
    input: Option<String>,
    complete_tasks: bool,
) -> Result<()> {
    println!("🚀 Loading process from: {}", file.display());
    let definition = load_definition(file)?;
    println!("📋 Process: {} {}", definition.name, definition.version);
    println!("   Flow nodes: {}", definition.flow_nodes.len());
    println!("   Transitions: {}", definition.transitions.len());
    println!();

    let inputs = parse_inputs(input)?;
    let system_user = config.system_user_id;
    let engine = ProcessEngine::in_memory(config, Arc::new(bpmnexpr::standard_registry()));
    let mut events = engine.subscribe_events();
    let event_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            print_event(&event);
        }
    });

    engine.after_services_start().await?;
    let id = engine.deploy(definition).await?;
    engine.enable_process(id).await?;
    let pi = engine.start_process(id, system_user, inputs).await?;
    engine.run_until_idle().await?;

    while complete_tasks {
        let ready = engine
            .search_flow_nodes(&SearchOptions::new(
                FlowNodeFilter::user_tasks()
                    .in_process(pi)
                    .in_state(FlowNodeState::Ready),
            ))
            .await?;
        if ready.items.is_empty() {
            break;
        }
        for task in ready.items {
            println!("  🙋 Completing user task '{}'", task.name);
            engine
                .execute_user_task(task.id, system_user, BTreeMap::new())
                .await?;
        }
        engine.run_until_idle().await?;
    }

    tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
    event_task.abort();
    print_summary(&engine, pi).await
}

fn print_event(event: &EngineEvent) {
    match event {
        EngineEvent::ProcessStarted { name, process_instance_id, .. } => {
            println!("▶️  Process '{}' started ({})", name, process_instance_id);
        }
        EngineEvent::FlowNodeStateChanged { name, node_type, state, .. } => match state {
            FlowNodeState::Completed => println!("  ✅ {} '{}' completed", node_type, name),
            FlowNodeState::Ready => println!("  ⏳ {} '{}' is ready", node_type, name),
            FlowNodeState::Waiting => println!("  ⏸️  {} '{}' is waiting", node_type, name),
            _ => {}
        },
        EngineEvent::FlowNodeFailed { flow_node_id, error, .. } => {
            println!("  ❌ Flow node {} failed: {}", flow_node_id, error);
        }
        EngineEvent::ProcessFinished { process_instance_id, state, .. } => {
            println!("✨ Process instance {} finished: {}", process_instance_id, state);
        }
        EngineEvent::MessageCorrelated { message_id, .. } => {
            println!("  📨 Message {} correlated", message_id);
        }
        EngineEvent::TimerFired { waiting_event_id, .. } => {
            println!("  ⏰ Timer {} fired", waiting_event_id);
        }
        _ => {}
    }
}

async fn print_summary(engine: &ProcessEngine, pi: ProcessInstanceId) -> Result<()> {
    println!();
    println!("📊 Summary:");
    println!("   Process instance: {}", pi);

    match engine.get_archived_process_instance(pi).await {
        Ok(archived) => {
            println!("   State: {}", archived.state);
            let data = engine.get_archived_process_data_instances(pi).await?;
            if !data.is_empty() {
                println!();
                println!("📤 Data:");
                for item in data {
                    println!("   {}: {}", item.name, item.value);
                }
            }
        }
        Err(e) if e.is_not_found() => {
            let instance = engine.get_process_instance(pi).await?;
            println!("   State: {}", instance.state);
            println!("   Open flow nodes: {}", engine.open_flow_node_count(pi).await?);
        }
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

fn validate_file(file: &Path) -> Result<()> {
    println!("🔍 Validating process: {}", file.display());
    let definition = load_definition(file)?;
    let resolver = ExpressionResolver::new(Arc::new(bpmnexpr::standard_registry()));

    match validate_definition(&definition, &resolver) {
        Ok(_) => {
            println!("✅ Process is valid:");
            println!("   Name: {} {}", definition.name, definition.version);
            println!("   Flow nodes: {}", definition.flow_nodes.len());
            println!("   Transitions: {}", definition.transitions.len());
            Ok(())
        }
        Err(e) => {
            println!("❌ {}", e);
            bail!("validation failed")
        }
    }
}

fn list_evaluators() {
    let registry = bpmnexpr::standard_registry();

    println!("📦 Expression kinds:");
    for kind in registry.list_kinds() {
        println!("  • {}", kind);
        if let Some(description) = registry.describe(kind) {
            println!("    {}", description);
        }
    }

    println!();
    println!("🔧 Data methods:");
    for signature in registry.list_methods() {
        println!("  • {}", signature);
    }
}

fn create_example(output: &Path) -> Result<()> {
    let mut definition = ProcessDefinition::new("Expense approval", "1.0")
        .with_data(DataDefinition::new("amount", DataType::Long).with_default(Expression::long(120)))
        .with_data(DataDefinition::new("decision", DataType::Text));

    let start = definition.add_node(FlowNodeDefinition::start_event("Submitted"));
    let route = definition.add_node(FlowNodeDefinition::gateway("Needs review?", GatewayType::Exclusive));
    let review = definition.add_node(
        FlowNodeDefinition::user_task("Review expense", "manager")
            .with_operation(Operation::assign_data("decision", Expression::text("reviewed"))),
    );
    let approve = definition.add_node(
        FlowNodeDefinition::automatic_task("Auto approve")
            .with_operation(Operation::assign_data("decision", Expression::text("approved"))),
    );
    let end = definition.add_node(FlowNodeDefinition::end_event("Done"));

    definition.connect(start, route);
    definition.connect_when(
        route,
        review,
        Expression::comparison(
            ">",
            Expression::variable("amount", DataType::Long),
            Expression::long(100),
        ),
    );
    definition.connect_default(route, approve);
    definition.connect(review, end);
    definition.connect(approve, end);

    let json = serde_json::to_string_pretty(&definition)?;
    std::fs::write(output, json)?;

    println!("✨ Created example process: {}", output.display());
    println!();
    println!("Run it with:");
    println!("  bpmn run --file {} --complete-tasks", output.display());
    Ok(())
}
