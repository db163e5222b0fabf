use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stepwise_core::config::{RenderFormat, StepwiseConfig};
use stepwise_core::event::EventBus;
use stepwise_core::types::{BreakpointKind, DebugEvent, SessionId};
use stepwise_debug::{
    DebugCommand, DebugRunLogger, ExecutionController, GraphExecutor, Predicate, ScriptedHandler,
};
use stepwise_graph::{ExecutionContext, GraphModel, GraphVisualizer, NodeInspector};

/// How long to wait for background tasks to drain after a run.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(
    name = "stepwise",
    about = "Debugger, tracer and visualizer for agent execution graphs",
    version
)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "stepwise.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a graph's structure
    Visualize {
        /// Graph file (.json or .toml)
        graph: PathBuf,
        /// Output format: ascii, mermaid or dot
        #[arg(long)]
        format: Option<RenderFormat>,
        /// Show the connectivity of a single node
        #[arg(long)]
        node: Option<String>,
        /// Enumerate execution paths from the entry (or --node)
        #[arg(long)]
        show_paths: bool,
        /// Maximum edges per enumerated path
        #[arg(long)]
        max_depth: Option<usize>,
    },
    /// Print node metadata as JSON
    Inspect {
        /// Graph file (.json or .toml)
        graph: PathBuf,
        /// Only this node
        #[arg(long)]
        node: Option<String>,
        /// JSON object to check declared inputs and outputs against
        #[arg(long)]
        context: Option<String>,
    },
    /// Dry-run a graph under the debugger
    Simulate {
        /// Graph file (.json or .toml)
        graph: PathBuf,
        /// Initial context as a JSON object
        #[arg(long)]
        input: Option<String>,
        /// Breakpoint as target[:kind[:condition]], repeatable
        #[arg(short = 'b', long = "break", value_parser = parse_breakpoint)]
        breakpoints: Vec<BreakpointArg>,
        /// Pause at breakpoints and read commands from stdin
        #[arg(long)]
        interactive: bool,
        /// Start in single-step mode
        #[arg(long)]
        step: bool,
        /// Make the first visit of this node fail, repeatable
        #[arg(long)]
        fail: Vec<String>,
        /// Print tool call and edge usage statistics
        #[arg(long)]
        stats: bool,
        /// Print every routing decision
        #[arg(long)]
        routes: bool,
        /// Write the trace session as JSON
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Print the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: clap_complete::Shell,
    },
}

/// A breakpoint given on the command line.
#[derive(Debug, Clone)]
struct BreakpointArg {
    target: String,
    kind: BreakpointKind,
    condition: Option<String>,
}

fn parse_breakpoint(s: &str) -> Result<BreakpointArg, String> {
    let mut parts = s.splitn(3, ':');
    let target = parts.next().unwrap_or_default().trim();
    if target.is_empty() {
        return Err("breakpoint target is empty".to_string());
    }
    let kind = match parts.next().map(str::trim) {
        Some(k) if !k.is_empty() => k.parse()?,
        _ => BreakpointKind::NodeEnter,
    };
    let condition = parts
        .next()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(String::from);
    if let Some(expr) = &condition {
        Predicate::parse(expr).map_err(|e| e.to_string())?;
    }
    Ok(BreakpointArg {
        target: target.to_string(),
        kind,
        condition,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Completions don't need config or logging
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(*shell, &mut Cli::command(), "stepwise", &mut std::io::stdout());
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("stepwise=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = StepwiseConfig::load_or_default(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    match cli.command {
        Commands::Visualize {
            graph,
            format,
            node,
            show_paths,
            max_depth,
        } => {
            let graph = load_graph(&graph)?;
            let viz = GraphVisualizer::new(&graph);
            let max_depth = max_depth.unwrap_or(config.visualizer.max_path_depth);

            match &node {
                Some(id) => {
                    let connectivity = viz.connectivity(id)?;
                    println!("{}", serde_json::to_string_pretty(&connectivity)?);
                }
                None => println!("{}", viz.render(format.unwrap_or(config.visualizer.format))),
            }

            if show_paths {
                let start = node.as_deref().unwrap_or(graph.entry());
                let walks = viz.enumerate_paths(start, max_depth)?;
                println!("\nPaths from {} (max depth {}): {}", start, max_depth, walks.len());
                for (i, walk) in walks.iter().enumerate() {
                    let mut flags = Vec::new();
                    if walk.loops {
                        flags.push("loop");
                    }
                    if walk.terminal {
                        flags.push("terminal");
                    }
                    let suffix = if flags.is_empty() {
                        String::new()
                    } else {
                        format!("  [{}]", flags.join(", "))
                    };
                    println!("  {}. {}{}", i + 1, walk.nodes.join(" → "), suffix);
                }
            }
        }
        Commands::Inspect {
            graph,
            node,
            context,
        } => {
            let graph = Arc::new(load_graph(&graph)?);
            let inspector = NodeInspector::new(graph.clone());
            let context = context.as_deref().map(parse_context).transpose()?;

            let ids: Vec<String> = match node {
                Some(id) => vec![id],
                None => graph.nodes().iter().map(|n| n.id.clone()).collect(),
            };

            let mut reports = Vec::new();
            for id in &ids {
                let mut report = serde_json::json!({ "node": inspector.inspect_node(id)? });
                if let Some(ctx) = &context {
                    report["inputs"] = serde_json::to_value(inspector.inspect_inputs(id, ctx)?)?;
                    report["outputs"] = serde_json::to_value(inspector.inspect_outputs(id, ctx)?)?;
                }
                reports.push(report);
            }

            let out = match reports.len() {
                1 => serde_json::to_string_pretty(&reports[0])?,
                _ => serde_json::to_string_pretty(&reports)?,
            };
            println!("{}", out);
        }
        Commands::Simulate {
            graph,
            input,
            breakpoints,
            interactive,
            step,
            fail,
            stats,
            routes,
            export,
        } => {
            let opts = SimulateOptions {
                input,
                breakpoints,
                interactive,
                step,
                fail,
                stats,
                routes,
                export,
            };
            simulate(config, &graph, opts).await?;
        }
        Commands::Config => {
            println!("# Effective configuration ({})", cli.config.display());
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_graph(path: &Path) -> anyhow::Result<GraphModel> {
    GraphModel::load(path).with_context(|| format!("loading graph {}", path.display()))
}

fn parse_context(json: &str) -> anyhow::Result<ExecutionContext> {
    let value: serde_json::Value = serde_json::from_str(json).context("parsing context JSON")?;
    ExecutionContext::from_json(value).context("context must be a JSON object")
}

struct SimulateOptions {
    input: Option<String>,
    breakpoints: Vec<BreakpointArg>,
    interactive: bool,
    step: bool,
    fail: Vec<String>,
    stats: bool,
    routes: bool,
    export: Option<PathBuf>,
}

async fn simulate(
    mut config: StepwiseConfig,
    graph_path: &Path,
    opts: SimulateOptions,
) -> anyhow::Result<()> {
    let graph = Arc::new(load_graph(graph_path)?);
    if opts.step {
        config.debugger.step_mode = true;
    }
    let interactive = opts.interactive || config.debugger.interactive;

    let event_bus = Arc::new(EventBus::default());
    let mut controller = ExecutionController::from_config(&config, graph.clone(), event_bus.clone())?;
    for bp in &opts.breakpoints {
        let condition = bp.condition.as_deref().map(Predicate::parse).transpose()?;
        controller.registry_mut().set(&bp.target, bp.kind, condition);
    }
    if !controller.registry().is_empty() {
        println!("{}", controller.registry().render());
    }

    let handler = opts
        .fail
        .iter()
        .fold(ScriptedHandler::new(), |h, node| h.fail_once(node.clone()));
    let engine = GraphExecutor::new(graph.clone(), Arc::new(handler))
        .with_max_visits(config.debugger.max_visits_per_node);

    let initial = match opts.input.as_deref() {
        Some(json) => parse_context(json)?,
        None => ExecutionContext::new(),
    };

    let session_id = SessionId::new();
    controller.prepare_session(session_id.clone());

    // Start the event log before the run so it sees SessionStarted
    let cancel = CancellationToken::new();
    let mut log_task = None;
    if let Some(log_config) = config.log.as_ref().filter(|l| l.enabled) {
        let logger = DebugRunLogger::new(log_config.resolved_dir(), log_config.level);
        let baseline = event_bus.subscriber_count();
        let handle = tokio::spawn(logger.run(event_bus.clone(), session_id.clone(), cancel.clone()));
        while event_bus.subscriber_count() == baseline && !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        log_task = Some(handle);
    }

    let operator_task = if interactive {
        let tx = controller.attach_operator();
        Some(tokio::spawn(operator_loop(event_bus.subscribe(), tx)))
    } else {
        None
    };

    info!(session_id = %session_id, graph = %graph_path.display(), "Simulating");
    let result = controller.run(&engine, initial).await;

    if let Some(handle) = operator_task {
        drain(handle).await;
    }
    if let Some(mut handle) = log_task {
        match tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await {
            Ok(Ok(Some(path))) => println!("Event log: {}", path.display()),
            Ok(_) => {}
            Err(_) => {
                cancel.cancel();
                handle.await.ok();
            }
        }
    }

    if let Some(session) = controller.last_session() {
        println!("\n{}", session.render());

        if !controller.hits().is_empty() {
            println!("\nBreakpoint hits ({}):", controller.hits().len());
            for hit in controller.hits() {
                println!(
                    "  step {} {} {} (matched {})",
                    hit.step, hit.kind, hit.target, hit.matched
                );
            }
        }
        for warning in controller.warnings() {
            println!("warning: {}", warning);
        }

        let overlay = match config.visualizer.format {
            RenderFormat::Mermaid => controller.routes().path_overlay_mermaid(&session.node_sequence),
            _ => controller.routes().path_overlay(&session.node_sequence),
        };
        println!("\n{}", overlay);

        if opts.routes {
            for decision in controller.routes().decisions() {
                println!("\n{}", controller.routes().decision_at(decision.step)?);
            }
        }

        if opts.stats {
            println!("\nTool calls:");
            println!("{}", serde_json::to_string_pretty(&session.stats())?);
            println!("\nEdge usage:");
            println!("{}", serde_json::to_string_pretty(&controller.routes().usage_stats())?);
        }

        if let Some(path) = &opts.export {
            std::fs::write(path, session.export()?)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("\nTrace exported to {}", path.display());
        }
    }

    match result {
        Ok(context) => {
            println!("\nFinal context:");
            println!("{}", serde_json::to_string_pretty(context.data())?);
            Ok(())
        }
        Err(e) if e.is_cancellation() => {
            println!("\nRun aborted by operator.");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Print pause reports and forward commands typed on stdin until the
/// session ends. EOF on stdin aborts the run.
async fn operator_loop(
    mut events: broadcast::Receiver<DebugEvent>,
    tx: mpsc::Sender<DebugCommand>,
) {
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Operator lagged behind debugger events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            DebugEvent::Paused { report, .. } => println!("\n{}", report),
            DebugEvent::StateDump { dump } => println!("\n{}", dump),
            DebugEvent::PredicateWarning {
                kind,
                target,
                message,
            } => {
                println!("warning: condition on {} {} failed: {}", kind, target, message);
                continue;
            }
            DebugEvent::SessionEnded { .. } => break,
            _ => continue,
        }

        let command = loop {
            print!("(stepwise) ");
            std::io::stdout().flush().ok();

            match lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => continue,
                Ok(Some(line)) => match line.parse::<DebugCommand>() {
                    Ok(cmd) => break cmd,
                    Err(e) => println!("{}", e),
                },
                Ok(None) | Err(_) => break DebugCommand::Abort,
            }
        };

        if tx.send(command).await.is_err() {
            break;
        }
    }
}

async fn drain(mut handle: JoinHandle<()>) {
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut handle).await.is_err() {
        handle.abort();
    }
}
