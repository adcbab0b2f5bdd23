mod config;
mod pipeline;
mod report;
mod review;
mod vcs;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

use pipeline::{
    Collaborators, ConsoleEscalation, DependencyGraph, EscalationChannel, FileStatusStore,
    FixedResponse, GitWorktreeCleanup, HumanResponse, InMemoryStatusStore, NoopWorkspace,
    PipelineOrchestrator, StatusStore, TracingObserver, WorkItemPipeline, WorkspaceManager,
};
use review::{ReviewDecisionEngine, ReviewKind};
use vcs::github::{GitHubError, GitHubHost};
use vcs::mock::MockHost;
use vcs::{ChangeRequestSpec, VersionControlHost, WorkItemId};

/// Release pipeline: turns a pair of review reports into a decision and,
/// when the change passes, carries it through CI, merge and dependency
/// hand-off.
#[derive(Parser, Debug)]
#[command(name = "release-pipeline", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate two review reports and print the decision
    Decide {
        /// Self review report (JSON)
        #[arg(long)]
        self_report: PathBuf,

        /// Independent review report (JSON)
        #[arg(long)]
        independent_report: PathBuf,

        /// Confidence threshold; defaults to the configured value
        #[arg(long)]
        threshold: Option<f64>,
    },

    /// Run one review-to-release cycle for a work item
    Release(ReleaseArgs),
}

#[derive(clap::Args, Debug)]
struct ReleaseArgs {
    /// Work item identifier (e.g. a story id)
    #[arg(long)]
    work_item: String,

    #[arg(long)]
    self_report: PathBuf,

    #[arg(long)]
    independent_report: PathBuf,

    /// Branch holding the change
    #[arg(long)]
    source_branch: String,

    #[arg(long, default_value = "main")]
    target_branch: String,

    /// Change request title; defaults to the work item id
    #[arg(long)]
    title: Option<String>,

    #[arg(long, default_value = "")]
    description: String,

    #[arg(long = "label")]
    labels: Vec<String>,

    #[arg(long = "reviewer")]
    reviewers: Vec<String>,

    /// Fix iteration this cycle runs under
    #[arg(long, default_value_t = 1)]
    iteration: u32,

    /// GitHub repository (owner/repo or URL); defaults to [github] owner/repo
    #[arg(long)]
    repo: Option<String>,

    /// Optional output file path for markdown report
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Use an in-memory host with a scripted green CI run (no GitHub token needed)
    #[arg(long)]
    r#mock: bool,

    /// Answer every escalation this way instead of prompting
    #[arg(long, value_enum)]
    escalation_response: Option<HumanResponse>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    info!("loading configuration");
    let config = config::Config::load()?;

    match cli.command {
        Command::Decide {
            self_report,
            independent_report,
            threshold,
        } => {
            let self_review = review::load_report(ReviewKind::SelfReview, &self_report)?;
            let independent = review::load_report(ReviewKind::Independent, &independent_report)?;
            let engine =
                ReviewDecisionEngine::new(threshold.unwrap_or(config.review.confidence_threshold));
            let result = engine.decide(&self_review, &independent);
            info!(decision = %result.decision, "decision made");
            report::print_decision(&result);
            Ok(())
        }
        Command::Release(args) => release(args, &config).await,
    }
}

async fn release(args: ReleaseArgs, config: &config::Config) -> Result<(), Box<dyn std::error::Error>> {
    let work_item = WorkItemId::new(args.work_item.as_str());
    let span = info_span!("release", work_item = %work_item);

    let self_review = review::load_report(ReviewKind::SelfReview, &args.self_report)?;
    let independent = review::load_report(ReviewKind::Independent, &args.independent_report)?;

    let mut settings = config.pipeline_settings();
    let host: Arc<dyn VersionControlHost> = if args.r#mock {
        info!("using mock host for demo");
        settings.poll_interval = Duration::from_secs(1);
        Arc::new(MockHost::demo())
    } else {
        let repo = args
            .repo
            .clone()
            .or_else(|| config.github.repository())
            .ok_or("repository is required unless --mock is used: pass --repo or set [github] owner/repo")?;
        let repo = vcs::github::parse_repo(&repo)?;
        debug!(owner = %repo.owner, repo = %repo.repo, "parsed repository");
        let token = config.github_token().ok_or(GitHubError::MissingToken)?;
        Arc::new(GitHubHost::new(
            repo,
            token,
            &config.github.api_url,
            Duration::from_secs(config.github.request_timeout_secs),
        )?)
    };

    let escalation: Arc<dyn EscalationChannel> = match args.escalation_response {
        Some(response) => Arc::new(FixedResponse(response)),
        None => Arc::new(ConsoleEscalation),
    };
    let workspace: Arc<dyn WorkspaceManager> = match &config.workspace.worktree_root {
        Some(root) => Arc::new(GitWorktreeCleanup::new(
            root.clone(),
            Duration::from_secs(config.merge.attempt_timeout_secs),
        )),
        None => Arc::new(NoopWorkspace),
    };
    let graph = DependencyGraph::from_map(&config.dependencies)?;
    debug!(items = graph.len(), "loaded dependency graph");
    let status_store: Arc<dyn StatusStore> = if args.r#mock {
        Arc::new(InMemoryStatusStore::new(graph))
    } else {
        let store = FileStatusStore::new(config.workspace.status_file.clone(), graph);
        debug!(path = %store.path().display(), "using status file");
        Arc::new(store)
    };

    let collaborators = Collaborators::new(host, escalation)
        .with_workspace(workspace)
        .with_status_store(status_store)
        .with_observer(Arc::new(TracingObserver));
    let orchestrator = PipelineOrchestrator::new(settings, collaborators);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling pipeline");
            on_interrupt.cancel();
        }
    });

    let spec = ChangeRequestSpec {
        title: args.title.unwrap_or_else(|| work_item.to_string()),
        work_item,
        source_branch: args.source_branch,
        target_branch: args.target_branch,
        description: args.description,
        labels: args.labels,
        reviewers: args.reviewers,
    };

    let mut pipeline = WorkItemPipeline::new(&orchestrator, args.iteration);
    let cycle = match pipeline
        .run_cycle(&self_review, &independent, &spec, &cancel)
        .instrument(span)
        .await
    {
        Ok(cycle) => cycle,
        Err(e) => {
            for line in e.rationale() {
                eprintln!("  • {line}");
            }
            return Err(e.into());
        }
    };

    info!("generating report");
    let built_report = report::build(&cycle);
    report::output(&built_report, args.output.as_deref())?;
    info!(outcome = cycle.outcome.label(), next_iteration = pipeline.iteration(), "done");

    Ok(())
}
