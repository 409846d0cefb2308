use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use grade_engine::db::{self, PgGradeGateway};
use grade_engine::models::Directory;
use grade_engine::report;
use grade_engine::status::{class_overview, DEFAULT_APPROVAL_THRESHOLD};
use grade_engine::{
    AverageFallback, EngineConfig, GradeBoard, GradePatch, LocalGradeStore, RemoteGradeGateway,
    Role, SyncMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    Postgres,
    Local,
}

#[derive(Parser)]
#[command(name = "grades")]
#[command(about = "Grade sync and academic status tool for the school portal", long_about = None)]
struct Cli {
    /// Where grades live
    #[arg(
        long,
        env = "GRADES_STORE",
        value_enum,
        default_value_t = StoreKind::Postgres,
        global = true
    )]
    store: StoreKind,
    /// Dataset file used by the local store
    #[arg(long, env = "GRADES_DATA", default_value = "grades.json", global = true)]
    data: PathBuf,
    #[arg(
        long,
        env = "GRADES_SYNC_MODE",
        value_enum,
        default_value_t = SyncMode::Polling,
        global = true
    )]
    mode: SyncMode,
    #[arg(
        long,
        env = "GRADES_APPROVAL_THRESHOLD",
        default_value_t = DEFAULT_APPROVAL_THRESHOLD,
        global = true
    )]
    threshold: f64,
    #[arg(long, env = "GRADES_MUTATION_TIMEOUT_MS", default_value_t = 10_000, global = true)]
    timeout_ms: u64,
    #[arg(long, env = "GRADES_ROLE", value_enum, default_value_t = Role::Teacher, global = true)]
    role: Role,
    #[arg(long, value_enum, default_value_t = AverageFallback::AllRecords, global = true)]
    average_fallback: AverageFallback,
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load realistic seed data
    Seed,
    /// Import grades from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// List grade records
    List {
        #[arg(long)]
        student: Option<Uuid>,
        #[arg(long)]
        subject: Option<Uuid>,
    },
    /// Show academic situations, failing subjects first
    Status {
        #[arg(long)]
        student: Option<Uuid>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Generate a markdown recovery report
    Report {
        #[arg(long)]
        scope: Option<String>,
        #[arg(long, default_value = "recovery-report.md")]
        out: PathBuf,
    },
    /// Change one grade
    Update {
        id: Uuid,
        #[arg(long)]
        value: Option<f64>,
        #[arg(long)]
        trimester: Option<i32>,
        #[arg(long)]
        comment: Option<String>,
    },
    /// Delete one grade
    Delete { id: Uuid },
    /// Delete several grades at once
    BulkDelete {
        #[arg(required = true, value_delimiter = ',')]
        ids: Vec<Uuid>,
    },
    /// Follow grade changes until interrupted (streaming mode)
    Watch,
}

enum Backend {
    Postgres {
        pool: PgPool,
        gateway: Arc<PgGradeGateway>,
    },
    Local(Arc<LocalGradeStore>),
}

impl Backend {
    async fn open(cli: &Cli) -> anyhow::Result<Self> {
        match cli.store {
            StoreKind::Postgres => {
                let pool = connect_pool().await?;
                let gateway = Arc::new(PgGradeGateway::new(pool.clone(), cli.role));
                Ok(Backend::Postgres { pool, gateway })
            }
            StoreKind::Local => {
                let store = LocalGradeStore::init(&cli.data, cli.role).with_context(|| {
                    format!("failed to open local dataset {}", cli.data.display())
                })?;
                Ok(Backend::Local(Arc::new(store)))
            }
        }
    }

    fn gateway(&self) -> Arc<dyn RemoteGradeGateway> {
        match self {
            Backend::Postgres { gateway, .. } => Arc::clone(gateway) as Arc<dyn RemoteGradeGateway>,
            Backend::Local(store) => Arc::clone(store) as Arc<dyn RemoteGradeGateway>,
        }
    }

    fn pool(&self) -> anyhow::Result<&PgPool> {
        match self {
            Backend::Postgres { pool, .. } => Ok(pool),
            Backend::Local(_) => anyhow::bail!("this command needs --store postgres"),
        }
    }

    async fn directory(&self) -> anyhow::Result<Directory> {
        match self {
            Backend::Postgres { pool, .. } => db::fetch_directory(pool).await,
            Backend::Local(_) => Ok(Directory::default()),
        }
    }

    async fn close(self) -> anyhow::Result<()> {
        match self {
            Backend::Postgres { pool, .. } => {
                pool.close().await;
                Ok(())
            }
            Backend::Local(store) => store
                .teardown()
                .context("failed to flush local dataset"),
        }
    }
}

async fn connect_pool() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    PgPoolOptions::new()
        .max_connections(5)
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn engine_config(cli: &Cli) -> EngineConfig {
    EngineConfig {
        approval_threshold: cli.threshold,
        average_fallback: cli.average_fallback,
        ..EngineConfig::default()
    }
    .with_mode(cli.mode)
    .with_mutation_timeout(Duration::from_millis(cli.timeout_ms))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let backend = Backend::open(&cli).await?;
    let result = run(&cli, &backend).await;
    backend.close().await?;
    result
}

async fn run(cli: &Cli, backend: &Backend) -> anyhow::Result<()> {
    match &cli.command {
        Commands::InitDb => {
            db::init_db(backend.pool()?).await?;
            println!("Schema ready.");
            return Ok(());
        }
        Commands::Seed => {
            let inserted = db::seed(backend.pool()?).await?;
            println!("Inserted {inserted} seed grades.");
            return Ok(());
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(backend.pool()?, csv).await?;
            println!("Inserted {inserted} grades from {}.", csv.display());
            return Ok(());
        }
        _ => {}
    }

    let board = GradeBoard::new(backend.gateway(), engine_config(cli));
    board.start().await.context("failed to load grades")?;
    let result = run_board_command(cli, backend, &board).await;
    board.shutdown();
    result
}

async fn run_board_command(cli: &Cli, backend: &Backend, board: &GradeBoard) -> anyhow::Result<()> {
    match &cli.command {
        Commands::List { student, subject } => {
            let directory = backend.directory().await?;
            let records: Vec<_> = board
                .records()
                .into_iter()
                .filter(|record| student.map_or(true, |id| record.student_id == id))
                .filter(|record| subject.map_or(true, |id| record.subject_id == id))
                .collect();

            if records.is_empty() {
                println!("No grades found.");
                return Ok(());
            }

            for record in records {
                println!(
                    "- {} {} / {} T{} {:.1} ({}){}",
                    record.id,
                    directory.student_name(&record.student_id),
                    directory.subject_name(&record.subject_id),
                    record.trimester,
                    record.value,
                    record.kind.as_str(),
                    record
                        .comment
                        .as_deref()
                        .map(|comment| format!(": {comment}"))
                        .unwrap_or_default()
                );
            }
        }
        Commands::Status { student, limit } => {
            let directory = backend.directory().await?;
            let overview: Vec<_> = board
                .class_overview()
                .into_iter()
                .filter(|situation| student.map_or(true, |id| situation.student_id == id))
                .collect();

            if overview.is_empty() {
                println!("No grades found.");
                return Ok(());
            }

            println!("Academic situation by subject:");
            for situation in overview.iter().take(*limit) {
                println!(
                    "- {} / {}: average {:.2}{} final {:.2}, {}",
                    directory.student_name(&situation.student_id),
                    directory.subject_name(&situation.subject_id),
                    situation.media_final,
                    situation
                        .nota_recuperacao
                        .map(|value| format!(", recovery {value:.2},"))
                        .unwrap_or_else(|| ",".to_string()),
                    situation.effective_average,
                    situation.situacao.label()
                );
            }
        }
        Commands::Report { scope, out } => {
            let directory = backend.directory().await?;
            let overview = board.class_overview();
            let report = report::build_report(
                scope.as_deref(),
                board.config().approval_threshold,
                &overview,
                &directory,
            );
            std::fs::write(out, report)?;
            println!("Report written to {}.", out.display());
        }
        Commands::Update {
            id,
            value,
            trimester,
            comment,
        } => {
            let patch = GradePatch {
                value: *value,
                trimester: *trimester,
                comment: comment.clone(),
                kind: None,
            };
            let record = board
                .update(*id, patch)
                .await
                .with_context(|| format!("update of grade {id} failed"))?;
            println!("Grade {} is now {:.1}.", record.id, record.value);
        }
        Commands::Delete { id } => {
            board
                .delete(*id)
                .await
                .with_context(|| format!("delete of grade {id} failed"))?;
            println!("Grade {id} deleted.");
        }
        Commands::BulkDelete { ids } => {
            let outcome = board.bulk_delete(ids).await;
            println!(
                "Deleted {} of {} grades.",
                outcome.succeeded_ids.len(),
                outcome.succeeded_ids.len() + outcome.failed_count()
            );
            for id in outcome.failed_ids.iter() {
                println!("- {id} was kept");
            }
            outcome.into_result()?;
        }
        Commands::Watch => {
            if !board.is_streaming() {
                anyhow::bail!("watch needs --mode streaming");
            }
            let config = board.config().clone();
            let mut view = board.watch();
            println!(
                "Watching {} grades. Press Ctrl-C to stop.",
                board.records().len()
            );

            loop {
                tokio::select! {
                    changed = view.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let current = view.borrow_and_update().clone();
                        let in_recovery = class_overview(
                            &current.records,
                            config.approval_threshold,
                            config.average_fallback,
                        )
                        .iter()
                        .filter(|situation| situation.in_recovery())
                        .count();
                        println!(
                            "{} grades, {} subjects in recovery{}",
                            current.records.len(),
                            in_recovery,
                            if current.stale { " (feed lost, showing last known data)" } else { "" }
                        );
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Commands::InitDb | Commands::Seed | Commands::Import { .. } => {}
    }

    Ok(())
}
