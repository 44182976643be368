use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use imgfix_reconstruct::{
    analyze_authoritative, analyze_rows, build_plan, render_analysis, render_preview,
    render_verification, verify_target, write_plan_file, write_run_report, AutoConfirm,
    ConfirmationGate, Executor, ImgfixConfig, ReconstructError, StdinConfirm,
};
use imgfix_storage::{AuthoritativeStore, TargetStore};
use tracing::{error, info, warn};

mod telemetry;

#[derive(Debug, Parser)]
#[command(name = "imgfix")]
#[command(about = "Recover truncated property image cells from an authoritative copy")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Analyze both stores and dry-run the plan (default).
    Reconstruct(ReconstructArgs),
    /// Print the length census of both stores.
    Analyze,
    /// Report rows still at the narrow width and the longest cells.
    Verify,
    /// Alter the target image column to an unbounded text type.
    WidenColumn {
        #[arg(long)]
        yes: bool,
    },
    /// Serve image URLs over HTTP.
    Serve,
}

#[derive(Debug, Default, Args)]
struct ReconstructArgs {
    /// Commit the plan after the dry-run and confirmation.
    #[arg(long)]
    execute: bool,
    /// Skip the interactive confirmation.
    #[arg(long)]
    yes: bool,
    /// Write the plan as an offline SQL batch instead of touching the target.
    #[arg(long, value_name = "PATH", conflicts_with = "execute")]
    emit_sql: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = telemetry::init_tracing("warn,imgfix=info") {
        eprintln!("{err}");
    }
    let cli = Cli::parse();
    let config = ImgfixConfig::from_env();

    let command = cli
        .command
        .unwrap_or(Commands::Reconstruct(ReconstructArgs::default()));
    let outcome = match command {
        Commands::Reconstruct(args) => reconstruct(&config, args).await,
        Commands::Analyze => analyze(&config).await.map(|_| 0),
        Commands::Verify => verify(&config).await.map(|_| 0),
        Commands::WidenColumn { yes } => widen_column(&config, confirmation_gate(yes).as_mut()).await,
        Commands::Serve => imgfix_web::serve_from_env().await.map(|_| 0),
    };

    match outcome {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            let code = err
                .downcast_ref::<ReconstructError>()
                .map_or(2, ReconstructError::exit_code);
            error!(error = %err, "imgfix stopped");
            eprintln!("error: {err:#}");
            ExitCode::from(code)
        }
    }
}

async fn reconstruct(config: &ImgfixConfig, args: ReconstructArgs) -> Result<u8> {
    let target = config.connect_target().await?;
    let authoritative = config.open_authoritative().await?;
    let cfg = &config.reconstruct;
    let width = cfg.narrow_width;

    let target_rows = TargetStore::scan(&target).await?;
    let auth_rows = authoritative.scan().await?;
    let analysis = analyze_rows(&target_rows, width, cfg.sample_size);
    print!(
        "{}",
        render_analysis(&analysis, Some(&analyze_authoritative(&auth_rows, width)))
    );

    let plan = build_plan(&auth_rows, &target_rows, width);

    if let Some(path) = &args.emit_sql {
        write_plan_file(path, &plan, &config.table, cfg.progress_interval).await?;
        println!(
            "wrote offline batch of {} rows to {}",
            plan.updates.len(),
            path.display()
        );
        return Ok(0);
    }

    let mut executor = Executor::new(&target, plan, cfg.clone());
    print!("{}", render_preview(executor.dry_run()?));

    if !args.execute || executor.plan().is_empty() {
        if !args.execute {
            println!("dry run only; pass --execute to apply");
        }
        return finish(config, executor, &analysis).await;
    }

    match executor.confirm(confirmation_gate(args.yes).as_mut()) {
        Ok(()) => {}
        Err(ReconstructError::ConfirmationDeclined) => {
            println!("aborted; no rows were written");
            return finish(config, executor, &analysis).await;
        }
        Err(err) => return Err(err.into()),
    }

    let committed = executor.commit().await.cloned();
    let commit = match committed {
        Ok(commit) => commit,
        Err(err) => {
            finish(config, executor, &analysis).await?;
            return Err(err.into());
        }
    };
    println!(
        "committed {} rows, {} unchanged, {} errors",
        commit.committed,
        commit.unchanged.len(),
        commit.errors.len()
    );
    for failure in &commit.errors {
        println!("  - {}: {}", failure.property_id, failure.message);
    }

    match executor.verify().await {
        Ok(verification) => print!("{}", render_verification(verification)),
        Err(err) => eprintln!("error: verification did not complete: {err}"),
    }
    finish(config, executor, &analysis).await
}

fn confirmation_gate(yes: bool) -> Box<dyn ConfirmationGate> {
    if yes {
        Box::new(AutoConfirm)
    } else {
        Box::new(StdinConfirm::new())
    }
}

async fn finish(
    config: &ImgfixConfig,
    executor: Executor<'_>,
    analysis: &imgfix_reconstruct::AnalysisReport,
) -> Result<u8> {
    let report = executor.into_report();
    let run_dir = write_run_report(&config.reports_dir, &report, Some(analysis)).await?;
    info!(run_id = %report.run_id, dir = %run_dir.display(), state = ?report.state, "run report written");
    println!("report: {}", run_dir.display());
    Ok(report.exit_code())
}

async fn analyze(config: &ImgfixConfig) -> Result<()> {
    let target = config.connect_target().await?;
    let cfg = &config.reconstruct;
    let analysis = analyze_rows(
        &TargetStore::scan(&target).await?,
        cfg.narrow_width,
        cfg.sample_size,
    );
    let auth_summary = match config.open_authoritative().await {
        Ok(store) => Some(analyze_authoritative(&store.scan().await?, cfg.narrow_width)),
        Err(err) => {
            warn!(error = %err, "skipping authoritative analysis");
            None
        }
    };
    print!("{}", render_analysis(&analysis, auth_summary.as_ref()));
    Ok(())
}

async fn verify(config: &ImgfixConfig) -> Result<()> {
    let target = config.connect_target().await?;
    let cfg = &config.reconstruct;
    let report = verify_target(&target, cfg.narrow_width, cfg.verify_sample_size).await?;
    print!("{}", render_verification(&report));
    Ok(())
}

async fn widen_column(config: &ImgfixConfig, gate: &mut dyn ConfirmationGate) -> Result<u8> {
    let target = config.connect_target().await?;
    let table = &config.table;
    if !gate.approve(&format!(
        "Alter {}.{} to an unbounded text type?",
        table.table, table.image_column
    )) {
        println!("aborted; column unchanged");
        return Ok(0);
    }
    target.widen_column().await?;

    let requested = config.reconstruct.narrow_width.saturating_mul(4);
    match target.probe_column_width(requested).await? {
        Some(probe) if probe.truncates() => {
            println!(
                "column still truncates: kept {:?} of {} characters",
                probe.observed, requested
            );
            Ok(1)
        }
        Some(_) => {
            println!("column holds a {requested}-character probe value");
            Ok(0)
        }
        None => {
            println!("column widened; table is empty so nothing was probed");
            Ok(0)
        }
    }
}
