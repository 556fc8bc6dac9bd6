use anyhow::anyhow;
use std::{path::PathBuf, process::ExitCode};
use taxizones::{pipeline, Config, LoadError, RunReport};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

const USAGE: &str = "usage: taxizones [CSV_PATH]

Loads the taxi zone lookup CSV into Postgres (truncate + reload).
Settings come from the YAML file named by TAXIZONES_CONFIG, then
DATABASE_URL / TAXIZONES_* environment variables.";

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(fmt::format::FmtSpan::CLOSE)
        .init();

    let arg = std::env::args_os().nth(1);
    if arg.as_deref().is_some_and(|a| a == "-h" || a == "--help") {
        println!("{USAGE}");
        return ExitCode::SUCCESS;
    }

    // ─── 2) run the pipeline ─────────────────────────────────────────
    match run(arg.map(PathBuf::from)).await {
        Ok(report) => {
            info!(
                inserted = report.inserted,
                total = report.verification.actual,
                "all done"
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            let code = err.exit_code();
            let stage = err.stage_name();
            let report = anyhow!(err).context(format!("{stage} stage failed"));
            error!("{:?}", report);
            ExitCode::from(code as u8)
        }
    }
}

async fn run(csv_arg: Option<PathBuf>) -> Result<RunReport, LoadError> {
    let config = Config::load(csv_arg)?;
    info!(
        csv = %config.load.csv_path.display(),
        table = %config.load.table,
        config_file = %config
            .config_file
            .as_deref()
            .map_or("<none>".into(), |p| p.display().to_string()),
        "startup"
    );
    pipeline::run(&config).await
}
