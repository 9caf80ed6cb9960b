use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use datastore_probe::config::DEFAULT_MAX_OUTPUT_BYTES;
use datastore_probe::{apply_file_strategy, Config, FileStrategy, FormTrace, Profile, Trace};
use std::io::Write;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name="datastore-probe", version, about="Diagnostic capture endpoint for datastore uploads")]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the capture endpoint.
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        listen: Option<String>,
        #[arg(long)]
        path: Option<String>,
        #[arg(long, value_enum)]
        profile: Option<Profile>,
        #[arg(long)]
        max_output_bytes: Option<usize>,
        #[arg(long, value_enum)]
        form_trace: Option<FormTrace>,
    },
    /// Decode a captured part offline and print its trace.
    Decode {
        #[arg(long, value_enum, default_value_t = FileStrategy::Gzip)]
        strategy: FileStrategy,
        #[arg(long, default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
        max_output_bytes: usize,
        input: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "datastore_probe=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Cmd::Serve { config, listen, path, profile, max_output_bytes, form_trace } => {
            let mut cfg = match config {
                Some(file) => Config::load(&file)
                    .with_context(|| format!("loading {}", file.display()))?,
                None => Config::default(),
            };
            if let Some(listen) = listen { cfg.listen = listen; }
            if let Some(path) = path { cfg.path = path; }
            if let Some(profile) = profile { cfg.profile = profile; }
            if let Some(max) = max_output_bytes { cfg.max_output_bytes = max; }
            if let Some(mode) = form_trace { cfg.form_trace = mode; }
            cfg.validate()?;

            tracing::info!("datastore-probe v{} starting", env!("CARGO_PKG_VERSION"));
            datastore_probe::server::serve(cfg).await?;
        }
        Cmd::Decode { strategy, max_output_bytes, input } => {
            let data = std::fs::read(&input)
                .with_context(|| format!("reading {}", input.display()))?;
            let mut trace = Trace::new();
            trace.line(format!("# {}: {} bytes", input.display(), data.len()));
            if let Some(out) = apply_file_strategy(&mut trace, strategy, data, max_output_bytes) {
                trace.line(out);
            }
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&trace.render())?;
            stdout.flush()?;
        }
    }
    Ok(())
}
