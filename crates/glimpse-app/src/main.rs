use std::{fs, process, sync::Arc, time::Duration};

use bytes::Bytes;
use glimpse_app::cli::{Cli, Commands, ProbeArgs, SearchArgs};
use glimpse_app::config;
use glimpse_app::constants::{EMBEDDING_DIM, PROBE_IMAGE_URL};
use glimpse_app::error::AppError;
use glimpse_app::services::build_app_context;
use glimpse_server::{ApiState, CropBox, FilterSpec, SearchRequest, VisualSearch};
use serde_json::{Value, json};
use tracing_subscriber::{EnvFilter, filter::LevelFilter, fmt};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let log_level = determine_log_level(&cli);
    init_tracing(log_level);

    if let Err(err) = run(cli).await {
        eprintln!("{err}");
        process::exit(1);
    }
}

fn init_tracing(level: LevelFilter) {
    // RUST_LOG, when set, overrides the verbosity flag.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(level.into()));
    let subscriber = fmt().with_env_filter(filter).with_target(false).finish();

    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("Tracing subscriber already set; skipping re-initialization.");
    }
}

async fn run(cli: Cli) -> Result<(), AppError> {
    match cli.command {
        Some(Commands::Serve(_)) => run_serve().await?,
        Some(Commands::Search(args)) => run_search(args).await?,
        Some(Commands::Probe(args)) => run_probe(args).await?,
        None => Cli::print_help(),
    }

    Ok(())
}

async fn run_serve() -> Result<(), AppError> {
    let cfg = config::load()?;
    let ctx = build_app_context(&cfg)?;

    let _pruner = ctx.limiter.as_ref().map(|limiter| {
        let every = Duration::from_secs(cfg.server.rate_limit.prune_interval_secs.max(1));
        Arc::clone(limiter).spawn_pruner(every)
    });

    let state = ApiState::new(ctx.pipeline.clone(), Arc::clone(&ctx.analytics))
        .with_admin_key(cfg.server.admin.key.clone())
        .with_client_identity(&cfg.server.rate_limit);
    if cfg.server.admin.key.is_none() {
        tracing::info!("admin key not configured; admin routes will reject every request");
    }

    glimpse_server::serve(cfg.server.clone(), Arc::new(state)).await?;
    Ok(())
}

async fn run_search(args: SearchArgs) -> Result<(), AppError> {
    let file = match &args.file {
        Some(path) => Some(Bytes::from(fs::read(path).map_err(|source| AppError::Io {
            path: path.clone(),
            source,
        })?)),
        None => None,
    };
    let crop = match args.bbox.as_deref() {
        Some(raw) => Some(serde_json::from_str::<CropBox>(raw).map_err(|err| {
            AppError::InvalidArgument {
                flag: "--bbox",
                reason: err.to_string(),
            }
        })?),
        None => None,
    };
    let filters = match args.filters.as_deref() {
        Some(raw) => {
            serde_json::from_str::<FilterSpec>(raw).map_err(|err| AppError::InvalidArgument {
                flag: "--filters",
                reason: err.to_string(),
            })?
        }
        None => FilterSpec::default(),
    };

    let cfg = config::load()?;
    let ctx = build_app_context(&cfg)?;
    let request = SearchRequest {
        file,
        url: args.url,
        crop_requested: crop.is_some(),
        crop,
        filters,
    };
    let response = ctx.pipeline.search(&args.client, request).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_probe(args: ProbeArgs) -> Result<(), AppError> {
    let cfg = config::load()?;
    let ctx = build_app_context(&cfg)?;
    let image_url = args.image_url.as_deref().unwrap_or(PROBE_IMAGE_URL);

    let embedding = match ctx.embedder.embed(image_url).await {
        Ok(raw) => json!({
            "ok": raw.dim() == EMBEDDING_DIM,
            "dim": raw.dim(),
        }),
        Err(err) => json!({ "ok": false, "error": err.to_string() }),
    };

    let mut unit = vec![0.0_f32; EMBEDDING_DIM];
    unit[0] = 1.0;
    let vector = match ctx.vectors.knn(&unit, 1).await {
        Ok(found) => json!({ "ok": true, "results": found.len() }),
        Err(err) => json!({
            "ok": false,
            "failure": format!("{:?}", err.failure),
            "error": err.message,
        }),
    };

    let healthy = is_ok(&embedding) && is_ok(&vector);
    let report = json!({
        "ok": healthy,
        "embedding": embedding,
        "vector_search": vector,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    if !healthy {
        tracing::warn!("probe found unhealthy dependencies");
    }
    Ok(())
}

fn is_ok(section: &Value) -> bool {
    section.get("ok").and_then(Value::as_bool).unwrap_or(false)
}

fn determine_log_level(cli: &Cli) -> LevelFilter {
    match cli.command.as_ref() {
        Some(Commands::Serve(_)) => match cli.verbose {
            0 => LevelFilter::INFO,
            1 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
        _ => match cli.verbose {
            0 => LevelFilter::WARN,
            1 => LevelFilter::INFO,
            2 => LevelFilter::DEBUG,
            _ => LevelFilter::TRACE,
        },
    }
}
