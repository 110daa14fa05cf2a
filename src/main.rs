use seqload::cli::{expand_patterns, Args};
use seqload::config::{IdleStrategy, PipelineConfig};
use seqload::core::events::{FrameReadyEvent, SourceChangedEvent};
use seqload::{Collection, FrameHandle, Pipeline};

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn init_logging(args: &Args) -> Result<()> {
    // 0 (default) = warn, 1 (-v) = info, 2 (-vv) = debug, 3+ (-vvv) = trace
    let log_level = match args.verbosity {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    if let Some(log_path_opt) = &args.log_file {
        let log_path = log_path_opt
            .clone()
            .unwrap_or_else(|| PathBuf::from("seqload.log"));
        let file = std::fs::File::create(&log_path)
            .with_context(|| format!("cannot create log file {}", log_path.display()))?;

        env_logger::Builder::new()
            .filter_level(log_level.max(log::LevelFilter::Debug))
            .format_timestamp_millis()
            .target(env_logger::Target::Pipe(Box::new(file)))
            .init();
        info!("Logging to file: {} (level: {:?})", log_path.display(), log_level);
    } else {
        // Respects RUST_LOG if set
        let default_level = match args.verbosity {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
            .format_timestamp_millis()
            .init();
    }
    Ok(())
}

fn build(pipeline: &Pipeline, args: &Args) -> Result<Arc<Collection>> {
    let files = expand_patterns(&args.files)?;
    let mut collection = pipeline.build_collection(&files)?;

    if let Some(expr) = &args.edit {
        let mut inputs = vec![collection];
        for pattern in &args.with {
            let files = expand_patterns(std::slice::from_ref(pattern))?;
            inputs.push(pipeline.build_collection(&files)?);
        }
        collection = pipeline.edit(inputs, expr)?;
    }
    if let Some(index) = args.remove {
        collection = pipeline.remove_frame(&collection, index)?;
    }
    Ok(collection)
}

fn report(collection: &Collection, index: usize, handle: &FrameHandle) {
    let name = collection
        .filename(index)
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    match handle.image() {
        Some(img) => println!(
            "{:>5}  {}  {}  [{} .. {}]",
            index,
            name,
            handle.status_label(),
            img.min(),
            img.max()
        ),
        None => println!("{:>5}  {}  {}", index, name, handle.status_label()),
    }
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;
    debug!("Command-line args: {:?}", args);

    let mut config = PipelineConfig::load(args.config.as_deref())?;
    if args.wait {
        config.idle_mode = IdleStrategy::Wait;
    }
    config.force_generic |= args.force_generic;
    config.watch_files &= !args.no_watch;

    let pipeline = Pipeline::new(config)?;

    // Completion notifications wake the report loop; no polling of providers
    let (done_tx, done_rx) = crossbeam_channel::unbounded::<()>();
    pipeline.events().subscribe::<FrameReadyEvent, _>(move |e| {
        debug!("Frame ready: {} (ok={})", e.key, e.ok);
        let _ = done_tx.send(());
    });
    pipeline.events().subscribe::<SourceChangedEvent, _>(|e| {
        info!("Source changed: {}", e.path.display());
    });

    let collection = build(&pipeline, &args)?;
    info!("Sequence has {} frame(s)", collection.len());

    let indices: Vec<usize> = match args.frame {
        Some(i) => vec![i],
        None => (0..collection.len()).collect(),
    };
    let handles = indices
        .iter()
        .map(|&i| pipeline.frame(&collection, i).map(|h| (i, h)))
        .collect::<Result<Vec<_>, _>>()?;

    let mut failed = 0;
    for (index, handle) in &handles {
        while !handle.is_complete() {
            // Spurious or missed wakeups are covered by the timeout
            let _ = done_rx.recv_timeout(Duration::from_millis(50));
        }
        if matches!(handle.result(), Some(Err(_))) {
            failed += 1;
        }
        report(&collection, *index, handle);
    }

    info!(
        "Done: {} frame(s), {} failed, cache hit rate {:.0}%",
        handles.len(),
        failed,
        pipeline.stats().hit_rate() * 100.0
    );
    if failed > 0 {
        anyhow::bail!("{} frame(s) could not be loaded", failed);
    }
    Ok(())
}
