// pardl - src/bin/main.rs
//
// Entry point: parses flags, then either serves relay traffic (-s) or runs
// one download task to completion.

use clap::Parser;
use tracing_subscriber::EnvFilter;

use pardl::metadata::Meta;
use pardl::{relay, DownloadTask, TaskOptions};

/// Parallel, resumable HTTP downloader.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the file to download, or an existing `.godl` manifest to
    /// resume from.
    url: Option<String>,

    /// URL to download (same as the positional argument).
    #[arg(short = 'u', long = "url", value_name = "URL")]
    url_opt: Option<String>,

    /// Relay host to borrow bandwidth from; repeatable.
    #[arg(short = 'p', long = "relay", value_name = "HOST")]
    relays: Vec<String>,

    /// Run as a relay server on this listen address instead of downloading.
    #[arg(short = 's', long = "serve", value_name = "ADDR")]
    serve: Option<String>,

    /// Overwrite an existing download instead of resuming it.
    #[arg(short = 'f', long = "force")]
    force: bool,

    /// Cap aggregate write throughput, in bytes per second.
    #[arg(long = "max-speed", value_name = "BYTES", default_value_t = 0)]
    max_speed: u64,

    /// Number of concurrent connections.
    #[arg(short = 'n', long = "connections", default_value_t = 5)]
    connections: usize,

    /// Block size expressed as a power of two (20 means 1 MiB blocks).
    #[arg(short = 'b', long = "block-bit", default_value_t = 20)]
    block_bit: u32,

    /// Print the manifest and exit.
    #[arg(long)]
    meta: bool,

    /// Hide the progress bar.
    #[arg(long = "no-progress")]
    no_progress: bool,

    /// Debug logging; also shows the raw read rate next to the write rate.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Extra request header as `Key: Value`; repeatable.
    #[arg(short = 'H', long = "header", value_name = "HEADER")]
    headers: Vec<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let default_filter = if args.verbose { "pardl=debug" } else { "pardl=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(addr) = &args.serve {
        if let Err(err) = relay::serve(addr).await {
            tracing::error!(%err, "relay server failed");
            std::process::exit(1);
        }
        return;
    }

    let Some(url) = args.url.clone().or_else(|| args.url_opt.clone()) else {
        use clap::CommandFactory;
        let _ = Args::command().print_help();
        std::process::exit(2);
    };
    let pwd = match std::env::current_dir() {
        Ok(pwd) => pwd,
        Err(err) => {
            tracing::error!(%err, "cannot resolve the working directory");
            std::process::exit(1);
        }
    };

    let options = TaskOptions {
        max_speed: args.max_speed,
        clean: args.force,
        progress: !args.no_progress,
        show_read_speed: args.verbose,
        headers: args.headers.clone(),
        relays: args.relays.clone(),
        ..TaskOptions::default()
    };

    let mut task = match DownloadTask::new_auto(&url, &pwd, args.block_bit, options).await {
        Ok(task) => task,
        Err(err) => {
            tracing::error!(%err, "cannot start the download");
            std::process::exit(1);
        }
    };

    if args.meta {
        print_meta(&task.meta).await;
        return;
    }

    tokio::select! {
        _ = task.schedule(args.connections) => {}
        _ = shutdown_signal() => {
            tracing::info!("interrupted, saving progress");
        }
    }
    task.close().await;

    if task.meta.is_finish() {
        if let Err(err) = task.meta.remove() {
            tracing::warn!(%err, "cannot remove the manifest");
        }
        tracing::info!(file = %task.meta.target_path().display(), "download complete");
    } else {
        if let Err(err) = task.meta.sync().await {
            tracing::error!(%err, "cannot save the manifest");
        }
        std::process::exit(1);
    }
}

async fn print_meta(meta: &Meta) {
    println!("name:     {}", meta.name);
    println!("pwd:      {}", meta.pwd.display());
    println!("source:   {}", meta.source);
    println!("endpoint: {}", meta.endpoint);
    println!("etag:     {}", meta.etag);
    println!("size:     {}", meta.file_size);
    println!("blocks:   {} x {} bytes", meta.block_count(), meta.blk_size);
    for (idx, blk) in meta.blocks().await.iter().enumerate() {
        let Some(blk) = blk else { break };
        println!("  #{:<6} {:?} {}", idx, blk.state, blk.written);
    }
}

/// Resolves on SIGINT, SIGTERM, or SIGHUP.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("cannot install SIGTERM handler");
        let mut hup = signal(SignalKind::hangup()).expect("cannot install SIGHUP handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
            _ = hup.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
