use std::process::Stdio;

use anyhow::Context;
use clap::Parser;
use data_pull::{
    file::FileProducer, reader::ReaderProducer, DataPull, ProcessExit, Producer, PullConfig,
    PullEvent, PullReport, SinkHandle,
};
use futures::StreamExt;
use serde::Serialize;
use tokio::{net::TcpStream, process::Command};

mod cli;

fn init_logging(verbose: bool) {
    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("data_pull", level)
        .filter_module("lite_pull", level)
        .init();
}

#[derive(Serialize)]
struct SinkSummary {
    name: String,
    success: bool,
}

#[derive(Serialize)]
struct Summary {
    success: bool,
    total_in: u64,
    elapsed_ms: u128,
    bits_per_second: u64,
    sinks: Vec<SinkSummary>,
}

#[tokio::main]
async fn main() -> ! {
    let args = cli::Args::parse();
    init_logging(args.verbose);

    let code = match run(args).await {
        Ok(true) => 0,
        Ok(false) => 1,
        Err(e) => {
            log::error!("{:#}", e);
            2
        }
    };
    std::process::exit(code);
}

async fn run(args: cli::Args) -> anyhow::Result<bool> {
    args.validate()?;

    let mut config = PullConfig::new(args.low_water);
    if let Some(max) = args.max_bytes {
        config = config.with_max_in(max);
    }

    let (sinks, processes) = open_sinks(&args).await?;

    let (report, sinks) = if args.from_stdin() {
        let producer = ReaderProducer::new(tokio::io::stdin(), args.chunk_size());
        transfer(config, producer, sinks).await?
    } else {
        let producer = FileProducer::new(args.inputs.iter(), args.chunk_size());
        let config = config
            .with_progress_interval(producer.progress_interval())
            .with_progress_max_hint(producer.total_size());
        transfer(config, producer, sinks).await?
    };

    for (name, mut exit) in processes {
        match exit.wait().await {
            Ok(status) if status.success() => log::debug!("{} exited", name),
            Ok(status) => log::warn!("{} exited with {}", name, status),
            Err(e) => log::warn!("{}: {:#}", name, e),
        }
    }

    log::info!(
        "transfer {}, {} bytes in {} ms, {} b/s",
        if report.success { "completed" } else { "failed" },
        report.total_in,
        report.elapsed.as_millis(),
        report.bits_per_second()
    );

    if args.json {
        let summary = Summary {
            success: report.success,
            total_in: report.total_in,
            elapsed_ms: report.elapsed.as_millis(),
            bits_per_second: report.bits_per_second(),
            sinks,
        };
        let json = serde_json::to_string_pretty(&summary)?;
        // Standard output may carry the data itself.
        if args.stdout {
            eprintln!("{}", json);
        } else {
            println!("{}", json);
        }
    }
    Ok(report.success)
}

async fn open_sinks(args: &cli::Args) -> anyhow::Result<(Vec<SinkHandle>, Vec<(String, ProcessExit)>)> {
    let mut sinks = Vec::new();
    let mut processes = Vec::new();

    for path in &args.outputs {
        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("error creating {}", path.display()))?;
        sinks.push(SinkHandle::plain(path.display().to_string(), file));
    }

    for cmd in &args.commands {
        let child = Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .stdin(Stdio::piped())
            .spawn()
            .with_context(|| format!("error starting {:?}", cmd))?;
        let (sink, exit) = SinkHandle::process(cmd.clone(), child)?;
        sinks.push(sink);
        processes.push((cmd.clone(), exit));
    }

    for addr in &args.connect {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("error connecting to {}", addr))?;
        sinks.push(SinkHandle::socket(addr.clone(), stream));
    }

    if args.stdout {
        sinks.push(SinkHandle::plain("stdout", tokio::io::stdout()));
    }
    Ok((sinks, processes))
}

async fn transfer<P: Producer>(
    config: PullConfig,
    producer: P,
    sinks: Vec<SinkHandle>,
) -> anyhow::Result<(PullReport, Vec<SinkSummary>)> {
    let pull = DataPull::new(config, producer);
    let reporter = tokio::spawn(report_events(pull.events()));

    pull.start(sinks).await?;
    let report = tokio::select! {
        report = pull.wait() => report?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, stopping transfer");
            pull.stop().await?;
            pull.wait().await?
        },
    };

    let sinks = reporter.await?;
    Ok((report, sinks))
}

async fn report_events(mut events: data_pull::pull::PullEventStream) -> Vec<SinkSummary> {
    let mut sinks = Vec::new();
    while let Some(event) = events.next().await {
        match event {
            PullEvent::Started => log::debug!("transfer started"),
            PullEvent::Progress { total_in, max_hint } => match max_hint {
                Some(max) if max > 0 => {
                    log::info!("{} / {} bytes ({}%)", total_in, max, total_in * 100 / max)
                }
                _ => log::info!("{} bytes", total_in),
            },
            PullEvent::SinkCompleted { name, success, .. } => {
                if success {
                    log::debug!("transfer to {} completed", name);
                } else {
                    log::warn!("transfer to {} failed", name);
                }
                sinks.push(SinkSummary {
                    name: name.to_string(),
                    success,
                });
            }
            PullEvent::Completed(_) => break,
        }
    }
    sinks
}
