use std::{env, fs, net::SocketAddr, sync::Arc};

use anyhow::{bail, Context};
use livecast_rtc::{
    api::{StreamApi, DEFAULT_API_BASE},
    media::synthetic::SyntheticDevices,
    peer::rtc::RtcPeerFactory,
    server,
    util::init_log,
    whip::HttpWhipClient,
    Phase, PublisherConfig, StreamDescriptor, StreamingSessionCoordinator,
};
use tracing::{info, warn};

fn main() {
    let args: Vec<String> = env::args().collect();

    let result = match args.get(1).map(String::as_str) {
        Some("serve") => serve(&args[2..]),
        Some("publish") => publish(&args[2..]),
        Some("streams") => streams(),
        Some("create") => create(&args[2..]),
        _ => {
            print_usage();
            return;
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("livecast {}", livecast_rtc::VERSION);
    println!("Usage:");
    println!("  livecast serve [bind] [token]                    - Run a local WHIP ingest sink");
    println!("  livecast publish <descriptor.json> [config.json] - Publish a synthetic camera");
    println!("  livecast publish --id <stream id> [config.json]  - Same, credential fetched from the backend");
    println!("  livecast streams                                 - List streams on the backend");
    println!("  livecast create <title> [description]            - Create a stream, print its descriptor");
    println!();
    println!("Backend calls use LIVECAST_API_URL and LIVECAST_AUTH (full Authorization header).");
}

fn serve(args: &[String]) -> anyhow::Result<()> {
    init_log();
    let bind: SocketAddr = args
        .first()
        .map(String::as_str)
        .unwrap_or("0.0.0.0:8889")
        .parse()
        .context("bind address")?;
    let token = args.get(1).cloned();
    server::main(bind, token)
}

#[tokio::main]
async fn publish(args: &[String]) -> anyhow::Result<()> {
    init_log();

    let (descriptor, rest) = match args {
        [flag, id, rest @ ..] if flag == "--id" => {
            let id: u64 = id.parse().with_context(|| format!("stream id {id:?}"))?;
            let descriptor = backend()
                .stream_credential(id)
                .await
                .with_context(|| format!("fetching credential of stream {id}"))?;
            (descriptor, rest)
        }
        [path, rest @ ..] => {
            let descriptor: StreamDescriptor = serde_json::from_str(
                &fs::read_to_string(path).with_context(|| format!("reading {path}"))?,
            )
            .context("parsing stream descriptor")?;
            (descriptor, rest)
        }
        [] => bail!("publish needs a stream descriptor file or --id <stream id>"),
    };

    let config = match rest.first() {
        Some(path) => PublisherConfig::from_json_file(path)
            .with_context(|| format!("loading config {path}"))?,
        None => PublisherConfig::default(),
    }
    .with_env_overrides();

    let whip = HttpWhipClient::new(config.negotiation_timeout())?;
    let mut coordinator = StreamingSessionCoordinator::new(
        Arc::new(SyntheticDevices::new().with_frames()),
        RtcPeerFactory,
        Arc::new(whip),
        config,
    );
    coordinator.set_stream(descriptor.clone());

    coordinator.select_camera();
    coordinator.process_next().await;
    let status = coordinator.status();
    if status.phase != Phase::SourceReady {
        bail!(
            "no source: {}",
            status.error.unwrap_or_else(|| "unknown error".into())
        );
    }

    println!("RTMP url for external software: {}", descriptor.rtmp_url());
    coordinator.go_live(&descriptor).await?;
    info!("Live. Ctrl-C to stop.");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            more = coordinator.process_next() => {
                if !more {
                    break;
                }
                let status = coordinator.status();
                info!("Status: {}", serde_json::to_string(&status)?);
                if status.phase != Phase::Live {
                    warn!("Broadcast left the live phase");
                    break;
                }
            }
        }
    }

    coordinator.release_source().await;
    Ok(())
}

fn backend() -> StreamApi {
    let base = env::var("LIVECAST_API_URL").unwrap_or_else(|_| DEFAULT_API_BASE.to_string());
    let api = StreamApi::new(base);
    match env::var("LIVECAST_AUTH") {
        Ok(auth) => api.with_auth(auth),
        Err(_) => api,
    }
}

#[tokio::main]
async fn streams() -> anyhow::Result<()> {
    let page = backend().list_streams(None, 20).await?;
    for stream in &page.items {
        println!(
            "{:>6}  {:<8}  {}  ({})",
            stream.stream_id,
            format!("{:?}", stream.status),
            stream.title,
            stream.creator
        );
    }
    if page.has_more {
        println!("more after cursor {:?}", page.next_cursor);
    }
    Ok(())
}

#[tokio::main]
async fn create(args: &[String]) -> anyhow::Result<()> {
    let Some(title) = args.first() else {
        bail!("create needs a title");
    };
    let description = args.get(1).map(String::as_str).unwrap_or("");
    let descriptor = backend().create_stream(title, description).await?;
    println!("{}", serde_json::to_string_pretty(&descriptor)?);
    Ok(())
}
