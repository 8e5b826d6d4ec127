use clap::Parser;
use face_offset::{
    init_logging, CameraSource, ErrorWrapper, TrackerConfig, TrackingSession, ZenohBridge,
};
use std::path::PathBuf;
use std::sync::Arc;
use zenoh::prelude::r#async::*;

#[derive(Parser, Debug)]
#[command(about = "Track a face on the webcam and publish its offset from center")]
struct Args {
    /// Config file, defaults to face-offset.toml if present.
    #[clap(short, long)]
    config: Option<PathBuf>,

    /// Camera device index or stream url.
    #[clap(long)]
    camera: Option<CameraSource>,

    /// Receiver the offsets are addressed to.
    #[clap(long)]
    receiver: Option<String>,

    /// Method invoked on the receiver.
    #[clap(long)]
    method: Option<String>,

    /// Offset multiplier.
    #[clap(short, long)]
    sensitivity: Option<f64>,

    /// Do not mirror frames.
    #[clap(long)]
    no_mirror: bool,

    /// Endpoints to connect to.
    #[clap(short = 'e', long)]
    connect: Vec<zenoh_config::EndPoint>,

    /// Endpoints to listen on.
    #[clap(long)]
    listen: Vec<zenoh_config::EndPoint>,

    /// Debug logging.
    #[clap(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();
    init_logging(args.verbose);

    let mut config = TrackerConfig::load(args.config.as_deref())?;
    if let Some(camera) = args.camera {
        config.camera.source = camera;
    }
    if let Some(receiver) = args.receiver {
        config.delivery.receiver = receiver;
    }
    if let Some(method) = args.method {
        config.delivery.method = method;
    }
    if let Some(sensitivity) = args.sensitivity {
        config.signal.sensitivity = sensitivity;
    }
    if args.no_mirror {
        config.camera.mirror = false;
    }
    config.validate()?;

    // configure zenoh
    let mut zenoh_config = Config::default();
    if !args.listen.is_empty() {
        zenoh_config.listen.endpoints = args.listen.clone();
        tracing::info!(
            "Configured listening endpoints {:?}",
            zenoh_config.listen.endpoints
        );
    }
    if !args.connect.is_empty() {
        zenoh_config.connect.endpoints = args.connect.clone();
        tracing::info!(
            "Configured connect endpoints {:?}",
            zenoh_config.connect.endpoints
        );
    }

    let zenoh_session = zenoh::open(zenoh_config)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    let zenoh_session = zenoh_session.into_arc();

    let bridge = Arc::new(ZenohBridge::new(
        zenoh_session,
        config.delivery.key_prefix.clone(),
    ));

    let mut session = TrackingSession::start(&config, bridge).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    session.stop().await;
    Ok(())
}
