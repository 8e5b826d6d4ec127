use clap::Parser;
use face_offset::bridge::{offset_key, ready_key};
use face_offset::config::DeliveryConfig;
use face_offset::{init_logging, ErrorWrapper, Offset};
use zenoh::prelude::r#async::*;

#[derive(Parser, Debug)]
#[command(about = "Answer readiness queries and print received face offsets")]
struct Args {
    /// Receiver name to serve.
    #[clap(long, default_value = "FaceReceiver")]
    receiver: String,

    /// Method to subscribe to.
    #[clap(long, default_value = "OnFaceMove")]
    method: String,

    /// Key prefix shared with the tracker.
    #[clap(long)]
    key_prefix: Option<String>,

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
    let key_prefix = args
        .key_prefix
        .unwrap_or_else(|| DeliveryConfig::default().key_prefix);

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

    let subscriber = zenoh_session
        .declare_subscriber(offset_key(&key_prefix, &args.receiver, &args.method))
        .best_effort()
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;

    let queryable = zenoh_session
        .declare_queryable(ready_key(&key_prefix, &args.receiver))
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;

    tracing::info!("{} waiting for {}", args.receiver, args.method);

    loop {
        tokio::select! {
            query = queryable.recv_async() => {
                let query = query?;
                query
                    .reply(Ok(Sample::new(query.key_expr().clone(), "ready")))
                    .res()
                    .await
                    .map_err(ErrorWrapper::ZenohError)?;
            }
            sample = subscriber.recv_async() => {
                let sample = sample?;
                let payload = sample.value.to_string();
                match serde_json::from_str::<Offset>(&payload) {
                    Ok(offset) => {
                        println!("{}: x {:+.3} y {:+.3}", args.method, offset.x, offset.y)
                    }
                    Err(err) => tracing::warn!("Malformed payload {:?}: {}", payload, err),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}
