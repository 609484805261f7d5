use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use clap_derive::Parser;
use isobroadcast::broadcaster::broadcaster::Broadcaster;
use isobroadcast::broadcaster::broadcaster_config::BroadcasterConfig;
use isobroadcast::receiver::receiver::Receiver;
use isobroadcast::receiver::receiver_config::ReceiverConfig;
use isobroadcast::transport::loopback::{LoopbackConfig, LoopbackRadio};
use tokio::select;
use tracing::{error, info, Level};

/// Runs a broadcaster and a receiver against each other over an in-process radio
#[derive(Parser)]
struct Args {
    /// how long each broadcast group lives before it is recreated
    #[clap(long, default_value_t = 60_000)]
    sustain_ms: u64,

    /// log a payload every n rounds
    #[clap(long, default_value_t = 100)]
    report_interval: u32,

    /// take the periodic announcement off the air after this many milliseconds
    #[clap(long)]
    drop_announcement_after_ms: Option<u64>,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let radio = LoopbackRadio::new(LoopbackConfig::new());

    let broadcaster_config = Arc::new(BroadcasterConfig {
        sustain_duration: Duration::from_millis(args.sustain_ms),
        report_interval: args.report_interval,
        ..BroadcasterConfig::new()
    });
    let receiver_config = Arc::new(ReceiverConfig {
        report_interval: args.report_interval,
        align_report_intervals: true,
        ..ReceiverConfig::new()
    });

    let broadcaster = Broadcaster::new(broadcaster_config, Arc::new(radio.broadcaster()))?;
    let receiver = Receiver::new(receiver_config, Arc::new(radio.receiver()))?;

    let drop_announcement = async {
        match args.drop_announcement_after_ms {
            Some(ms) => {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                info!("dropping the periodic announcement");
                radio.set_announcement_dropped(true);
                tokio::time::sleep(Duration::from_secs(1)).await;
                info!("restoring the periodic announcement");
                radio.set_announcement_dropped(false);
            }
            None => {}
        }
        std::future::pending::<()>().await
    };

    let result = select! {
        r = broadcaster.run() => r,
        r = receiver.run() => r,
        _ = drop_announcement => unreachable!(),
    };

    match result {
        Ok(never) => match never {},
        Err(e) => {
            error!("{}", e);
            Err(e.into())
        }
    }
}
