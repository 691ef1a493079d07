use clap::{Parser, ValueEnum};
use log::{info, LevelFilter};
use sgp30flow::{
    device::serial::{self, SerialConnector},
    devices::sgp30::BAUD_RATE,
    output::{IotTicket, Sink, Stdout},
    sampler::{POLL_INTERVAL, READ_TIMEOUT},
    Config, Sampler, SamplerConfig, Shutdown,
};
use std::{path::PathBuf, time::Duration};

#[derive(Parser)]
#[command(author, version, about, long_about=None)]
struct Cli {
    /// JSON file with username, password, deviceId and baseurl
    #[arg(default_value = "config.json")]
    config: PathBuf,

    /// Serial port the sensor board is attached to
    #[arg(long, short, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Where to send samples to
    #[arg(long, value_enum, default_value_t=OutEnum::Iotticket)]
    output: OutEnum,

    /// Seconds to sleep between two polling rounds
    #[arg(long, default_value_t = POLL_INTERVAL.as_secs())]
    interval: u64,

    /// Stop after this many polling rounds
    #[arg(long)]
    count: Option<usize>,

    /// List available serial ports and exit
    #[arg(long)]
    list_ports: bool,
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
enum OutEnum {
    /// IoT-Ticket REST API
    Iotticket,
    /// Stringify
    Stringify,
    /// InfluxDB Line Protocol
    Influxdb,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut logger = pretty_env_logger::formatted_builder();
    logger.filter_level(LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        logger.parse_filters(&filters);
    }
    logger.init();

    let Cli {
        config,
        port,
        output,
        interval,
        count,
        list_ports,
    } = Cli::parse();

    if list_ports {
        for name in serial::available_ports()? {
            println!("{}", name);
        }
        return Ok(());
    }

    let config = Config::from_file(&config)?;
    let sink = make_sink(output, &config)?;
    let connector = SerialConnector::new(port, BAUD_RATE, READ_TIMEOUT);

    let sampler_config = SamplerConfig {
        interval: Duration::from_secs(interval),
        iterations: count,
        ..SamplerConfig::new(config.device_id.clone())
    };

    let (handle, shutdown) = Shutdown::new();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            handle.trigger();
        }
    });

    info!("Polling {} for device {}", connector.path(), config.device_id);
    Sampler::new(connector, sink, sampler_config)
        .run(shutdown)
        .await;
    Ok(())
}

fn make_sink(output: OutEnum, config: &Config) -> anyhow::Result<Box<dyn Sink>> {
    match output {
        OutEnum::Iotticket => Ok(Box::new(IotTicket::new(config)?)),
        OutEnum::Stringify => Ok(Box::new(Stdout::Stringify)),
        OutEnum::Influxdb => Ok(Box::new(Stdout::Influxdb)),
    }
}

#[test]
fn verify_cli() {
    use clap::CommandFactory;
    Cli::command().debug_assert();
}
