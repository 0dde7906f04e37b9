mod workers;

use peerdrop::core::room::{generate_room_code, rendezvous_id};
use peerdrop::utils::sos::SignalOfStop;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use workers::args::{Args, Command};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::load();
    let settings = args.settings()?;

    // RUST_LOG wins over -v when set.
    let filter = match args.verbose {
        0 => "warn,peerdrop=info",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter_layer = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let sos = SignalOfStop::new();

    // Ctrl+C handler
    let sos_clone = sos.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        sos_clone.cancel();
    });

    match args.command {
        Command::Code => {
            let code = generate_room_code();
            println!("{code}  ->  {}", rendezvous_id(&code));
            Ok(())
        }
        Command::Demo(demo) => workers::demo::run(demo, settings, sos).await,
    }
}
