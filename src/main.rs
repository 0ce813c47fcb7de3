use clap::Parser;
use medtk::cli::Cli;
use medtk::logger;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    logger::init_cli_logger(cli.verbose, cli.log_json);
    tracing::debug!(command = ?cli.command, "starting medtk");

    if let Err(err) = cli.run().await {
        tracing::error!("{err:#}");
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}
