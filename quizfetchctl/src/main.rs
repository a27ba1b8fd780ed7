use clap::Parser;
use tracing_subscriber::EnvFilter;

fn main() {
    let cli = quizfetchctl::Cli::parse();
    init_tracing(cli.verbose);
    if let Err(err) = quizfetchctl::run(cli) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose {
        "info,quizfetch_core=debug,quizfetchctl=debug,chromiumoxide=warn"
    } else {
        "info,chromiumoxide=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}
