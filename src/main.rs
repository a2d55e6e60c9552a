//! Convergent CLI: plan and apply declarative modules.

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "convergent",
    version,
    about = "Declarative convergence engine: plan, apply and health-check resource graphs"
)]
struct Cli {
    #[command(flatten)]
    global: convergent::cli::GlobalArgs,

    #[command(subcommand)]
    command: convergent::cli::Commands,
}

fn main() {
    let cli = Cli::parse();
    convergent::logging::init(cli.global.verbose);
    match convergent::cli::dispatch(&cli.global, cli.command) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {}", e);
            std::process::exit(e.exit_code());
        }
    }
}
