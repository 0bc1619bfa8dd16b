use awskit::{app, cli::Cli, render};
use clap::Parser;

#[tokio::main]
async fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = if err.use_stderr() { render::EXIT_USAGE } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let outcome = app::run(cli).await;
    outcome.print();
    std::process::exit(outcome.code);
}
