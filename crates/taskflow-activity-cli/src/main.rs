use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = taskflow_activity_cli::Cli::parse();
    taskflow_activity_cli::init_tracing(cli.log_level());
    taskflow_activity_cli::run_cli(cli)
}
