use anyhow::Result;

use sim_sms_reader::cli::commands::run_cli;

fn main() -> Result<()> {
    run_cli()
}
