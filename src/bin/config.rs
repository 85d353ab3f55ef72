use anyhow::Result;
use clap::Parser;
use convoscope::{logging, Settings};

#[derive(Parser, Debug)]
#[command(
    name = "convoscope-config",
    about = "Print the effective configuration as JSON (password redacted)"
)]
struct ConfigCli {
    #[command(flatten)]
    settings: Settings,
}

fn main() -> Result<()> {
    let cli = ConfigCli::parse();
    logging::init(cli.settings.verbose);
    let config = cli.settings.build_config()?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}
