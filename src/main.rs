use clap::Parser;

#[derive(Parser)]
#[command(name = "amora", about = "Live session daemon for the Amora client")]
struct Cli {
    /// API server port (overrides AMORA_API_PORT)
    #[arg(long)]
    port: Option<u16>,
}

fn main() {
    let cli = Cli::parse();

    let rt = tokio::runtime::Runtime::new().expect("Failed to create Tokio runtime");
    rt.block_on(amora_lib::run(cli.port));
}
