#[cfg(not(any(target_os = "macos", unix)))]
compile_error!("Only macos and unix are currently supported");

use outlane::controller::{Outlane, find_config_file};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = find_config_file()?;
    let outlane = Outlane::load(&config_path)?;

    outlane.run().await
}
