use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing_subscriber::EnvFilter;

use livebuilder::{build_image, config, preflight};

fn usage() -> &'static str {
    "Usage:\n  livebuilder build <image.toml> <dest_dir>\n  livebuilder check"
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [cmd, config_path, dest] if cmd == "build" => {
            build(Path::new(config_path), Path::new(dest))
        }
        [cmd] if cmd == "check" => {
            preflight::check_host_tools()?;
            println!("all required host tools present");
            Ok(())
        }
        _ => bail!(usage()),
    }
}

fn build(config_path: &Path, dest: &Path) -> Result<()> {
    preflight::check_host_tools()?;
    let descriptor = config::load_image_config(config_path)
        .with_context(|| format!("loading build configuration '{}'", config_path.display()))?;
    build_image(&descriptor, dest)
        .with_context(|| format!("building image into '{}'", dest.display()))?;
    println!("image built: {}", dest.display());
    Ok(())
}
