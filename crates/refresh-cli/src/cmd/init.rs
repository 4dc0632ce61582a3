use crate::output::print_json;
use refresh_core::config::Config;
use refresh_core::{io, paths};
use std::path::Path;

pub fn run(root: &Path, json: bool) -> anyhow::Result<()> {
    let path = paths::config_path(root);
    let yaml = Config::template().to_yaml()?;
    let created = io::write_if_missing(&path, yaml.as_bytes())?;

    if json {
        print_json(&serde_json::json!({
            "config": path,
            "created": created,
        }))?;
    } else if created {
        println!("Wrote {}", path.display());
        println!("Point steps.* at your update jobs, then run `refresh check`.");
    } else {
        println!("{} already exists; left unchanged.", path.display());
    }
    Ok(())
}
