//! Data command implementation

use anyhow::Result;
use colored::*;
use eco_modules::Runtime;

/// Print the value `selector` resolves to in the chosen namespace
pub async fn data(
    runtime: &Runtime,
    namespace: Option<&str>,
    selector: &str,
    env: Option<&str>,
) -> Result<()> {
    let root = runtime.root();
    let target = match namespace {
        Some(name) => {
            root.use_modules(&[name], &[] as &[&str]).await?;
            runtime.require_namespace(name)?
        }
        None => root,
    };

    if let Some(env) = env {
        target.env(env);
    }

    match target.data(selector) {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("{} {} is not set in {}", "✗".red(), selector, target.name()),
    }

    Ok(())
}
