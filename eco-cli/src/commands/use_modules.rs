//! Use command implementation

use super::render_exports;
use anyhow::Result;
use colored::*;
use eco_modules::Runtime;

/// Load `ids` after `namespaces` and print each module's exports
pub async fn use_modules(runtime: &Runtime, namespaces: &[String], ids: &[String]) -> Result<()> {
    let root = runtime.root();
    let exports = root.use_modules(namespaces, ids).await?;

    for (id, value) in ids.iter().zip(&exports) {
        println!("{} {}", "✓".green(), id.bold());
        for line in render_exports(value).lines() {
            println!("  {}", line);
        }
    }

    Ok(())
}
