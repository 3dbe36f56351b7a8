//! Tree command implementation

use anyhow::Result;
use colored::*;
use eco_modules::Runtime;

/// Print the namespace tree, optionally with every module tree
pub async fn tree(runtime: &Runtime, namespaces: &[String], modules: bool) -> Result<()> {
    let root = runtime.root();
    if !namespaces.is_empty() {
        root.use_modules(namespaces, &[] as &[&str]).await?;
    }

    print!("{}", root.namespace_tree());

    if modules {
        for name in runtime.namespace_names() {
            let namespace = runtime.require_namespace(&name)?;
            println!("\n{} {}", "→".blue(), name.bold());
            let listing = namespace.modules_tree()?;
            if listing.is_empty() {
                println!("  (no modules)");
            } else {
                for line in listing.lines() {
                    println!("  {}", line);
                }
            }
        }
    }

    Ok(())
}
