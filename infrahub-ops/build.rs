// Build script to embed the pre-built neo4j watchdog helpers.
//
// Helpers are taken from NEO4J_WATCHDOG_DIR, or from ./embedded next to this
// manifest. A missing helper is embedded as an empty blob and reported at run
// time when a community edition freeze needs it.

use std::fs;
use std::path::PathBuf;

const HELPERS: [&str; 2] = ["neo4j_watchdog_linux_amd64", "neo4j_watchdog_linux_arm64"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(std::env::var("OUT_DIR")?);
    let source_dir = match std::env::var_os("NEO4J_WATCHDOG_DIR") {
        Some(dir) => PathBuf::from(dir),
        None => PathBuf::from(std::env::var("CARGO_MANIFEST_DIR")?).join("embedded"),
    };

    println!("cargo:rerun-if-env-changed=NEO4J_WATCHDOG_DIR");
    for helper in HELPERS {
        let source = source_dir.join(helper);
        println!("cargo:rerun-if-changed={}", source.display());

        let target = out_dir.join(helper);
        if source.is_file() {
            fs::copy(&source, &target)?;
        } else {
            println!(
                "cargo:warning=neo4j watchdog helper {} not found; embedding an empty placeholder",
                helper
            );
            fs::write(&target, b"")?;
        }
    }

    Ok(())
}
