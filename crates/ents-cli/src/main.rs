//! Run a query program against a JSON fixture.
//!
//! ```text
//! ents <fixture.json> <query-file|->
//! ```
//!
//! Arguments fall back to `ENTS_FIXTURE` / `ENTS_QUERY`. The stack left by
//! the program is written to stdout as JSON.

use std::{
    io::{self, Read, Write},
    path::{Path, PathBuf},
};

use ents_query::QueryStack;
use ents_store::EntitySet;
use eyre::{WrapErr, eyre};
use serde_json::Value;
use tracing::{debug, info};

fn arg_or_env(args: &mut impl Iterator<Item = String>, var: &str) -> Option<String> {
    args.next().or_else(|| std::env::var(var).ok())
}

fn read_program(source: &str) -> eyre::Result<String> {
    if source == "-" {
        let mut text = String::new();
        io::stdin()
            .read_to_string(&mut text)
            .wrap_err("failed to read program from stdin")?;
        return Ok(text);
    }
    std::fs::read_to_string(source).wrap_err_with(|| format!("failed to read program {source}"))
}

fn load_fixture(path: &Path) -> eyre::Result<EntitySet> {
    let text = std::fs::read_to_string(path)
        .wrap_err_with(|| format!("failed to read fixture {}", path.display()))?;
    let doc: Value = serde_json::from_str(&text)
        .wrap_err_with(|| format!("fixture {} is not valid JSON", path.display()))?;

    let mut es = EntitySet::new();
    es.import_json(&doc)?;
    info!(
        entities = es.size(),
        defs = es.component_defs().len(),
        "loaded fixture"
    );
    Ok(es)
}

fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("ents_cli=info".parse()?),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let fixture = arg_or_env(&mut args, "ENTS_FIXTURE")
        .map(PathBuf::from)
        .ok_or_else(|| eyre!("usage: ents <fixture.json> <query-file|->"))?;
    let source = arg_or_env(&mut args, "ENTS_QUERY").unwrap_or_else(|| "-".to_string());

    let mut es = load_fixture(&fixture)?;
    let program = read_program(&source)?;
    debug!(bytes = program.len(), "read program");

    let mut vm = QueryStack::with_store(&mut es);
    vm.run(&program)?;
    let out = serde_json::to_string_pretty(&vm.to_json())?;

    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{out}")?;
    Ok(())
}
