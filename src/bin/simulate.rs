//! Minimal CLI driver that previews an execution without committing it.
//!
//! Runs the identical pipeline as `bin/execute.rs` — parse, align, evaluate,
//! qualify — against a throwaway in-memory gateway seeded from the same
//! input files, then reports what it would have written and drops the
//! gateway. A real deployment wraps a transactional gateway and rolls the
//! transaction back instead of discarding an in-memory copy; the engine
//! itself cannot tell the two modes apart (spec §4.4).

#![forbid(unsafe_code)]

use std::{env, fs};

use tsrule_engine::gateway::InMemoryGateway;
use tsrule_engine::orchestrator::ExecutionMode;
use tsrule_engine::{execute, ExecutionSummary};

fn parse_flag(args: &[String], key: &str) -> Option<String> {
    let mut it = args.iter();
    while let Some(a) = it.next() {
        if a == key {
            return it.next().cloned();
        }
    }
    None
}

/// `{"samples": [{"var": i64, "timestamp": i64, "value": f64|null}]}`
fn load_seed_samples(path: &str, gateway: &mut InMemoryGateway) -> anyhow::Result<usize> {
    let raw = fs::read_to_string(path)?;
    let doc: serde_json::Value = serde_json::from_str(&raw)?;
    let rows = doc
        .get("samples")
        .and_then(serde_json::Value::as_array)
        .ok_or_else(|| anyhow::anyhow!("seed file missing `samples` array"))?;
    let mut n = 0;
    for row in rows {
        let var = row
            .get("var")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("seed row missing integer `var`"))?;
        let timestamp = row
            .get("timestamp")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| anyhow::anyhow!("seed row missing integer `timestamp`"))?;
        let value = row.get("value").and_then(serde_json::Value::as_f64);
        gateway.seed(var, timestamp, value, tsrule_engine::series::Qualification::Unqualified);
        n += 1;
    }
    Ok(n)
}

fn print_summary(summary: &ExecutionSummary) {
    println!("(simulated, nothing committed)");
    println!("source variables : {:?}", summary.source_variables);
    println!("aligned timestamps: {}", summary.aligned_timestamps);
    println!("output samples   : {}", summary.output_samples);
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args: Vec<String> = env::args().collect();
    let rule_path = parse_flag(&args, "--rule")
        .ok_or_else(|| anyhow::anyhow!("usage: simulate --rule <rule.json> --seeds <seeds.json>"))?;
    let seeds_path = parse_flag(&args, "--seeds")
        .ok_or_else(|| anyhow::anyhow!("usage: simulate --rule <rule.json> --seeds <seeds.json>"))?;

    let rule_json = fs::read_to_string(&rule_path)?;

    let mut gateway = InMemoryGateway::new();
    let n = load_seed_samples(&seeds_path, &mut gateway)?;
    eprintln!("loaded {n} seed sample(s) from {seeds_path}");

    let summary = execute(&rule_json, &mut gateway, ExecutionMode::Simulate)?;
    print_summary(&summary);
    drop(gateway);
    Ok(())
}
