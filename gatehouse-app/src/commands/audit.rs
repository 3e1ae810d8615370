use crate::bootstrap::open_audit_reader;
use crate::config::Config;
use crate::service::{INCIDENT_SCAN_WINDOW, MAX_AUDIT_PAGE};
use anyhow::{Context, Result};

const DEFAULT_TAIL: usize = 20;

pub fn run(config: &Config, args: &[String]) -> Result<()> {
    match args.first().map(|s| s.as_str()) {
        Some("verify") => verify(config),
        Some("tail") => tail(config, parse_limit(args.get(1))?),
        Some("incidents") => incidents(config, parse_limit(args.get(1))?),
        Some(other) => anyhow::bail!("Unknown audit command '{}'. Use verify, tail or incidents.", other),
        None => anyhow::bail!("Usage: gatehouse audit <verify|tail [N]|incidents [N]>"),
    }
}

fn parse_limit(arg: Option<&String>) -> Result<usize> {
    match arg {
        Some(value) => {
            let n: usize = value
                .parse()
                .with_context(|| format!("Invalid count '{}'", value))?;
            Ok(n.clamp(1, MAX_AUDIT_PAGE))
        }
        None => Ok(DEFAULT_TAIL),
    }
}

fn verify(config: &Config) -> Result<()> {
    let mut settings = config.audit.clone();
    // Report the break point instead of refusing to open.
    settings.verify_on_open = false;
    let log = open_audit_reader(&settings)?;

    let verification = log.verify_chain()?;
    if verification.ok {
        println!("✓ Audit chain intact ({} entries)", verification.entries_checked);
        Ok(())
    } else {
        let index = verification.broken_at_index.unwrap_or(verification.entries_checked);
        println!("✗ Audit chain broken at index {}", index);
        anyhow::bail!("CHAIN_BROKEN at index {}", index);
    }
}

fn tail(config: &Config, limit: usize) -> Result<()> {
    let log = open_audit_reader(&config.audit)?;
    for entry in log.get_logs(limit)?.iter().rev() {
        println!("{}", serde_json::to_string(entry)?);
    }
    Ok(())
}

fn incidents(config: &Config, limit: usize) -> Result<()> {
    let log = open_audit_reader(&config.audit)?;
    let incidents = log.incidents(limit, INCIDENT_SCAN_WINDOW)?;
    if incidents.is_empty() {
        println!("No security incidents recorded");
    }
    for entry in incidents.iter().rev() {
        println!(
            "{}  {:<28} actor={} ip={} resource={}:{}",
            entry.timestamp, entry.action, entry.actor.id, entry.actor.ip, entry.resource.kind, entry.resource.id
        );
    }
    Ok(())
}
