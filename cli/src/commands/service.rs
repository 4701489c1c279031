// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Service commands
//!
//! Commands: add, deploy, start, stop, status, dump

use super::{block_on, with_registry, CommandContext};
use anyhow::{Context, Result};
use colored::Colorize;
use pop_core::application::registry::{DumpFormat, ServiceStatus};
use pop_core::domain::settings::{parse_option, Settings};
use std::io::Write;
use std::sync::Arc;
use tracing::info;

pub fn add(ctx: &CommandContext, name: &str, service_type: &str, options: &[String]) -> Result<()> {
    let mut settings = Settings::new();
    for option in options {
        let (key, value) = parse_option(option)?;
        settings.insert(key, value);
    }
    with_registry(ctx, |registry| async move {
        registry.add(name, service_type, &settings).await?;
        Ok(())
    })
}

pub fn deploy(ctx: &CommandContext, name: &str, machine: Option<&str>) -> Result<()> {
    with_registry(ctx, |registry| async move {
        let machines = registry.deploy(name, machine).await?;
        info!(service = name, machines = ?machines, "Placement updated");
        Ok(())
    })
}

/// Run `name` in this process until SIGTERM/SIGINT.
pub fn start(ctx: &CommandContext, name: &str) -> Result<()> {
    block_on(async {
        let store = ctx.connect().await?;
        let registry = ctx.registry(Arc::clone(&store));
        let running = registry.start(name).await?;
        info!(service = name, descriptor = ?running.descriptor(), "Running; send SIGTERM to stop");
        running.wait_for_termination().await?;
        store.close().await?;
        Ok(())
    })
}

pub fn stop(ctx: &CommandContext, name: &str) -> Result<()> {
    with_registry(ctx, |registry| async move {
        let pid = registry.stop(name).await?;
        info!(service = name, pid, "Stopped");
        Ok(())
    })
}

pub fn status(ctx: &CommandContext, name: &str) -> Result<()> {
    let status = with_registry(ctx, |registry| async move { Ok(registry.status(name).await?) })?;
    println!("{}", render_status(&status));
    Ok(())
}

pub fn dump(ctx: &CommandContext, format: &str) -> Result<()> {
    let format: DumpFormat = format.parse()?;
    let output = with_registry(ctx, |registry| async move { Ok(registry.dump(format).await?) })?;
    let mut stdout = std::io::stdout().lock();
    stdout
        .write_all(output.as_bytes())
        .context("Failed to write dump")?;
    Ok(())
}

fn render_status(status: &ServiceStatus) -> String {
    let running = if status.running.is_empty() {
        "-".dimmed().to_string()
    } else {
        status
            .running
            .iter()
            .map(|m| m.green().to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let deployed = if status.machines.is_empty() {
        "-".dimmed().to_string()
    } else {
        status.machines.join(", ")
    };
    format!(
        "{} {}\n{} {}\n{} {}\n{} {}",
        "service:".bold(),
        status.name,
        "type:".bold(),
        status.service_type,
        "deployed:".bold(),
        deployed,
        "running:".bold(),
        running
    )
}
