//! Terminal output for the proctor CLI

use chrono::{DateTime, Utc};
use colored::Colorize;
use proctor_proxy::lease::PortLease;
use proctor_proxy::GatewayConfig;

/// Print the startup summary
pub fn print_serving(config: &GatewayConfig, gateway_port: u16) {
    let version = env!("CARGO_PKG_VERSION");
    eprintln!();
    eprintln!(
        "  {} {}",
        "proctor".truecolor(204, 102, 0).bold(),
        format!("v{}", version).white()
    );
    eprintln!(
        "  {} {}:{}",
        "Gateway:".white(),
        config.bind_addr,
        gateway_port.to_string().green()
    );
    eprintln!(
        "  {} {}-{} ({} ports)",
        "Workers:".white(),
        config.port_range.start,
        config.port_range.end,
        config.port_range.len()
    );
    eprintln!(
        "  {} {}",
        "Leases: ".white(),
        config.database.display().to_string().truecolor(150, 150, 150)
    );
    eprintln!();
}

/// Print leases as a table
pub fn print_leases(leases: &[PortLease], now: DateTime<Utc>) {
    if leases.is_empty() {
        eprintln!("{}", "No port leases.".truecolor(150, 150, 150));
        return;
    }

    println!(
        "{:<6} {:<36} {:<8} {:>10} {:>8}  {}",
        "PORT".bold(),
        "SESSION".bold(),
        "STATE".bold(),
        "SECONDS".bold(),
        "PERIODS".bold(),
        "LAST ACTIVITY".bold()
    );
    for lease in leases {
        let state = if lease.active {
            "active".green()
        } else {
            "idle".truecolor(150, 150, 150)
        };
        let last_activity = lease
            .last_activity_at
            .map_or_else(|| "-".to_string(), |at| at.format("%Y-%m-%d %H:%M:%S").to_string());
        println!(
            "{:<6} {:<36} {:<8} {:>10} {:>8}  {}",
            lease.port,
            lease.session_id,
            state,
            lease.elapsed_seconds(now),
            lease.sessions_started,
            last_activity
        );
    }
}

pub fn print_released(session_id: &str, port: u16, seconds: u64) {
    eprintln!(
        "{} lease for {} on port {} ({} seconds counted)",
        "Released".green(),
        session_id,
        port,
        seconds
    );
}

pub fn print_deleted(session_id: &str, port: u16) {
    eprintln!(
        "{} lease for {}; port {} is free again",
        "Deleted".yellow(),
        session_id,
        port
    );
}

pub fn print_queued(id: i64, target: &str, action: &str) {
    eprintln!("{} notification #{}: {} {}", "Queued".green(), id, action, target);
}
