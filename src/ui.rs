//! Colored terminal status lines.
//!
//! Every tool prints the same shapes: a bold header per phase, then indented
//! result lines underneath it.

use colored::*;

/// Bold blue phase header, preceded by a blank line.
pub fn step(msg: &str) {
    println!("\n{}", msg.blue().bold());
}

pub fn ok(msg: &str) {
    println!("   ✅ {}", msg);
}

/// Already done or nothing to do.
pub fn skip(msg: &str) {
    println!("   ℹ️  {}", msg);
}

pub fn info(msg: &str) {
    println!("   👉 {}", msg);
}

pub fn warn(msg: &str) {
    println!("   {}", format!("⚠️  {}", msg).yellow());
}

pub fn fail(msg: &str) {
    eprintln!("{}", format!("❌ {}", msg).red());
}

fn would_line(action: &str, detail: &str) -> String {
    format!("would {}: {}", action, detail)
}

/// Output of `--dry-run` for an action that was not performed.
pub fn would(action: &str, detail: &str) {
    println!("   {} {}", "[dry-run]".magenta(), would_line(action, detail));
}

pub fn done(msg: &str) {
    println!("\n{}", format!("✅ {}", msg).green().bold());
}

pub fn banner(tool: &str) {
    let host = sys_info::hostname().unwrap_or_else(|_| "unknown".to_string());
    let os = sys_info::linux_os_release()
        .ok()
        .and_then(|r| r.pretty_name)
        .unwrap_or_else(|| "Linux".to_string());
    println!("{}", format!("🍓 {} on {} ({})", tool, host, os).green().bold());
}
