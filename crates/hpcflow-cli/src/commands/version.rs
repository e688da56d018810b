//! Version command implementation.

use console::style;

/// Execute the version command.
pub fn execute() {
    let version = env!("CARGO_PKG_VERSION");

    println!(
        "{} {} - OCR workflow orchestration on SLURM clusters",
        style("hpcflow").cyan().bold(),
        style(format!("v{version}")).yellow()
    );
    println!();
    println!("Components:");
    println!("  hpcflow-remote  SSH sessions and file transfer");
    println!("  hpcflow-sched   Transfers, SLURM jobs and run orchestration");
    println!("  hpcflow-cli     Command-line interface");
    println!();
    println!(
        "Repository: {}",
        style("https://github.com/hpcflow/hpcflow").underlined()
    );
    println!("License:    {}", style("Apache-2.0").dim());
}
