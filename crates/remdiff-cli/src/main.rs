//! remdiff binary entry point.

use clap::Parser;
use tracing::error;

use remdiff_cli::cli::Cli;
use remdiff_cli::compare::Comparison;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = remdiff_core::logging::init(cli.debug) {
        eprintln!("remdiff: {e}");
        std::process::exit(2);
    }

    // Broken pipes must surface as EPIPE on feeder writes, not kill the
    // process. (Child processes get the default disposition back.)
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }

    let mut comparison = Comparison::new(cli.mode());
    comparison.extra_args = cli.passthrough_args();
    comparison.new_as_empty = cli.new_as_empty();
    comparison.report_identical = cli.report_identical_files;

    let stdout = std::io::stdout();
    let rc = match comparison.compare_files(&cli.operands[0], &cli.operands[1], &mut stdout.lock())
    {
        Ok(rc) => rc,
        Err(e) => {
            error!(error = %e, "comparison failed");
            eprintln!("remdiff: {e}");
            2
        }
    };
    std::process::exit(rc);
}
