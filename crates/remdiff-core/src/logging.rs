//! Tracing integration for diagnostics.
//!
//! All output goes to standard error so it never mixes with proxied diff
//! output. `--debug` drops the filter to debug level; `RUST_LOG` overrides
//! either default.

use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};

/// Initialize the logging system.
pub fn init(debug: bool) -> Result<()> {
    let default = if debug {
        "remdiff=debug,remdiff_core=debug,remdiff_cli=debug"
    } else {
        "remdiff=warn,remdiff_core=warn,remdiff_cli=warn"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(debug)
        .try_init()
        .map_err(|e| Error::io("init logging", std::io::Error::other(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_safe_to_call_once() {
        // A second call in the same process returns an error rather than
        // panicking; either outcome is fine here.
        let _ = init(false);
        assert!(init(true).is_err());
    }
}
