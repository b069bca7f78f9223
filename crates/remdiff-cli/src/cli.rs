//! Command-line definition.
//!
//! Mode options are mutually overriding (last one wins) and default to
//! unified output. A fixed registry of diff options is recognized and
//! forwarded verbatim; valued options are forwarded as `--name=value`.

use clap::Parser;

use crate::compare::Mode;

#[derive(Parser, Debug)]
#[command(
    name = "remdiff",
    version,
    about = "remote diff over SSH",
    after_help = "HOST should be something acceptable to your SSH client.\n\
                  Exit status is as for diff: 0 no difference, 1 difference, 2 error."
)]
pub struct Cli {
    /// Traditional diff output
    #[arg(long, overrides_with_all = ["brief", "unified", "unified_context", "side_by_side"])]
    pub normal: bool,

    /// Report only when files differ
    #[arg(short = 'q', long = "brief",
          overrides_with_all = ["normal", "unified", "unified_context", "side_by_side"])]
    pub brief: bool,

    /// Unified diff
    #[arg(short = 'u',
          overrides_with_all = ["normal", "brief", "unified_context", "side_by_side"])]
    pub unified: bool,

    /// Unified diff with NUM lines of context
    #[arg(short = 'U', long = "unified", value_name = "NUM",
          overrides_with_all = ["normal", "brief", "unified", "side_by_side"])]
    pub unified_context: Option<u32>,

    /// Side-by-side output
    #[arg(short = 'y', long = "side-by-side",
          overrides_with_all = ["normal", "brief", "unified", "unified_context"])]
    pub side_by_side: bool,

    /// Treat absent files as empty
    #[arg(short = 'N', long = "new-file")]
    pub new_file: bool,

    /// Treat absent first files as empty
    #[arg(long)]
    pub unidirectional_new_file: bool,

    /// Report when two files are identical
    #[arg(short = 's', long = "report-identical-files")]
    pub report_identical_files: bool,

    /// Enable internal tracing to standard error
    #[arg(long)]
    pub debug: bool,

    // Options forwarded verbatim to diff.
    /// Do not output common lines
    #[arg(long)]
    pub suppress_common_lines: bool,

    /// Show which C function each change is in
    #[arg(short = 'p', long)]
    pub show_c_function: bool,

    /// Expand tabs to spaces in output
    #[arg(short = 't', long)]
    pub expand_tabs: bool,

    /// Make tabs line up by prepending a tab
    #[arg(short = 'T', long)]
    pub initial_tab: bool,

    /// Do not output blank lines before empty output lines
    #[arg(long)]
    pub suppress_blank_empty: bool,

    /// Ignore case differences in file contents
    #[arg(short = 'i', long)]
    pub ignore_case: bool,

    /// Ignore changes due to tab expansion
    #[arg(short = 'E', long)]
    pub ignore_tab_expansion: bool,

    /// Ignore white space at line end
    #[arg(short = 'Z', long)]
    pub ignore_trailing_space: bool,

    /// Ignore changes in the amount of white space
    #[arg(short = 'b', long)]
    pub ignore_space_change: bool,

    /// Ignore all white space
    #[arg(short = 'w', long)]
    pub ignore_all_space: bool,

    /// Ignore changes whose lines are all blank
    #[arg(short = 'B', long)]
    pub ignore_blank_lines: bool,

    /// Strip trailing carriage return on input
    #[arg(long)]
    pub strip_trailing_cr: bool,

    /// Try hard to find a smaller set of changes
    #[arg(short = 'd', long)]
    pub minimal: bool,

    /// Assume large files and many scattered small changes
    #[arg(long)]
    pub speed_large_files: bool,

    /// Output at most WIDTH print columns
    #[arg(short = 'W', long, value_name = "WIDTH")]
    pub width: Option<u32>,

    /// Tab stops every SIZE print columns
    #[arg(long, value_name = "SIZE")]
    pub tabsize: Option<u32>,

    /// Output merged file with `#ifdef NAME' diffs
    #[arg(short = 'D', long, value_name = "NAME")]
    pub ifdef: Option<String>,

    /// Keep LINES lines of common prefix and suffix
    #[arg(long, value_name = "LINES")]
    pub horizon_lines: Option<u32>,

    /// Color output; WHEN is always, never, or auto
    #[arg(long, value_name = "WHEN")]
    pub color: Option<String>,

    /// Color palette when --color is active
    #[arg(long, value_name = "PALETTE")]
    pub palette: Option<String>,

    /// The two files to compare, each PATH or HOST:PATH
    #[arg(value_name = "[HOST:]PATH", num_args = 2, required = true)]
    pub operands: Vec<String>,
}

impl Cli {
    /// Effective output mode after last-wins resolution.
    pub fn mode(&self) -> Mode {
        if self.normal {
            Mode::Normal
        } else if self.brief {
            Mode::Brief
        } else if self.side_by_side {
            Mode::SideBySide
        } else if let Some(context) = self.unified_context {
            Mode::Unified(Some(context))
        } else {
            Mode::Unified(None)
        }
    }

    /// Empty-if-missing flags per operand position.
    pub fn new_as_empty(&self) -> [bool; 2] {
        [
            self.new_file || self.unidirectional_new_file,
            self.new_file,
        ]
    }

    /// Arguments forwarded verbatim to diff, in registry order.
    pub fn passthrough_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        let mut flag = |set: bool, name: &str| {
            if set {
                args.push(name.to_string());
            }
        };
        flag(self.suppress_common_lines, "--suppress-common-lines");
        flag(self.show_c_function, "--show-c-function");
        flag(self.expand_tabs, "--expand-tabs");
        flag(self.initial_tab, "--initial-tab");
        flag(self.suppress_blank_empty, "--suppress-blank-empty");
        flag(self.ignore_case, "--ignore-case");
        flag(self.ignore_tab_expansion, "--ignore-tab-expansion");
        flag(self.ignore_trailing_space, "--ignore-trailing-space");
        flag(self.ignore_space_change, "--ignore-space-change");
        flag(self.ignore_all_space, "--ignore-all-space");
        flag(self.ignore_blank_lines, "--ignore-blank-lines");
        flag(self.strip_trailing_cr, "--strip-trailing-cr");
        flag(self.minimal, "--minimal");
        flag(self.speed_large_files, "--speed-large-files");
        flag(self.report_identical_files, "--report-identical-files");
        if let Some(width) = self.width {
            args.push(format!("--width={width}"));
        }
        if let Some(size) = self.tabsize {
            args.push(format!("--tabsize={size}"));
        }
        if let Some(ref name) = self.ifdef {
            args.push(format!("--ifdef={name}"));
        }
        if let Some(lines) = self.horizon_lines {
            args.push(format!("--horizon-lines={lines}"));
        }
        if let Some(ref when) = self.color {
            args.push(format!("--color={when}"));
        }
        if let Some(ref palette) = self.palette {
            args.push(format!("--palette={palette}"));
        }
        args
    }
}
