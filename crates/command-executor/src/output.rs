//! Process output, one line at a time

/// A line a process wrote, without its trailing newline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// Written to stdout
    Stdout(String),
    /// Written to stderr
    Stderr(String),
}
