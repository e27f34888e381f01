//! Colourised status lines written into terminal streams.
//!
//! These are the only user-visible error surface: there is no separate
//! structured error channel, so every notice is plain text with ANSI colour.

const RESET: &str = "\x1b[0m";
const GREEN: &str = "\x1b[1;32m";
const YELLOW: &str = "\x1b[1;33m";
const RED: &str = "\x1b[1;31m";
const DIM: &str = "\x1b[2m";

/// Banner shown once when a fresh session is created
pub fn session_banner(session_id: &str, working_dir: &str) -> String {
    format!(
        "{GREEN}Terminal session started{RESET}\r\n\
         {DIM}Session: {session_id}{RESET}\r\n\
         {DIM}Working directory: {working_dir}{RESET}\r\n\r\n"
    )
}

/// Notice sent when the shell process terminates
pub fn exit_notice(code: u32, signal: Option<&str>) -> String {
    match signal {
        Some(signal) => format!("\r\n{YELLOW}[Process terminated by signal: {signal}]{RESET}\r\n"),
        None => format!("\r\n{YELLOW}[Process exited with code {code}]{RESET}\r\n"),
    }
}

/// Notice sent to a transport that lost its session to a newer connection
pub fn superseded_notice() -> String {
    format!("\r\n{YELLOW}[Session attached from another connection]{RESET}\r\n")
}

/// Error line, used for spawn and runtime shell faults
pub fn error_line(message: &str) -> String {
    format!("\r\n{RED}Error: {message}{RESET}\r\n")
}

/// Minimal prompt hint sent on reconnect when there is nothing to replay
pub fn prompt_hint() -> String {
    "\r\n$ ".to_string()
}
