//! Command lines read from stdin.
//!
//! ```text
//! <port> <address> setpoint <float>
//! <port> <address> percent <int>
//! <port> <address> fluid <index>
//! <port> <address> tag <text...>
//! ```

use crossbeam::channel::Sender;
use flowbus_common::{Address, PortName};
use flowbus_poller::Command;
use std::io::BufRead;
use thiserror::Error;
use tracing::{debug, warn};

/// Why a command line was rejected.
#[derive(Debug, Error, PartialEq)]
pub enum ParseError {
    /// Fewer than the required fields.
    #[error("expected '<port> <address> <command> <value>'")]
    MissingField,
    /// The address is not a number in 1..=247.
    #[error("invalid address '{0}'")]
    BadAddress(String),
    /// Unknown command word.
    #[error("unknown command '{0}' (expected setpoint, percent, fluid or tag)")]
    UnknownCommand(String),
    /// The value does not parse for the command.
    #[error("invalid value '{value}' for {command}")]
    BadValue {
        /// Command word.
        command: &'static str,
        /// Offending value.
        value: String,
    },
}

/// Parse one command line into its port and command.
pub fn parse_command_line(line: &str) -> Result<(PortName, Command), ParseError> {
    let mut fields = line.split_whitespace();
    let port = fields.next().ok_or(ParseError::MissingField)?;
    let address = fields.next().ok_or(ParseError::MissingField)?;
    let verb = fields.next().ok_or(ParseError::MissingField)?;

    let address = address
        .parse::<u8>()
        .ok()
        .and_then(|v| Address::new(v).ok())
        .ok_or_else(|| ParseError::BadAddress(address.to_string()))?;

    let command = match verb {
        "tag" => {
            let text = fields.collect::<Vec<_>>().join(" ");
            if text.is_empty() {
                return Err(ParseError::MissingField);
            }
            Command::user_tag(address, text)
        }
        "setpoint" | "percent" | "fluid" => {
            let value = fields.next().ok_or(ParseError::MissingField)?;
            let bad = |command| ParseError::BadValue {
                command,
                value: value.to_string(),
            };
            match verb {
                "setpoint" => Command::flow_setpoint(
                    address,
                    value.parse().map_err(|_| bad("setpoint"))?,
                ),
                "percent" => Command::percent_setpoint(
                    address,
                    value.parse().map_err(|_| bad("percent"))?,
                ),
                _ => Command::fluid_index(address, value.parse().map_err(|_| bad("fluid"))?),
            }
        }
        other => return Err(ParseError::UnknownCommand(other.to_string())),
    };

    Ok((PortName::new(port), command))
}

/// Read command lines from stdin until EOF or until the receiver is gone.
///
/// Blank lines and lines starting with `#` are ignored; malformed lines
/// are logged and skipped.
pub fn spawn_stdin_reader(
    tx: Sender<(PortName, Command)>,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("flowbus-stdin".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!(error = %e, "Failed to read stdin");
                        break;
                    }
                };
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                match parse_command_line(line) {
                    Ok(parsed) => {
                        if tx.send(parsed).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(%line, error = %e, "Ignoring command line"),
                }
            }
            debug!("Stdin reader finished");
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowbus_poller::CommandKind;

    fn parse(line: &str) -> (PortName, Command) {
        parse_command_line(line).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        let (port, cmd) = parse("/dev/ttyUSB0 3 setpoint 12.5");
        assert_eq!(port.as_str(), "/dev/ttyUSB0");
        assert_eq!(cmd.address.get(), 3);
        assert_eq!(cmd.kind, CommandKind::WriteFlowSetpoint(12.5));

        assert_eq!(parse("sim0 1 percent 16000").1.kind, CommandKind::WritePercentSetpoint(16000));
        assert_eq!(parse("sim0 1 fluid 3").1.kind, CommandKind::WriteFluidIndex(3));
        assert_eq!(
            parse("sim0 1   tag  line 4 inlet").1.kind,
            CommandKind::WriteUserTag("line 4 inlet".into())
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_command_line("sim0 1"), Err(ParseError::MissingField));
        assert_eq!(parse_command_line("sim0 1 tag"), Err(ParseError::MissingField));
        assert_eq!(
            parse_command_line("sim0 0 fluid 2"),
            Err(ParseError::BadAddress("0".into()))
        );
        assert_eq!(
            parse_command_line("sim0 300 fluid 2"),
            Err(ParseError::BadAddress("300".into()))
        );
        assert_eq!(
            parse_command_line("sim0 2 purge 1"),
            Err(ParseError::UnknownCommand("purge".into()))
        );
        assert!(matches!(
            parse_command_line("sim0 2 fluid air"),
            Err(ParseError::BadValue { command: "fluid", .. })
        ));
    }
}
