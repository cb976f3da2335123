/*!
Line-based control commands for a running capture session.

One command per line: `ffc`, `restart`, `snap [path]`, `status`, `quit`.
*/

use std::io::BufRead;
use std::path::PathBuf;
use std::str::FromStr;
use std::thread;

use crossbeam_channel::{unbounded, Receiver};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    /// Request a flat-field correction
    Ffc,
    /// Re-open the transport
    Restart,
    /// Save the next frame, to the given path or a generated one
    Snapshot(Option<PathBuf>),
    /// Report worker state and the latest frame
    Status,
    Quit,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ControlParseError {
    #[error("Empty command")]
    Empty,

    #[error("Unknown command: {0}")]
    Unknown(String),

    #[error("{command} takes no argument (got {argument})")]
    UnexpectedArgument { command: String, argument: String },
}

impl FromStr for ControlCommand {
    type Err = ControlParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let no_argument = |command: Self| {
            if rest.is_empty() {
                Ok(command)
            } else {
                Err(ControlParseError::UnexpectedArgument {
                    command: word.to_string(),
                    argument: rest.to_string(),
                })
            }
        };

        match word.to_ascii_lowercase().as_str() {
            "" => Err(ControlParseError::Empty),
            "ffc" => no_argument(Self::Ffc),
            "restart" => no_argument(Self::Restart),
            "status" => no_argument(Self::Status),
            "quit" | "exit" => no_argument(Self::Quit),
            "snap" | "snapshot" => Ok(Self::Snapshot(
                (!rest.is_empty()).then(|| PathBuf::from(rest)),
            )),
            _ => Err(ControlParseError::Unknown(word.to_string())),
        }
    }
}

/// Parse lines from `input` on a background thread.
///
/// Blank lines are skipped and bad lines are logged. The channel disconnects at
/// end of input.
pub fn spawn_reader<R>(input: R) -> Receiver<ControlCommand>
where
    R: BufRead + Send + 'static,
{
    let (tx, rx) = unbounded();
    let spawned = thread::Builder::new()
        .name("lepton-control".to_string())
        .spawn(move || {
            for line in input.lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("⚠️ Control input failed: {}", e);
                        break;
                    }
                };
                match line.parse::<ControlCommand>() {
                    Ok(command) => {
                        if tx.send(command).is_err() {
                            break;
                        }
                    }
                    Err(ControlParseError::Empty) => {}
                    Err(e) => warn!("⚠️ {}", e),
                }
            }
            debug!("Control input closed");
        });

    if let Err(e) = spawned {
        warn!("⚠️ Control input unavailable: {}", e);
    }
    rx
}
