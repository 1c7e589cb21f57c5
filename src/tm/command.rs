//! Operator command grammar for the interactive session.

use crate::tm::error::{Result, SupervisorError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Status,
    Start(String),
    Stop(String),
    Restart(String),
    Reload,
    Exit,
    Help,
}

impl Command {
    /// Parse one input line. Returns `Ok(None)` for blank lines.
    pub fn parse(line: &str) -> Result<Option<Command>> {
        let tokens: Vec<&str> = line.split_whitespace().collect();
        let Some(&head) = tokens.first() else {
            return Ok(None);
        };

        let usage = |u: &str| SupervisorError::Usage {
            usage: u.to_string(),
        };

        let cmd = match head {
            "status" => bare(&tokens, "status", usage)?,
            "start" => Command::Start(one_name(&tokens, "start <program>", usage)?),
            "stop" => Command::Stop(one_name(&tokens, "stop <program>", usage)?),
            "restart" => Command::Restart(one_name(&tokens, "restart <program>", usage)?),
            "reload" => bare(&tokens, "reload", usage)?,
            "exit" => bare(&tokens, "exit", usage)?,
            "help" => bare(&tokens, "help", usage)?,
            other => {
                return Err(SupervisorError::Usage {
                    usage: format!("unknown command {other:?} (try 'help')"),
                })
            }
        };
        Ok(Some(cmd))
    }

    /// Usage text shown at boot and by `help`.
    pub fn usage_text() -> &'static str {
        "commands:\n\
         \x20 status                  show each program and its instance counts\n\
         \x20 start <program>         start a program by name\n\
         \x20 stop <program>          stop a running program by name\n\
         \x20 restart <program>       stop then start a program by name\n\
         \x20 reload                  re-read the configuration file and apply it\n\
         \x20 help                    show this text\n\
         \x20 exit                    stop every program and quit"
    }
}

fn bare(tokens: &[&str], usage: &str, mk: impl Fn(&str) -> SupervisorError) -> Result<Command> {
    if tokens.len() != 1 {
        return Err(mk(usage));
    }
    Ok(match tokens[0] {
        "status" => Command::Status,
        "reload" => Command::Reload,
        "exit" => Command::Exit,
        _ => Command::Help,
    })
}

fn one_name(tokens: &[&str], usage: &str, mk: impl Fn(&str) -> SupervisorError) -> Result<String> {
    if tokens.len() != 2 {
        return Err(mk(usage));
    }
    Ok(tokens[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_command() {
        assert_eq!(Command::parse("status").unwrap(), Some(Command::Status));
        assert_eq!(
            Command::parse("  start web ").unwrap(),
            Some(Command::Start("web".to_string()))
        );
        assert_eq!(
            Command::parse("stop web").unwrap(),
            Some(Command::Stop("web".to_string()))
        );
        assert_eq!(
            Command::parse("restart web").unwrap(),
            Some(Command::Restart("web".to_string()))
        );
        assert_eq!(Command::parse("reload").unwrap(), Some(Command::Reload));
        assert_eq!(Command::parse("exit").unwrap(), Some(Command::Exit));
        assert_eq!(Command::parse("help").unwrap(), Some(Command::Help));
    }

    #[test]
    fn blank_line_is_none() {
        assert_eq!(Command::parse("").unwrap(), None);
        assert_eq!(Command::parse("   ").unwrap(), None);
    }

    #[test]
    fn missing_argument_is_usage_error() {
        let err = Command::parse("start").unwrap_err();
        assert_eq!(err.as_label(), "usage_error");
        assert!(err.to_string().contains("start <program>"));
    }

    #[test]
    fn extra_arguments_are_usage_errors() {
        assert!(Command::parse("reload now").is_err());
        assert!(Command::parse("stop web extra").is_err());
        assert!(Command::parse("status -v").is_err());
    }

    #[test]
    fn unknown_command_is_rejected() {
        let err = Command::parse("frobnicate web").unwrap_err();
        assert!(err.to_string().contains("unknown command"));
    }
}
