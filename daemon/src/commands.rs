//! Console command handlers.

use crossbeam_channel::Sender;
use tracing::{debug, instrument};

use loopfx_ipc::{AudioEncoding, DumpMethod, ServiceCommand, ServiceConfig, SessionUpdateMode};

use crate::config::SimulatedSession;

pub const HELP: &str = "\
commands:
  start | stop | state | quit
  prefs                      resync DSP preferences
  liveprog                   reload the liveprog script
  rate <hz>                  change the simulated output sample rate
  format float|short <n>     change encoding and buffer size in samples
  reboot | soft-reboot       rebuild the pipeline or only the capture device
  poll                       poll sessions now
  add <id> <uid> <package> [restricted]
  remove <id>
  suspend on|off             suspend devices while idle
  restricted on|off          exclude apps that forbid capture
  method policy|service      session dump source
  mode listener|poll         session update mode
  revoke                     withdraw capture authorization";

/// What a console line asks for.
#[derive(Debug, Clone)]
pub enum ConsoleAction {
    Service(ServiceCommand),
    AddSession(SimulatedSession),
    RemoveSession(i32),
    SetSampleRate(u32),
    Revoke,
    Help,
    Quit,
}

/// Parse one console line. `config` is used by `start`.
pub fn parse_line(line: &str, config: &ServiceConfig) -> Result<ConsoleAction, String> {
    let mut words = line.split_whitespace();
    let Some(command) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();

    let action = match (command, args.as_slice()) {
        ("start", []) => ConsoleAction::Service(ServiceCommand::Start {
            config: config.clone(),
        }),
        ("stop", []) => ConsoleAction::Service(ServiceCommand::Stop),
        ("state", []) => ConsoleAction::Service(ServiceCommand::GetState),
        ("prefs", []) => ConsoleAction::Service(ServiceCommand::PreferencesUpdated),
        ("liveprog", []) => ConsoleAction::Service(ServiceCommand::ReloadLiveprog),
        ("reboot", []) => ConsoleAction::Service(ServiceCommand::HardReboot),
        ("soft-reboot", []) => ConsoleAction::Service(ServiceCommand::SoftReboot),
        ("poll", []) => ConsoleAction::Service(ServiceCommand::PollSessions),
        ("rate", [hz]) => ConsoleAction::SetSampleRate(parse_number(hz)?),
        ("format", [encoding, samples]) => {
            let encoding = match *encoding {
                "float" => AudioEncoding::PcmFloat,
                "short" => AudioEncoding::PcmShort,
                other => return Err(format!("unknown encoding '{other}'")),
            };
            ConsoleAction::Service(ServiceCommand::SetStreamFormat {
                encoding,
                buffer_size: parse_number(samples)?,
            })
        }
        ("suspend", [flag]) => {
            ConsoleAction::Service(ServiceCommand::SetSuspendOnIdle(parse_flag(flag)?))
        }
        ("restricted", [flag]) => {
            ConsoleAction::Service(ServiceCommand::SetExcludeRestricted(parse_flag(flag)?))
        }
        ("method", [method]) => {
            let method = match *method {
                "policy" => DumpMethod::AudioPolicyService,
                "service" => DumpMethod::AudioService,
                other => return Err(format!("unknown dump method '{other}'")),
            };
            ConsoleAction::Service(ServiceCommand::SetDumpMethod(method))
        }
        ("mode", [mode]) => {
            let mode = match *mode {
                "listener" => SessionUpdateMode::Listener,
                "poll" => SessionUpdateMode::ContinuousPolling,
                other => return Err(format!("unknown update mode '{other}'")),
            };
            ConsoleAction::Service(ServiceCommand::SetSessionUpdateMode(mode))
        }
        ("add", [id, uid, package, rest @ ..]) if rest.len() <= 1 => {
            let capture_allowed = match rest {
                [] => true,
                ["restricted"] => false,
                _ => return Err(format!("unexpected argument '{}'", rest.join(" "))),
            };
            ConsoleAction::AddSession(SimulatedSession {
                session_id: parse_number(id)?,
                uid: parse_number(uid)?,
                package_name: package.to_string(),
                usage: "USAGE_MEDIA".to_string(),
                capture_allowed,
            })
        }
        ("remove", [id]) => ConsoleAction::RemoveSession(parse_number(id)?),
        ("revoke", []) => ConsoleAction::Revoke,
        ("help", []) => ConsoleAction::Help,
        ("quit" | "exit", []) => ConsoleAction::Quit,
        _ => return Err(format!("unknown command '{}', try 'help'", line.trim())),
    };

    Ok(action)
}

/// Send a command to the service.
#[instrument(skip(command_tx))]
pub fn send(command_tx: &Sender<ServiceCommand>, command: ServiceCommand) -> Result<(), String> {
    debug!("Sending command");
    command_tx
        .send(command)
        .map_err(|e| format!("Failed to send command: {}", e))
}

fn parse_flag(word: &str) -> Result<bool, String> {
    match word {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => Err(format!("expected on or off, got '{other}'")),
    }
}

fn parse_number<T: std::str::FromStr>(word: &str) -> Result<T, String> {
    word.parse()
        .map_err(|_| format!("'{word}' is not a valid number"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Result<ConsoleAction, String> {
        parse_line(line, &ServiceConfig::default())
    }

    #[test]
    fn test_simple_commands() {
        assert!(matches!(
            parse("start"),
            Ok(ConsoleAction::Service(ServiceCommand::Start { .. }))
        ));
        assert!(matches!(
            parse("  reboot  "),
            Ok(ConsoleAction::Service(ServiceCommand::HardReboot))
        ));
        assert!(matches!(parse("quit"), Ok(ConsoleAction::Quit)));
        assert!(matches!(parse("rate 44100"), Ok(ConsoleAction::SetSampleRate(44_100))));
    }

    #[test]
    fn test_flags_and_modes() {
        assert!(matches!(
            parse("suspend on"),
            Ok(ConsoleAction::Service(ServiceCommand::SetSuspendOnIdle(true)))
        ));
        assert!(matches!(
            parse("restricted off"),
            Ok(ConsoleAction::Service(ServiceCommand::SetExcludeRestricted(false)))
        ));
        assert!(matches!(
            parse("method service"),
            Ok(ConsoleAction::Service(ServiceCommand::SetDumpMethod(DumpMethod::AudioService)))
        ));
        assert!(matches!(
            parse("mode poll"),
            Ok(ConsoleAction::Service(ServiceCommand::SetSessionUpdateMode(
                SessionUpdateMode::ContinuousPolling
            )))
        ));
        assert!(matches!(
            parse("format short 2048"),
            Ok(ConsoleAction::Service(ServiceCommand::SetStreamFormat {
                encoding: AudioEncoding::PcmShort,
                buffer_size: 2048,
            }))
        ));
        assert!(parse("format double 2048").is_err());
        assert!(parse("suspend maybe").is_err());
    }

    #[test]
    fn test_add_session() {
        match parse("add 7 10300 com.video restricted") {
            Ok(ConsoleAction::AddSession(session)) => {
                assert_eq!(session.session_id, 7);
                assert_eq!(session.uid, 10300);
                assert_eq!(session.package_name, "com.video");
                assert!(!session.capture_allowed);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(parse("add 7 x com.video").is_err());
        assert!(parse("add 7 10300 com.video loud").is_err());
    }

    #[test]
    fn test_unknown_and_empty() {
        assert!(parse("").is_err());
        assert!(parse("dance").is_err());
        assert!(parse("stop now").is_err());
    }

    #[test]
    fn test_send_reports_disconnect() {
        let (tx, rx) = crossbeam_channel::bounded(1);
        assert!(send(&tx, ServiceCommand::Stop).is_ok());
        drop(rx);
        assert!(send(&tx, ServiceCommand::Stop).is_err());
    }
}
