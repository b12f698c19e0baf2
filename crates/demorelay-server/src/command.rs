//! Inbound message decoding.
//!
//! A message is a JSON object carrying a session key in `path` and a task
//! name in `task`. The task is parsed into a [`Command`]; the three
//! colon-suffixed tasks carry a typed argument.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use demorelay_core::replay::UnknownEventKind;
use demorelay_core::{EventKind, HandlerId, SessionKey};
use serde::Deserialize;

const REGISTER_PREFIX: &str = "register_event_handler:";
const UNREGISTER_PREFIX: &str = "unregister_event_handler:";
const MARK_PREFIX: &str = "mark_frames:";

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown task: {0}")]
    UnknownTask(String),

    #[error(transparent)]
    UnknownEvent(#[from] UnknownEventKind),

    #[error("invalid argument for {task}: {value:?}")]
    InvalidArgument { task: &'static str, value: String },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Test,
    NewParser,
    ParseHeader,
    ParseNextFrame,
    ParseToEnd,
    ParseToEndWithMarkedFrames,
    CurrentFrame,
    FrameRate,
    InGameTick,
    TickRate,
    Playing,
    EventHandlers,
    Close,
    Shutdown,
    RegisterEventHandler(EventKind),
    UnregisterEventHandler(HandlerId),
    MarkFrames(BTreeSet<i64>),
}

impl Command {
    /// Task name without its argument, for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Test => "test",
            Self::NewParser => "new_parser",
            Self::ParseHeader => "parse_header",
            Self::ParseNextFrame => "parse_next_frame",
            Self::ParseToEnd => "parse_to_end",
            Self::ParseToEndWithMarkedFrames => "parse_to_end_with_marked_frames",
            Self::CurrentFrame => "current_frame",
            Self::FrameRate => "frame_rate",
            Self::InGameTick => "in_game_tick",
            Self::TickRate => "tick_rate",
            Self::Playing => "playing",
            Self::EventHandlers => "event_handlers",
            Self::Close => "close",
            Self::Shutdown => "shutdown",
            Self::RegisterEventHandler(_) => "register_event_handler",
            Self::UnregisterEventHandler(_) => "unregister_event_handler",
            Self::MarkFrames(_) => "mark_frames",
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(task: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = task.strip_prefix(REGISTER_PREFIX) {
            return Ok(Self::RegisterEventHandler(rest.trim().parse()?));
        }
        if let Some(rest) = task.strip_prefix(UNREGISTER_PREFIX) {
            let id = rest.parse().map_err(|_| CommandError::InvalidArgument {
                task: "unregister_event_handler",
                value: rest.to_string(),
            })?;
            return Ok(Self::UnregisterEventHandler(id));
        }
        if let Some(rest) = task.strip_prefix(MARK_PREFIX) {
            return parse_marks(rest).map(Self::MarkFrames);
        }

        Ok(match task {
            "test" => Self::Test,
            "new_parser" => Self::NewParser,
            "parse_header" => Self::ParseHeader,
            "parse_next_frame" => Self::ParseNextFrame,
            "parse_to_end" => Self::ParseToEnd,
            "parse_to_end_with_marked_frames" => Self::ParseToEndWithMarkedFrames,
            "current_frame" => Self::CurrentFrame,
            "frame_rate" => Self::FrameRate,
            "in_game_tick" => Self::InGameTick,
            "tick_rate" => Self::TickRate,
            "playing" => Self::Playing,
            "event_handlers" => Self::EventHandlers,
            "close" => Self::Close,
            "shutdown" => Self::Shutdown,
            other => return Err(CommandError::UnknownTask(other.to_string())),
        })
    }
}

/// Comma-separated positions. Items are trimmed; an empty list is valid.
fn parse_marks(list: &str) -> Result<BTreeSet<i64>, CommandError> {
    if list.trim().is_empty() {
        return Ok(BTreeSet::new());
    }
    list.split(',')
        .map(|item| {
            item.trim().parse::<i64>().map_err(|_| CommandError::InvalidArgument {
                task: "mark_frames",
                value: item.to_string(),
            })
        })
        .collect()
}

#[derive(Deserialize)]
struct RawEnvelope {
    path: String,
    task: String,
}

/// A decoded inbound message before its task is interpreted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub key: SessionKey,
    pub task: String,
}

impl Envelope {
    /// Decode the JSON object. Extra keys are ignored.
    pub fn parse(text: &str) -> Result<Self, CommandError> {
        let raw: RawEnvelope =
            serde_json::from_str(text).map_err(|e| CommandError::InvalidMessage(e.to_string()))?;
        if raw.path.is_empty() {
            return Err(CommandError::InvalidMessage("empty path".into()));
        }
        if raw.task.is_empty() {
            return Err(CommandError::InvalidMessage("empty task".into()));
        }
        Ok(Self {
            key: SessionKey::from_raw(raw.path),
            task: raw.task,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_tasks() {
        assert_eq!("test".parse::<Command>().unwrap(), Command::Test);
        assert_eq!(
            "parse_to_end_with_marked_frames".parse::<Command>().unwrap(),
            Command::ParseToEndWithMarkedFrames
        );
        assert_eq!("in_game_tick".parse::<Command>().unwrap(), Command::InGameTick);
        assert_eq!("shutdown".parse::<Command>().unwrap(), Command::Shutdown);
    }

    #[test]
    fn unknown_task() {
        let err = "parse_everything".parse::<Command>().unwrap_err();
        assert!(matches!(err, CommandError::UnknownTask(ref t) if t == "parse_everything"));
        // literal names are case-sensitive
        assert!("Test".parse::<Command>().is_err());
    }

    #[test]
    fn register_parses_event_kind() {
        assert_eq!(
            "register_event_handler:WeaponFire".parse::<Command>().unwrap(),
            Command::RegisterEventHandler(EventKind::WeaponFire)
        );
        let err = "register_event_handler:BombPlanted".parse::<Command>().unwrap_err();
        assert!(matches!(err, CommandError::UnknownEvent(_)));
    }

    #[test]
    fn unregister_parses_id() {
        assert_eq!(
            "unregister_event_handler:3".parse::<Command>().unwrap(),
            Command::UnregisterEventHandler(HandlerId(3))
        );
        let err = "unregister_event_handler:three".parse::<Command>().unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument { task: "unregister_event_handler", .. }));
    }

    #[test]
    fn mark_frames_list() {
        let cmd = "mark_frames:15, 5,10".parse::<Command>().unwrap();
        assert_eq!(cmd, Command::MarkFrames([5, 10, 15].into_iter().collect()));

        assert_eq!(
            "mark_frames:".parse::<Command>().unwrap(),
            Command::MarkFrames(BTreeSet::new())
        );
        assert!("mark_frames:1,,2".parse::<Command>().is_err());
        assert!("mark_frames:1;2".parse::<Command>().is_err());
    }

    #[test]
    fn envelope_ignores_extra_keys() {
        let env = Envelope::parse(r#"{"path":"/r/m.jsonl","task":"test","extra":1}"#).unwrap();
        assert_eq!(env.key.as_str(), "/r/m.jsonl");
        assert_eq!(env.task, "test");
    }

    #[test]
    fn envelope_rejects_bad_input() {
        for text in [
            "not json",
            r#"{"task":"test"}"#,
            r#"{"path":"m"}"#,
            r#"{"path":1,"task":"test"}"#,
            r#"{"path":"m","task":["test"]}"#,
            r#"{"path":"","task":"test"}"#,
            r#"{"path":"m","task":""}"#,
        ] {
            assert!(
                matches!(Envelope::parse(text), Err(CommandError::InvalidMessage(_))),
                "accepted: {text}"
            );
        }
    }
}
