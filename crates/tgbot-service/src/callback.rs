//! Callback-data grammar
//!
//! Button payloads use a prefix-colon form (`tab:select:<tab_id>`). The raw
//! string is decoded into [`CallbackAction`] before any routing happens, so
//! an unknown or malformed payload is a typed error, not a silent miss.

use thiserror::Error;

use tgbot_core::state::Interval;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("bad callback data: {0}")]
pub struct BadCallback(pub String);

/// Decoded button press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackAction {
    TabList,
    TabNew,
    TabSelect(String),
    TabRename(String),
    TabClose(String),
    /// Recreate the session behind a broken tab (offered on SessionMissing).
    TabRecreate(String),
    IntervalList,
    IntervalSet(Interval),
    RefreshNow,
    EditList,
    EditOpen(String),
    EditSave(String),
    JobsList,
    JobsCtrlZ,
    JobsBg(String),
    ModeClaude,
    ModeShell,
    /// Literal text from a prompt-rule button, sent to the terminal.
    Prompt(String),
}

impl CallbackAction {
    /// Encode back to wire form. `parse(x.encode()) == x` for every action.
    pub fn encode(&self) -> String {
        match self {
            CallbackAction::TabList => "tab:list".to_string(),
            CallbackAction::TabNew => "tab:new".to_string(),
            CallbackAction::TabSelect(id) => format!("tab:select:{id}"),
            CallbackAction::TabRename(id) => format!("tab:rename:{id}"),
            CallbackAction::TabClose(id) => format!("tab:close:{id}"),
            CallbackAction::TabRecreate(id) => format!("tab:recreate:{id}"),
            CallbackAction::IntervalList => "interval:list".to_string(),
            CallbackAction::IntervalSet(interval) => format!("interval:set:{}", interval.token()),
            CallbackAction::RefreshNow => "refresh:now".to_string(),
            CallbackAction::EditList => "edit:list".to_string(),
            CallbackAction::EditOpen(path) => format!("edit:open:{path}"),
            CallbackAction::EditSave(id) => format!("edit:save:{id}"),
            CallbackAction::JobsList => "jobs:list".to_string(),
            CallbackAction::JobsCtrlZ => "jobs:ctrlz".to_string(),
            CallbackAction::JobsBg(id) => format!("jobs:bg:{id}"),
            CallbackAction::ModeClaude => "mode:claude".to_string(),
            CallbackAction::ModeShell => "mode:shell".to_string(),
            CallbackAction::Prompt(action) => format!("prompt:{action}"),
        }
    }

    pub fn parse(data: &str) -> Result<Self, BadCallback> {
        let bad = || BadCallback(data.to_string());
        let mut parts = data.splitn(3, ':');
        let prefix = parts.next().ok_or_else(bad)?;
        let verb = parts.next();
        let arg = parts.next();

        let nonempty = |value: Option<&str>| -> Result<String, BadCallback> {
            match value {
                Some(v) if !v.is_empty() => Ok(v.to_string()),
                _ => Err(bad()),
            }
        };

        match (prefix, verb) {
            ("tab", Some("list")) if arg.is_none() => Ok(CallbackAction::TabList),
            ("tab", Some("new")) if arg.is_none() => Ok(CallbackAction::TabNew),
            ("tab", Some("select")) => Ok(CallbackAction::TabSelect(nonempty(arg)?)),
            ("tab", Some("rename")) => Ok(CallbackAction::TabRename(nonempty(arg)?)),
            ("tab", Some("close")) => Ok(CallbackAction::TabClose(nonempty(arg)?)),
            ("tab", Some("recreate")) => Ok(CallbackAction::TabRecreate(nonempty(arg)?)),
            ("interval", Some("list")) if arg.is_none() => Ok(CallbackAction::IntervalList),
            ("interval", Some("set")) => {
                let token = nonempty(arg)?;
                Interval::parse(&token).map(CallbackAction::IntervalSet).ok_or_else(bad)
            }
            ("refresh", Some("now")) if arg.is_none() => Ok(CallbackAction::RefreshNow),
            ("edit", Some("list")) if arg.is_none() => Ok(CallbackAction::EditList),
            ("edit", Some("open")) => Ok(CallbackAction::EditOpen(nonempty(arg)?)),
            ("edit", Some("save")) => Ok(CallbackAction::EditSave(nonempty(arg)?)),
            ("jobs", Some("list")) if arg.is_none() => Ok(CallbackAction::JobsList),
            ("jobs", Some("ctrlz")) if arg.is_none() => Ok(CallbackAction::JobsCtrlZ),
            ("jobs", Some("bg")) => Ok(CallbackAction::JobsBg(nonempty(arg)?)),
            ("mode", Some("claude")) if arg.is_none() => Ok(CallbackAction::ModeClaude),
            ("mode", Some("shell")) if arg.is_none() => Ok(CallbackAction::ModeShell),
            ("prompt", Some(action)) => {
                // Everything after the first colon is the literal keystroke
                // text, which may itself contain colons.
                let mut text = action.to_string();
                if let Some(rest) = arg {
                    text.push(':');
                    text.push_str(rest);
                }
                if text.is_empty() {
                    return Err(bad());
                }
                Ok(CallbackAction::Prompt(text))
            }
            _ => Err(bad()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_documented_surface() {
        let cases = [
            ("tab:list", CallbackAction::TabList),
            ("tab:new", CallbackAction::TabNew),
            ("tab:select:abc", CallbackAction::TabSelect("abc".to_string())),
            ("tab:rename:abc", CallbackAction::TabRename("abc".to_string())),
            ("tab:close:abc", CallbackAction::TabClose("abc".to_string())),
            ("interval:list", CallbackAction::IntervalList),
            (
                "interval:set:5m",
                CallbackAction::IntervalSet(Interval::FiveMinutes),
            ),
            ("refresh:now", CallbackAction::RefreshNow),
            ("edit:list", CallbackAction::EditList),
            (
                "edit:open:notes.txt",
                CallbackAction::EditOpen("notes.txt".to_string()),
            ),
            ("edit:save:e1", CallbackAction::EditSave("e1".to_string())),
            ("jobs:list", CallbackAction::JobsList),
            ("jobs:ctrlz", CallbackAction::JobsCtrlZ),
            ("jobs:bg:2", CallbackAction::JobsBg("2".to_string())),
            ("mode:claude", CallbackAction::ModeClaude),
            ("mode:shell", CallbackAction::ModeShell),
            ("prompt:y", CallbackAction::Prompt("y".to_string())),
        ];
        for (data, expected) in cases {
            assert_eq!(CallbackAction::parse(data).unwrap(), expected, "{data}");
        }
    }

    #[test]
    fn encode_roundtrips() {
        let actions = [
            CallbackAction::TabList,
            CallbackAction::TabSelect("x".to_string()),
            CallbackAction::TabRecreate("x".to_string()),
            CallbackAction::IntervalSet(Interval::Never),
            CallbackAction::Prompt("git push".to_string()),
        ];
        for action in actions {
            assert_eq!(CallbackAction::parse(&action.encode()).unwrap(), action);
        }
    }

    #[test]
    fn rejects_malformed_data() {
        for data in [
            "",
            "tab",
            "tab:select",
            "tab:select:",
            "tab:explode:x",
            "interval:set:2h",
            "nope:list",
            "refresh:now:extra",
        ] {
            assert!(CallbackAction::parse(data).is_err(), "{data:?}");
        }
    }

    #[test]
    fn prompt_action_may_contain_colons() {
        assert_eq!(
            CallbackAction::parse("prompt:a:b:c").unwrap(),
            CallbackAction::Prompt("a:b:c".to_string())
        );
    }
}
