//! Response rendering
//!
//! Builds outbound texts and inline keyboards. All callback payloads are
//! produced through [`CallbackAction::encode`] so the decoder and the
//! keyboards cannot drift apart.

use tgbot_core::edit::FileListing;
use tgbot_core::registry::TabRecord;
use tgbot_core::rules::Signal;
use tgbot_core::state::{Interval, Mode, UserState};
use tgbot_mux::ShellJob;

use crate::callback::CallbackAction;
use crate::transport::{Button, Outbound};

fn button(label: impl Into<String>, action: CallbackAction) -> Button {
    Button::new(label, action.encode())
}

pub fn login_prompt(chat_id: i64) -> Outbound {
    Outbound::text(chat_id, "Please log in first: /login <server_ip> <key>")
}

pub fn help(chat_id: i64) -> Outbound {
    Outbound::text(
        chat_id,
        "Plain text runs as a shell command in the active tab.\n\
         Commands: /tabs, /interval, /refresh, /edit, /jobs, /claude, /cancel\n\
         Login: /login <server_ip> <key>",
    )
}

pub fn main_menu(chat_id: i64, state: &UserState) -> Outbound {
    let mode_row = match state.mode {
        Mode::Normal => vec![button("CLAUDE", CallbackAction::ModeClaude)],
        Mode::Claude => vec![button("SHELL", CallbackAction::ModeShell)],
    };
    Outbound::text(chat_id, "Control panel:").with_buttons(vec![
        vec![button("Tabs", CallbackAction::TabList)],
        vec![button("Interval", CallbackAction::IntervalList)],
        vec![button("Refresh", CallbackAction::RefreshNow)],
        vec![button("Edit", CallbackAction::EditList)],
        vec![button("Jobs", CallbackAction::JobsList)],
        mode_row,
    ])
}

pub fn tabs_menu(chat_id: i64, tabs: &[TabRecord], active_tab_id: Option<&str>) -> Outbound {
    let mut rows: Vec<Vec<Button>> = Vec::with_capacity(tabs.len() + 1);
    for tab in tabs {
        let marker = if Some(tab.tab_id.as_str()) == active_tab_id {
            "* "
        } else {
            ""
        };
        rows.push(vec![
            button(
                format!("{marker}{}", tab.display_name),
                CallbackAction::TabSelect(tab.tab_id.clone()),
            ),
            button("rename", CallbackAction::TabRename(tab.tab_id.clone())),
            button("close", CallbackAction::TabClose(tab.tab_id.clone())),
        ]);
    }
    rows.push(vec![button("+ new tab", CallbackAction::TabNew)]);
    Outbound::text(chat_id, "Select a tab:").with_buttons(rows)
}

pub fn interval_menu(chat_id: i64, current: Interval) -> Outbound {
    let rows = Interval::ALL
        .iter()
        .map(|interval| {
            let marker = if *interval == current { "* " } else { "" };
            vec![button(
                format!("{marker}{}", interval.label()),
                CallbackAction::IntervalSet(*interval),
            )]
        })
        .collect();
    Outbound::text(chat_id, "Capture interval:").with_buttons(rows)
}

pub fn jobs_menu(chat_id: i64, jobs: &[ShellJob]) -> Outbound {
    let mut rows = vec![vec![button("CTRL-Z", CallbackAction::JobsCtrlZ)]];
    for job in jobs {
        let label = format!("#{} {:.24}", job.job_id, job.command);
        rows.push(vec![button(label, CallbackAction::JobsBg(job.job_id.clone()))]);
    }
    Outbound::text(chat_id, "Jobs:").with_buttons(rows)
}

pub fn edit_menu(chat_id: i64, cwd: &str, listing: &FileListing) -> Outbound {
    let mut rows: Vec<Vec<Button>> = listing
        .files
        .iter()
        .map(|name| vec![button(name.clone(), CallbackAction::EditOpen(name.clone()))])
        .collect();
    if listing.has_more {
        rows.push(vec![Button::new(
            format!("({} files total, page {})", listing.total, listing.page + 1),
            CallbackAction::EditList.encode(),
        )]);
    }
    Outbound::text(chat_id, format!("Directory: {cwd}\nPick a file to edit:")).with_buttons(rows)
}

/// Offer to recreate a tab whose backing session is gone.
pub fn recreate_offer(chat_id: i64, tab_id: &str) -> Outbound {
    Outbound::text(chat_id, "The terminal session for this tab is gone.").with_buttons(vec![vec![
        button("Recreate", CallbackAction::TabRecreate(tab_id.to_string())),
    ]])
}

/// Buttons attached to a prompt-rule match; actions are literal keystrokes.
pub fn prompt_buttons(chat_id: i64, signal: &Signal) -> Outbound {
    let rows = signal
        .buttons
        .iter()
        .map(|spec| vec![button(spec.label.clone(), CallbackAction::Prompt(spec.action.clone()))])
        .collect();
    Outbound::text(chat_id, "Interactive prompt detected:").with_buttons(rows)
}
