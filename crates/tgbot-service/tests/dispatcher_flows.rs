//! End-to-end dispatcher flows against in-memory driver and transport

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use tgbot_core::audit::AuditLog;
use tgbot_core::auth::AuthManager;
use tgbot_core::config::{AppConfig, WhitelistEntry};
use tgbot_core::edit::EditManager;
use tgbot_core::output::ChunkLimits;
use tgbot_core::policy::CommandPolicy;
use tgbot_core::registry::TagRegistry;
use tgbot_core::rules::PromptRuleEngine;
use tgbot_mux::TerminalDriver;
use tgbot_core::state::{Mode, UserStateStore};
use tgbot_mux::testing::{InMemoryDriver, SentInput};
use tgbot_service::scheduler::{Scheduler, SchedulerDeps};
use tgbot_service::transport::RecordingTransport;
use tgbot_service::{Dispatcher, DispatcherDeps, Update, UserLocks};

const RULES: &str = r#"
rules:
  matchers:
    - id: confirm
      type: regex
      pattern: "\\?\\s*$"
      incremental_output: true
      buttons:
        - { label: "Yes", action: "y" }
"#;

struct Harness {
    _dir: TempDir,
    dispatcher: Dispatcher,
    scheduler: Scheduler,
    driver: Arc<InMemoryDriver>,
    transport: Arc<RecordingTransport>,
    states: Arc<UserStateStore>,
    registry: Arc<TagRegistry>,
    registry_path: std::path::PathBuf,
}

fn harness() -> Harness {
    let dir = TempDir::new().unwrap();
    let mut config = AppConfig::default();
    config.command_policy.blocked_patterns = vec!["rm -rf /".to_string()];
    config.whitelist_keys.insert(
        "42".to_string(),
        WhitelistEntry {
            access_key: "k".to_string(),
            server_ip: Some("1.2.3.4".to_string()),
            expires_at: None,
            admin: false,
        },
    );

    let registry_path = dir.path().join("registry.json");
    let driver = Arc::new(InMemoryDriver::new());
    let registry = Arc::new(TagRegistry::load(&registry_path).unwrap());
    let states = Arc::new(UserStateStore::load(dir.path().join("state.json")).unwrap());
    let auth = Arc::new(AuthManager::new(config.clone(), dir.path().join("config.yaml")));
    let policy = Arc::new(CommandPolicy::compile(&config.command_policy).unwrap());
    let edit = Arc::new(EditManager::new(20));
    let audit = Arc::new(AuditLog::new(tgbot_core::config::AuditConfig {
        path: dir.path().join("audit.log"),
        ..Default::default()
    }));
    let rules = Arc::new(PromptRuleEngine::from_yaml(RULES).unwrap());
    let transport = Arc::new(RecordingTransport::new());
    let locks = Arc::new(UserLocks::new());

    let scheduler = Scheduler::new(SchedulerDeps {
        driver: driver.clone(),
        registry: registry.clone(),
        states: states.clone(),
        rules,
        transport: transport.clone(),
        locks: locks.clone(),
        limits: ChunkLimits::default(),
        scrollback: 2000,
        fallback_lines: 30,
    });

    let dispatcher = Dispatcher::new(DispatcherDeps {
        driver: driver.clone(),
        registry: registry.clone(),
        states: states.clone(),
        auth,
        policy,
        edit,
        audit,
        transport: transport.clone(),
        scheduler: scheduler.clone(),
        locks,
        limits: ChunkLimits::default(),
        scrollback: 2000,
    });

    Harness {
        _dir: dir,
        dispatcher,
        scheduler,
        driver,
        transport,
        states,
        registry,
        registry_path,
    }
}

async fn login(h: &Harness) {
    h.dispatcher.process(Update::text("42", 100, "/login 1.2.3.4 k")).await;
    assert!(h.states.get("42").authorized);
}

async fn login_and_create_tab(h: &Harness) -> String {
    login(h).await;
    h.dispatcher.process(Update::callback("42", 100, "tab:new")).await;
    let state = h.states.get("42");
    state.active_tab_id.expect("tab should be active after tab:new")
}

#[tokio::test]
async fn login_happy_path_marks_authorized_and_renders_menu() {
    let h = harness();
    h.dispatcher.process(Update::text("42", 100, "/login 1.2.3.4 k")).await;

    let state = h.states.get("42");
    assert!(state.authorized);
    assert_eq!(state.server_ip.as_deref(), Some("1.2.3.4"));

    let texts = h.transport.texts();
    assert!(texts.iter().any(|t| t == "Logged in."));
    let sent = h.transport.sent();
    assert!(sent.iter().any(|m| m.buttons.is_some()), "main menu rendered");
}

#[tokio::test]
async fn login_ip_mismatch_is_denied_without_state_change() {
    let h = harness();
    h.dispatcher.process(Update::text("42", 100, "/login 9.9.9.9 k")).await;

    assert!(!h.states.get("42").authorized);
    assert!(h.transport.texts().iter().any(|t| t == "Authentication failed."));
}

#[tokio::test]
async fn unauthenticated_commands_get_login_prompt() {
    let h = harness();
    h.dispatcher.process(Update::text("42", 100, "ls")).await;
    h.dispatcher.process(Update::callback("42", 100, "tab:new")).await;

    assert!(h.driver.sent().is_empty());
    for text in h.transport.texts() {
        assert!(text.contains("/login"), "got: {text}");
    }
}

#[tokio::test]
async fn blocked_command_is_rejected_before_the_terminal() {
    let h = harness();
    let tab_id = login_and_create_tab(&h).await;

    h.dispatcher.process(Update::text("42", 100, "rm -rf /")).await;
    assert!(h.driver.sent().is_empty(), "nothing may reach the driver");
    assert!(h.transport.texts().iter().any(|t| t.contains("blocked")));

    h.dispatcher.process(Update::text("42", 100, "echo ok")).await;
    assert_eq!(
        h.driver.sent(),
        vec![SentInput::Text {
            tab_id,
            text: "echo ok".to_string()
        }]
    );
}

#[tokio::test]
async fn tab_survives_registry_reload_with_same_id() {
    let h = harness();
    let tab_id = login_and_create_tab(&h).await;

    let reloaded = TagRegistry::load(&h.registry_path).unwrap();
    let record = reloaded.get(&tab_id).expect("tab persisted");
    assert_eq!(record.session_name, format!("tgbot_{tab_id}"));
    assert_eq!(record.user_id, "42");
}

#[tokio::test]
async fn missing_session_offers_recreate_instead_of_executing() {
    let h = harness();
    let tab_id = login_and_create_tab(&h).await;
    h.driver.drop_session(&tab_id);

    h.dispatcher.process(Update::text("42", 100, "echo hi")).await;
    assert!(h.driver.sent().is_empty());
    let sent = h.transport.sent();
    let offer = sent
        .iter()
        .find(|m| m.buttons.is_some() && m.text.contains("session"))
        .expect("recreate offer");
    let button = &offer.buttons.as_ref().unwrap()[0][0];
    assert_eq!(button.callback_data, format!("tab:recreate:{tab_id}"));

    h.dispatcher
        .process(Update::callback("42", 100, &format!("tab:recreate:{tab_id}")))
        .await;
    assert!(h.driver.has_session(&tab_id).await.unwrap());
}

#[tokio::test]
async fn claude_mode_emits_incremental_tail_with_buttons() {
    let h = harness();
    let tab_id = login_and_create_tab(&h).await;
    h.dispatcher.process(Update::callback("42", 100, "mode:claude")).await;
    assert_eq!(h.states.get("42").mode, Mode::Claude);

    // Seed the diff base with a refresh.
    h.driver.set_screen(&tab_id, "A\nB");
    h.dispatcher.process(Update::callback("42", 100, "refresh:now")).await;

    // New output matching the confirm rule: only the tail plus buttons.
    h.driver.set_screen(&tab_id, "A\nB\nC?");
    h.scheduler.flush_after_command("42").await;

    let texts = h.transport.texts();
    assert!(texts.iter().any(|t| t == "C?"), "tail emitted: {texts:?}");
    assert!(
        !texts.iter().any(|t| t == "A\nB\nC?"),
        "full capture must not be re-emitted"
    );
    let sent = h.transport.sent();
    let buttons = sent
        .iter()
        .rev()
        .find(|m| m.buttons.is_some())
        .expect("prompt buttons");
    assert_eq!(buttons.buttons.as_ref().unwrap()[0][0].callback_data, "prompt:y");

    // Output that matches no rule stays silent.
    let before = h.transport.sent().len();
    h.driver.set_screen(&tab_id, "A\nB\nC?\nplain");
    h.scheduler.flush_after_command("42").await;
    assert_eq!(h.transport.sent().len(), before);
}

#[tokio::test]
async fn normal_mode_ticks_emit_only_on_change() {
    let h = harness();
    let tab_id = login_and_create_tab(&h).await;

    h.driver.set_screen(&tab_id, "one");
    h.scheduler.tick_once("42").await;
    let after_first = h.transport.sent().len();
    assert!(h.transport.texts().contains(&"one".to_string()));

    // Unchanged capture: the tick stays silent.
    h.scheduler.tick_once("42").await;
    assert_eq!(h.transport.sent().len(), after_first);

    h.driver.set_screen(&tab_id, "one\ntwo");
    h.scheduler.tick_once("42").await;
    assert!(h.transport.texts().contains(&"one\ntwo".to_string()));
}

#[tokio::test]
async fn edit_flow_replaces_file_and_cancel_does_not() {
    let h = harness();
    let tab_id = login_and_create_tab(&h).await;

    let workdir = TempDir::new().unwrap();
    std::fs::write(workdir.path().join("notes.txt"), "old").unwrap();
    h.driver.set_cwd(&tab_id, workdir.path());

    h.dispatcher
        .process(Update::callback("42", 100, "edit:open:notes.txt"))
        .await;
    assert!(h.transport.texts().iter().any(|t| t.contains("old")));

    // The next plain text is content, not a shell command.
    h.dispatcher.process(Update::text("42", 100, "hello")).await;
    assert_eq!(
        std::fs::read_to_string(workdir.path().join("notes.txt")).unwrap(),
        "hello"
    );
    assert!(h.driver.sent().is_empty());

    // Cancelled edits never write.
    h.dispatcher
        .process(Update::callback("42", 100, "edit:open:notes.txt"))
        .await;
    h.dispatcher.process(Update::text("42", 100, "/cancel")).await;
    h.dispatcher.process(Update::text("42", 100, "echo done")).await;
    assert_eq!(
        std::fs::read_to_string(workdir.path().join("notes.txt")).unwrap(),
        "hello"
    );
}

#[tokio::test]
async fn commands_during_edit_session_are_rejected() {
    let h = harness();
    let tab_id = login_and_create_tab(&h).await;
    let workdir = TempDir::new().unwrap();
    std::fs::write(workdir.path().join("notes.txt"), "old").unwrap();
    h.driver.set_cwd(&tab_id, workdir.path());

    h.dispatcher
        .process(Update::callback("42", 100, "edit:open:notes.txt"))
        .await;
    h.dispatcher.process(Update::text("42", 100, "/tabs")).await;
    h.dispatcher.process(Update::callback("42", 100, "refresh:now")).await;

    let conflicts = h
        .transport
        .texts()
        .iter()
        .filter(|t| t.contains("Finish the current edit"))
        .count();
    assert_eq!(conflicts, 2);
}

#[tokio::test]
async fn rename_flow_uses_next_message() {
    let h = harness();
    let tab_id = login_and_create_tab(&h).await;

    h.dispatcher
        .process(Update::callback("42", 100, &format!("tab:rename:{tab_id}")))
        .await;
    h.dispatcher.process(Update::text("42", 100, "build")).await;

    assert_eq!(h.registry.get(&tab_id).unwrap().display_name, "build");
    // Follow-up text goes back to the shell path.
    h.dispatcher.process(Update::text("42", 100, "echo after")).await;
    assert_eq!(h.driver.sent().len(), 1);
}

#[tokio::test]
async fn malformed_callback_yields_bad_action() {
    let h = harness();
    login(&h).await;
    h.dispatcher.process(Update::callback("42", 100, "tab:explode:x")).await;
    assert!(h.transport.texts().iter().any(|t| t == "Bad action."));
}

#[tokio::test]
async fn queued_commands_reach_the_driver_in_arrival_order() {
    let h = harness();
    let tab_id = login_and_create_tab(&h).await;

    for i in 0..5 {
        h.dispatcher.dispatch(Update::text("42", 100, &format!("echo {i}")));
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while h.driver.sent().len() < 5 {
        assert!(tokio::time::Instant::now() < deadline, "commands not drained");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let sent = h.driver.sent();
    let expected: Vec<SentInput> = (0..5)
        .map(|i| SentInput::Text {
            tab_id: tab_id.clone(),
            text: format!("echo {i}"),
        })
        .collect();
    assert_eq!(sent, expected);

    h.dispatcher.shutdown(Duration::from_secs(1)).await;
}
