//! Parsing, inheritance and validation of lokiactor.toml.

use std::time::Duration;

use lokiactor::config::{load_config, parse_config, RawConfig};
use lokiactor::model::{ActionDef, ContinuationDef, Extent, ResolvedConfig};

const LOKI: &str = r#"
[loki]
host = "localhost"
port = 3100
"#;

fn parse(body: &str) -> anyhow::Result<ResolvedConfig> {
    parse_config(&format!("{LOKI}{body}"))
}

fn parse_ok(body: &str) -> ResolvedConfig {
    match parse(body) {
        Ok(config) => config,
        Err(err) => panic!("config should resolve: {err:#}"),
    }
}

fn parse_err(body: &str) -> String {
    match parse(body) {
        Ok(config) => panic!("config should be rejected, got {config:?}"),
        Err(err) => format!("{err:#}"),
    }
}

const CHAT: &str = r#"
[actions.chat]
type = "notify"
webhook_url = "http://hooks.local/chat"
message_template = "${values.message}"
"#;

const APP_FLOW: &str = r#"
[flows.app]
query = '{job="app"}'

[[flows.app.triggers]]
regex = "error"
actions = ["chat"]
"#;

#[test]
fn minimal_config_uses_defaults() {
    let config = parse_ok(&format!("{CHAT}{APP_FLOW}"));

    assert_eq!(config.loki.host, "localhost");
    assert_eq!(config.loki.port, 3100);
    assert!(!config.loki.tls);
    assert_eq!(config.shutdown_timeout, Duration::from_secs(30));

    match config.actions.get("chat") {
        Some(ActionDef::Notify(notify)) => {
            assert_eq!(notify.webhook_url, "http://hooks.local/chat");
            assert_eq!(notify.timeout, Duration::from_secs(10));
            assert!(notify.batch.is_none());
        }
        other => panic!("expected notify action, got {other:?}"),
    }

    assert_eq!(config.flows.len(), 1);
    let trigger = &config.flows[0].triggers[0];
    assert_eq!(trigger.name, "app#0");
    assert!(trigger.continuation.is_none());
}

#[test]
fn flows_are_sorted_by_name() {
    let config = parse_ok(&format!(
        r#"{CHAT}
[flows.zeta]
query = "{{job=\"z\"}}"
[[flows.zeta.triggers]]
regex = "x"
actions = ["chat"]

[flows.alpha]
query = "{{job=\"a\"}}"
[[flows.alpha.triggers]]
regex = "x"
actions = ["chat"]
"#
    ));
    let names: Vec<&str> = config.flows.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["alpha", "zeta"]);
}

#[test]
fn action_inherits_unset_fields_and_abstract_is_dropped() {
    let config = parse_ok(&format!(
        r#"
[actions.base]
type = "notify"
abstract = true
webhook_url = "http://hooks.local/base"
timeout_secs = 3
message_template = "base ${{values.message}}"
batch = {{ max_count = 5, prefix = ">", suffix = "<" }}

[actions.errors]
extends = "base"
message_template = "ERR ${{values.message}}"

[actions.chat]
extends = "errors"
webhook_url = "http://hooks.local/chat"
{APP_FLOW}"#
    ));

    assert!(!config.actions.contains_key("base"));

    match config.actions.get("errors") {
        Some(ActionDef::Notify(notify)) => {
            assert_eq!(notify.webhook_url, "http://hooks.local/base");
            assert_eq!(notify.timeout, Duration::from_secs(3));
            assert_eq!(notify.message_template, "ERR ${values.message}");
            let batch = notify.batch.as_ref().expect("batch should be inherited");
            assert_eq!(batch.max_count, 5);
            assert_eq!(batch.prefix, ">");
        }
        other => panic!("expected notify action, got {other:?}"),
    }

    match config.actions.get("chat") {
        Some(ActionDef::Notify(notify)) => {
            assert_eq!(notify.webhook_url, "http://hooks.local/chat");
            assert_eq!(notify.message_template, "ERR ${values.message}");
        }
        other => panic!("expected notify action, got {other:?}"),
    }
}

#[test]
fn flow_inherits_query_and_triggers() {
    let config = parse_ok(&format!(
        r#"{CHAT}
[flows.template]
abstract = true
query = '{{job="base"}}'

[[flows.template.triggers]]
name = "panic"
regex = "panic"
actions = ["chat"]
lines = 3

[flows.api]
extends = "template"
query = '{{job="api"}}'

[flows.worker]
extends = "template"
"#
    ));

    let names: Vec<&str> = config.flows.iter().map(|f| f.name.as_str()).collect();
    assert_eq!(names, vec!["api", "worker"]);
    assert_eq!(config.flows[0].query, r#"{job="api"}"#);
    assert_eq!(config.flows[1].query, r#"{job="base"}"#);
    assert_eq!(config.flows[1].triggers[0].name, "panic");
}

#[test]
fn continuation_defaults_to_first_action() {
    let config = parse_ok(&format!(
        r#"{CHAT}
[actions.restart]
type = "command"
run = ["systemctl", "restart", "${{labels.unit}}"]

[flows.app]
query = '{{job="app"}}'

[[flows.app.triggers]]
regex = "panic"
actions = ["chat", "restart"]
lines = 20

[[flows.app.triggers]]
regex = "slow"
actions = ["chat"]
duration_ms = 1500
continuation_action = "restart"
"#
    ));

    let triggers = &config.flows[0].triggers;
    assert_eq!(
        triggers[0].continuation,
        Some(ContinuationDef {
            extent: Extent::Lines(20),
            action: "chat".to_owned(),
        })
    );
    assert_eq!(
        triggers[1].continuation,
        Some(ContinuationDef {
            extent: Extent::Duration(Duration::from_millis(1500)),
            action: "restart".to_owned(),
        })
    );
    assert!(matches!(
        config.actions.get("restart"),
        Some(ActionDef::Command(cmd)) if cmd.argv.len() == 3
    ));
}

#[test]
fn unknown_base_is_rejected() {
    let err = parse_err(&format!(
        "{CHAT}[actions.other]\nextends = \"missing\"\n{APP_FLOW}"
    ));
    assert!(err.contains("unknown action missing"), "{err}");
}

#[test]
fn inheritance_cycle_is_rejected() {
    let err = parse_err(&format!(
        r#"{CHAT}
[actions.a]
extends = "b"
[actions.b]
extends = "a"
{APP_FLOW}"#
    ));
    assert!(err.contains("cycle"), "{err}");
}

#[test]
fn self_extension_is_a_cycle() {
    let err = parse_err(&format!(
        "{CHAT}{APP_FLOW}\n[flows.loop]\nextends = \"loop\"\n"
    ));
    assert!(err.contains("cycle"), "{err}");
}

#[test]
fn trigger_cannot_use_abstract_action() {
    let err = parse_err(&format!(
        r#"
[actions.chat]
type = "notify"
abstract = true
webhook_url = "http://hooks.local/chat"
message_template = "x"
{APP_FLOW}"#
    ));
    assert!(err.contains("unknown or abstract action chat"), "{err}");
}

#[test]
fn invalid_trigger_definitions_are_rejected() {
    let cases = [
        ("regex = \"(\"\nactions = [\"chat\"]", "invalid regex"),
        (
            "regex = \"x\"\nignore_regex = \"[\"\nactions = [\"chat\"]",
            "invalid ignore_regex",
        ),
        ("actions = [\"chat\"]", "has no regex"),
        ("regex = \"x\"\nactions = []", "has no actions"),
        (
            "regex = \"x\"\nactions = [\"chat\"]\nlines = 2\nduration_ms = 10",
            "both lines and duration_ms",
        ),
        ("regex = \"x\"\nactions = [\"chat\"]\nlines = 0", "lines must be > 0"),
        (
            "regex = \"x\"\nactions = [\"chat\"]\nduration_ms = 0",
            "duration_ms must be > 0",
        ),
    ];

    for (trigger, expected) in cases {
        let err = parse_err(&format!(
            "{CHAT}\n[flows.app]\nquery = \"q\"\n[[flows.app.triggers]]\n{trigger}\n"
        ));
        assert!(err.contains(expected), "expected {expected:?} in {err}");
    }
}

#[test]
fn invalid_actions_are_rejected() {
    let cases = [
        ("run = [\"true\"]", "has no type"),
        ("type = \"command\"", "has no run"),
        ("type = \"notify\"\nmessage_template = \"x\"", "has no webhook_url"),
        (
            "type = \"notify\"\nwebhook_url = \"http://h\"",
            "has no message_template",
        ),
        (
            "type = \"notify\"\nwebhook_url = \"http://h\"\nwebhook_url_env = \"V\"\nmessage_template = \"x\"",
            "both webhook_url and webhook_url_env",
        ),
        (
            "type = \"notify\"\nwebhook_url = \"http://h\"\nmessage_template = \"x\"\nbatch = { max_count = 0 }",
            "max_count must be >= 1",
        ),
    ];

    for (action, expected) in cases {
        let err = parse_err(&format!("{CHAT}\n[actions.broken]\n{action}\n{APP_FLOW}"));
        assert!(err.contains(expected), "expected {expected:?} in {err}");
    }
}

#[test]
fn unknown_keys_are_rejected() {
    let err = parse_err(&format!("{CHAT}{APP_FLOW}\n[flows.app.extra]\nfoo = 1\n"));
    assert!(err.contains("unknown field"), "{err}");

    let err = parse_err(&format!("{CHAT}{APP_FLOW}\n[daemon]\nshutdown_timeout = 5\n"));
    assert!(err.contains("unknown field"), "{err}");
}

#[test]
fn config_without_concrete_flows_is_rejected() {
    let err = parse_err(&format!(
        "{CHAT}\n[flows.app]\nabstract = true\nquery = \"q\"\n"
    ));
    assert!(err.contains("no concrete flows"), "{err}");
}

#[test]
fn webhook_url_can_come_from_environment() {
    let raw: RawConfig = toml::from_str(&format!(
        r#"{LOKI}
[actions.chat]
type = "notify"
webhook_url_env = "LOKIACTOR_TEST_HOOK"
message_template = "x"
{APP_FLOW}"#
    ))
    .expect("raw config should parse");

    let config = raw
        .clone()
        .resolve(&|var: &str| (var == "LOKIACTOR_TEST_HOOK").then(|| "http://env.local/hook".to_owned()))
        .expect("config should resolve");
    assert!(matches!(
        config.actions.get("chat"),
        Some(ActionDef::Notify(notify)) if notify.webhook_url == "http://env.local/hook"
    ));

    let err = raw
        .resolve(&|_: &str| None)
        .expect_err("unset variable should be rejected");
    assert!(err.to_string().contains("LOKIACTOR_TEST_HOOK"), "{err}");
}

#[test]
fn daemon_and_tls_settings_are_read() {
    let config = parse_config(&format!(
        "[loki]\nhost = \"loki\"\nport = 443\ntls = true\n[daemon]\nshutdown_timeout_secs = 5\n{CHAT}{APP_FLOW}"
    ))
    .expect("config should resolve");
    assert!(config.loki.tls);
    assert_eq!(config.shutdown_timeout, Duration::from_secs(5));
}

#[test]
fn load_config_reads_file() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let path = dir.path().join("lokiactor.toml");
    std::fs::write(&path, format!("{LOKI}{CHAT}{APP_FLOW}")).expect("write config");

    let config = load_config(&path).expect("config should load");
    assert_eq!(config.flows[0].name, "app");

    let missing = load_config(&dir.path().join("missing.toml"));
    assert!(missing.is_err());
}
