//! Rendering of the input written to the guest's login shell.

use chrono::{DateTime, Utc};

/// How the agent is invoked inside the guest.
#[derive(Debug, Clone)]
pub struct AgentCommand<'a> {
    pub binary: &'a str,
    pub endpoint: &'a str,
    pub server_secret: &'a str,
    pub client_secret: &'a str,
    pub task_id: &'a str,
}

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the shell input: exports, optional clock sync, the agent, `exit`.
pub fn render(
    env: &[(String, String)],
    sync_time: Option<DateTime<Utc>>,
    agent: &AgentCommand<'_>,
) -> String {
    let mut script = String::new();

    for (name, value) in env {
        script.push_str(&format!("export {}={}\n", name, shell_quote(value)));
    }

    if let Some(now) = sync_time {
        script.push_str(&format!(
            "sudo date -u {}\n",
            now.format("%m%d%H%M%Y.%S")
        ));
    }

    script.push_str(&format!(
        "{} -api-endpoint {} -server-token {} -client-token {} -task-id {}\n",
        shell_quote(agent.binary),
        shell_quote(agent.endpoint),
        shell_quote(agent.server_secret),
        shell_quote(agent.client_secret),
        shell_quote(agent.task_id),
    ));
    script.push_str("exit\n");

    script
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn agent() -> AgentCommand<'static> {
        AgentCommand {
            binary: "/tmp/cirrus-ci/cirrus-ci-agent",
            endpoint: "http://127.0.0.1:9000",
            server_secret: "s3cr3t",
            client_secret: "it's",
            task_id: "42",
        }
    }

    #[test]
    fn quotes_embedded_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn renders_agent_then_exit() {
        let script = render(&[], None, &agent());
        let lines: Vec<&str> = script.lines().collect();
        assert_eq!(
            lines,
            vec![
                r"'/tmp/cirrus-ci/cirrus-ci-agent' -api-endpoint 'http://127.0.0.1:9000' -server-token 's3cr3t' -client-token 'it'\''s' -task-id '42'",
                "exit"
            ]
        );
    }

    #[test]
    fn exports_and_time_sync_precede_agent() {
        let env = vec![("CIRRUS_WORKING_DIR".to_string(), "/Users/admin/working-dir".to_string())];
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let script = render(&env, Some(now), &agent());
        let lines: Vec<&str> = script.lines().collect();

        assert_eq!(lines[0], "export CIRRUS_WORKING_DIR='/Users/admin/working-dir'");
        assert_eq!(lines[1], "sudo date -u 030914052024.07");
        assert!(lines[2].starts_with("'/tmp/cirrus-ci/cirrus-ci-agent'"));
        assert_eq!(lines[3], "exit");
    }
}
