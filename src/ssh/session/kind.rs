use std::collections::HashMap;

/// What the client asked the session channel to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Request<'a> {
    Shell,
    Exec(&'a str),
    Subsystem(&'a str),
}

/// Session type, decided once per session from the first channel request.
/// Governs the pump topology: interactive types get the recorder tap,
/// non-interactive ones get exit-status propagation and (on old agents) the
/// close-on-EOF watchdog.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display, strum_macros::AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum Kind {
    Term,
    Web,
    Exec,
    Heredoc,
    Scp,
    Sftp,
    Unknown,
}

impl Kind {
    pub fn classify(request: Request<'_>, pty: bool, envs: &HashMap<String, String>) -> Self {
        if envs.get("WS").is_some_and(|ws| ws == "true") {
            return Kind::Web;
        }

        match request {
            Request::Subsystem("sftp") => Kind::Sftp,
            Request::Subsystem(_) => Kind::Unknown,
            Request::Exec(command) if !command.is_empty() => {
                if !pty && command.trim_start().starts_with("scp") {
                    Kind::Scp
                } else {
                    Kind::Exec
                }
            }
            Request::Exec(_) => Kind::Unknown,
            Request::Shell if pty => Kind::Term,
            Request::Shell => Kind::Heredoc,
        }
    }

    pub fn interactive(self) -> bool {
        matches!(self, Kind::Term | Kind::Web)
    }

    /// Types whose agent channel must be closed when the client's input
    /// pipe reaches EOF on agents older than 0.9.3.
    pub fn watches_stdin_eof(self) -> bool {
        matches!(self, Kind::Exec | Kind::Scp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn classification_table() {
        let none = HashMap::new();

        assert_eq!(Kind::classify(Request::Shell, true, &none), Kind::Term);
        assert_eq!(Kind::classify(Request::Shell, false, &none), Kind::Heredoc);
        assert_eq!(
            Kind::classify(Request::Exec("echo hi"), false, &none),
            Kind::Exec
        );
        assert_eq!(
            Kind::classify(Request::Exec("scp -t /tmp"), false, &none),
            Kind::Scp
        );
        assert_eq!(
            Kind::classify(Request::Subsystem("sftp"), false, &none),
            Kind::Sftp
        );
        assert_eq!(
            Kind::classify(Request::Subsystem("netconf"), false, &none),
            Kind::Unknown
        );
        assert_eq!(Kind::classify(Request::Exec(""), true, &none), Kind::Unknown);
    }

    #[test]
    fn ws_environment_wins() {
        let web = envs(&[("WS", "true")]);

        assert_eq!(Kind::classify(Request::Shell, true, &web), Kind::Web);

        let not_quite = envs(&[("WS", "1")]);
        assert_eq!(Kind::classify(Request::Shell, true, &not_quite), Kind::Term);
    }

    #[test]
    fn scp_needs_the_command_without_a_pty() {
        let none = HashMap::new();

        // A pty makes it an ordinary exec even if the command says scp.
        assert_eq!(
            Kind::classify(Request::Exec("scp -t /tmp"), true, &none),
            Kind::Exec
        );
    }
}
