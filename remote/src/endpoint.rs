//! `ssh://user@host[:port]:pool/fs` locators and running commands on the endpoint they name

use std::sync::LazyLock;

static REMOTE_LOCATOR: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(
        r"^ssh://(?P<user>[^@]*)@(?P<host>[^:]*):(?:(?P<port>\d+):)?(?P<filesystem>.*)$",
    )
    .unwrap()
});

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EndpointParseError {
    #[error("malformed remote locator {0:?}, expected ssh://user@host[:port]:pool/filesystem")]
    MalformedRemote(String),
    #[error("locator {0:?} does not name a filesystem")]
    EmptyFilesystem(String),
    #[error("locator {0:?} names a snapshot, expected a filesystem")]
    SnapshotInPath(String),
}

/// How to reach a remote endpoint over ssh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshSession {
    pub user: String,
    pub host: String,
    pub port: Option<u16>,
    pub identity: Option<std::path::PathBuf>,
}

impl SshSession {
    /// `ssh` argv up to and including the `user@host` destination
    pub fn command_prefix(&self) -> Vec<String> {
        let mut args = vec!["ssh".to_string()];
        if let Some(port) = self.port {
            args.extend(["-p".to_string(), port.to_string()]);
        }
        if let Some(identity) = &self.identity {
            args.extend(["-i".to_string(), identity.display().to_string()]);
        }
        // there is nobody to answer host key prompts
        args.extend([
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            format!("{}@{}", self.user, self.host),
        ]);
        args
    }
}

/// One ZFS filesystem, either on this host or behind ssh
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    filesystem: String,
    session: Option<SshSession>,
}

impl Endpoint {
    pub fn local(filesystem: impl Into<String>) -> Self {
        Self {
            filesystem: filesystem.into(),
            session: None,
        }
    }

    pub fn remote(session: SshSession, filesystem: impl Into<String>) -> Self {
        Self {
            filesystem: filesystem.into(),
            session: Some(session),
        }
    }

    /// Resolve a locator; anything that is not `ssh://user@host[:port]:path` is a local path.
    pub fn resolve(locator: &str, identity: Option<&std::path::Path>) -> Self {
        match REMOTE_LOCATOR.captures(locator) {
            Some(captures) => {
                let port = captures
                    .name("port")
                    .and_then(|port| port.as_str().parse::<u16>().ok());
                Self::remote(
                    SshSession {
                        user: captures["user"].to_string(),
                        host: captures["host"].to_string(),
                        port,
                        identity: identity.map(std::path::Path::to_path_buf),
                    },
                    &captures["filesystem"],
                )
            }
            None => Self::local(locator),
        }
    }

    /// Like [`Endpoint::resolve`] but rejects locators that cannot name a filesystem.
    pub fn parse(
        locator: &str,
        identity: Option<&std::path::Path>,
    ) -> Result<Self, EndpointParseError> {
        let endpoint = Self::resolve(locator, identity);
        if locator.starts_with("ssh://") {
            let bad_port = REMOTE_LOCATOR
                .captures(locator)
                .and_then(|captures| captures.name("port"))
                .is_some_and(|port| port.as_str().parse::<u16>().is_err());
            if bad_port {
                return Err(EndpointParseError::MalformedRemote(locator.to_string()));
            }
            match &endpoint.session {
                Some(session) if !session.user.is_empty() && !session.host.is_empty() => {}
                _ => return Err(EndpointParseError::MalformedRemote(locator.to_string())),
            }
        }
        if endpoint.filesystem.is_empty() {
            return Err(EndpointParseError::EmptyFilesystem(locator.to_string()));
        }
        if endpoint.filesystem.contains('@') {
            return Err(EndpointParseError::SnapshotInPath(locator.to_string()));
        }
        Ok(endpoint)
    }

    pub fn is_remote(&self) -> bool {
        self.session.is_some()
    }

    pub fn filesystem(&self) -> &str {
        &self.filesystem
    }

    pub fn session(&self) -> Option<&SshSession> {
        self.session.as_ref()
    }

    pub fn host(&self) -> Option<&str> {
        self.session.as_ref().map(|session| session.host.as_str())
    }

    /// Full `filesystem@name` snapshot identifier
    pub fn snapshot(&self, name: &str) -> String {
        format!("{}@{}", self.filesystem, name)
    }

    /// Command line executing `base_args` on this endpoint.
    ///
    /// Remote arguments are quoted since ssh hands them to the remote shell as one line.
    pub fn build_command(&self, base_args: Vec<String>) -> Vec<String> {
        match &self.session {
            None => base_args,
            Some(session) => {
                let mut args = session.command_prefix();
                args.extend(base_args.iter().map(|arg| {
                    shlex::try_quote(arg)
                        .map(|quoted| quoted.into_owned())
                        .unwrap_or_else(|_| arg.clone())
                }));
                args
            }
        }
    }

    /// Pipeline running entirely on this endpoint.
    ///
    /// Locally the stages stay separate processes; remotely the whole pipeline becomes one
    /// ssh invocation so that data between the stages never leaves the remote host.
    pub fn build_pipeline(
        &self,
        pipeline: common::pipeline::Pipeline,
    ) -> anyhow::Result<common::pipeline::Pipeline> {
        match &self.session {
            None => Ok(pipeline),
            Some(_) if pipeline.stages().len() == 1 => Ok(common::pipeline::Pipeline::new(
                self.build_command(pipeline.stages()[0].clone()),
            )),
            Some(session) => {
                let mut args = session.command_prefix();
                args.push(pipeline.to_shell_line()?);
                Ok(common::pipeline::Pipeline::new(args))
            }
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match &self.session {
            None => write!(f, "{}", self.filesystem),
            Some(session) => match session.port {
                Some(port) => write!(
                    f,
                    "ssh://{}@{}:{}:{}",
                    session.user, session.host, port, self.filesystem
                ),
                None => write!(
                    f,
                    "ssh://{}@{}:{}",
                    session.user, session.host, self.filesystem
                ),
            },
        }
    }
}
