use std::fmt;

/// Integer handle naming one provisioned container.
pub type InstanceId = i32;

/// Coarse workload category. Drives identifier range, bridge and defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceClass {
    Game,
    Dev,
}

impl InstanceClass {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceClass::Game => "game",
            InstanceClass::Dev => "dev",
        }
    }

    /// Anything that is not explicitly `dev` provisions as a game instance.
    pub fn parse_lenient(raw: Option<&str>) -> Self {
        match raw.map(|s| s.trim().to_ascii_lowercase()).as_deref() {
            Some("dev") => InstanceClass::Dev,
            _ => InstanceClass::Game,
        }
    }
}

impl fmt::Display for InstanceClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PortStatus {
    Free,
    Reserved,
    Allocated,
}

impl PortStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PortStatus::Free => "free",
            PortStatus::Reserved => "reserved",
            PortStatus::Allocated => "allocated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "free" => Some(PortStatus::Free),
            "reserved" => Some(PortStatus::Reserved),
            "allocated" => Some(PortStatus::Allocated),
            _ => None,
        }
    }
}

/// Guest agent self-reported state machine:
/// `idle -> installing -> verifying -> starting -> running`, with `error` and
/// `crashed` as terminal failures.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentState {
    Idle,
    Installing,
    Verifying,
    Starting,
    Running,
    Error,
    Crashed,
    #[serde(untagged)]
    Other(String),
}

impl AgentState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" => AgentState::Idle,
            "installing" => AgentState::Installing,
            "verifying" => AgentState::Verifying,
            "starting" => AgentState::Starting,
            "running" => AgentState::Running,
            "error" => AgentState::Error,
            "crashed" => AgentState::Crashed,
            other => AgentState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            AgentState::Idle => "idle",
            AgentState::Installing => "installing",
            AgentState::Verifying => "verifying",
            AgentState::Starting => "starting",
            AgentState::Running => "running",
            AgentState::Error => "error",
            AgentState::Crashed => "crashed",
            AgentState::Other(s) => s,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, AgentState::Error | AgentState::Crashed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Udp => "udp",
        }
    }
}

/// How a workload is exposed at the edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Registered as a backend with the protocol-aware proxy; no per-port routes.
    ProtocolProxy,
    /// One reverse-proxy route per allocated port.
    ReverseProxy,
}

/// Provisioning saga states. `Failed` is absorbing and reachable from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum SagaState {
    Allocating,
    PortReserving,
    Cloning,
    Configuring,
    Starting,
    AgentConfiguring,
    AgentAwaiting,
    Persisting,
    Publishing,
    Confirmed,
    Failed,
}

impl SagaState {
    pub const HAPPY_PATH: [SagaState; 10] = [
        SagaState::Allocating,
        SagaState::PortReserving,
        SagaState::Cloning,
        SagaState::Configuring,
        SagaState::Starting,
        SagaState::AgentConfiguring,
        SagaState::AgentAwaiting,
        SagaState::Persisting,
        SagaState::Publishing,
        SagaState::Confirmed,
    ];

    /// Successor on success, `None` for terminal states.
    pub fn next(self) -> Option<SagaState> {
        use SagaState::*;
        match self {
            Allocating => Some(PortReserving),
            PortReserving => Some(Cloning),
            Cloning => Some(Configuring),
            Configuring => Some(Starting),
            Starting => Some(AgentConfiguring),
            AgentConfiguring => Some(AgentAwaiting),
            AgentAwaiting => Some(Persisting),
            Persisting => Some(Publishing),
            Publishing => Some(Confirmed),
            Confirmed | Failed => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SagaState::Confirmed | SagaState::Failed)
    }

    /// Whether `to` is a legal transition from `self`.
    pub fn can_transition(self, to: SagaState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == SagaState::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for SagaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_parse_defaults_to_game() {
        assert_eq!(InstanceClass::parse_lenient(None), InstanceClass::Game);
        assert_eq!(InstanceClass::parse_lenient(Some(" DEV ")), InstanceClass::Dev);
        assert_eq!(InstanceClass::parse_lenient(Some("minecraft")), InstanceClass::Game);
    }

    #[test]
    fn agent_state_parses_unknown_as_other() {
        assert_eq!(AgentState::parse("Running"), AgentState::Running);
        assert!(AgentState::parse("crashed").is_failure());
        assert_eq!(
            AgentState::parse("downloading"),
            AgentState::Other("downloading".to_string())
        );
        assert!(!AgentState::parse("downloading").is_failure());
    }

    #[test]
    fn agent_state_deserializes_from_json() {
        let s: AgentState = serde_json::from_str("\"verifying\"").unwrap();
        assert_eq!(s, AgentState::Verifying);
    }

    #[test]
    fn saga_happy_path_follows_transition_table() {
        let mut state = SagaState::Allocating;
        let mut seen = vec![state];
        while let Some(next) = state.next() {
            assert!(state.can_transition(next));
            state = next;
            seen.push(state);
        }
        assert_eq!(seen, SagaState::HAPPY_PATH.to_vec());
    }

    #[test]
    fn failed_is_reachable_from_non_terminal_only() {
        assert!(SagaState::Cloning.can_transition(SagaState::Failed));
        assert!(!SagaState::Confirmed.can_transition(SagaState::Failed));
        assert!(!SagaState::Failed.can_transition(SagaState::Allocating));
        assert!(!SagaState::Cloning.can_transition(SagaState::Starting));
    }
}
