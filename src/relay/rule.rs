use serde::{Deserialize, Serialize};

/// The forwarding directive an operator configures. Read-only to the engine:
/// `enabled` is not interpreted here — it is the caller's job to decide
/// whether to call `Manager::start` for a given rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub id: String,
    pub name: String,
    pub src: String,
    pub dst: String,
    pub protocol: RuleProtocol,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    Tcp,
    Udp,
    Both,
}

impl RuleProtocol {
    pub fn wants_tcp(self) -> bool {
        matches!(self, RuleProtocol::Tcp | RuleProtocol::Both)
    }

    pub fn wants_udp(self) -> bool {
        matches!(self, RuleProtocol::Udp | RuleProtocol::Both)
    }
}

/// `{running, active_count, bytes_in, bytes_out}` — all zero when the rule
/// has no running instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RuleStatus {
    pub running: bool,
    pub active_count: usize,
    pub bytes_in: u64,
    pub bytes_out: u64,
}
