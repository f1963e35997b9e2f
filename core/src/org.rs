use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::task::Routing;

/// An agent definition in the org chart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AgentDef {
    /// Agent identifier (routing target)
    pub id: String,
    /// Human-readable display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Capability tags matched against `routing.tags`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    /// Inactive agents are never resolved as dispatch targets
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

/// A team definition in the org chart.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TeamDef {
    /// Team identifier (routing target)
    pub id: String,
    /// Agent receiving team-routed work
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lead: Option<String>,
    /// Member agent ids
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub members: Vec<String>,
}

/// Definitions of agents, teams, roles, and capability routing. Read-only
/// for the core; the scheduler's routing resolver consults it on every
/// dispatch decision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct OrgChart {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agents: Vec<AgentDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub teams: Vec<TeamDef>,
    /// role name → agent id
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub roles: BTreeMap<String, String>,
}

impl OrgChart {
    /// Look up an agent definition by id
    pub fn agent(&self, id: &str) -> Option<&AgentDef> {
        self.agents.iter().find(|a| a.id == id)
    }

    /// An agent exists and is active
    pub fn is_active_agent(&self, id: &str) -> bool {
        self.agent(id).is_some_and(|a| a.active)
    }

    /// Agent mapped to a role, if the mapping resolves to an active agent
    pub fn role_agent(&self, role: &str) -> Option<&str> {
        self.roles
            .get(role)
            .map(String::as_str)
            .filter(|id| self.is_active_agent(id))
    }

    /// Resolve a routing description to a dispatchable agent id.
    ///
    /// Precedence: explicit agent, then role mapping, then team lead, then
    /// the first active agent carrying any of the routing tags as a
    /// capability. Returns `None` when nothing resolves; the scheduler
    /// treats that task as non-promotable.
    pub fn resolve_routing(&self, routing: &Routing) -> Option<String> {
        if let Some(agent) = routing.agent.as_deref() {
            if self.is_active_agent(agent) {
                return Some(agent.to_string());
            }
            return None;
        }

        if let Some(role) = routing.role.as_deref() {
            if let Some(agent) = self.role_agent(role) {
                return Some(agent.to_string());
            }
        }

        if let Some(team) = routing.team.as_deref() {
            if let Some(lead) = self
                .teams
                .iter()
                .find(|t| t.id == team)
                .and_then(|t| t.lead.as_deref())
            {
                if self.is_active_agent(lead) {
                    return Some(lead.to_string());
                }
            }
        }

        for tag in &routing.tags {
            if let Some(agent) = self
                .agents
                .iter()
                .find(|a| a.active && a.capabilities.iter().any(|c| c == tag))
            {
                return Some(agent.id.clone());
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart() -> OrgChart {
        OrgChart {
            agents: vec![
                AgentDef {
                    id: "swe-backend".to_string(),
                    name: None,
                    capabilities: vec!["rust".to_string(), "sql".to_string()],
                    active: true,
                },
                AgentDef {
                    id: "swe-frontend".to_string(),
                    name: None,
                    capabilities: vec!["ts".to_string()],
                    active: true,
                },
                AgentDef {
                    id: "retired".to_string(),
                    name: None,
                    capabilities: vec!["rust".to_string()],
                    active: false,
                },
            ],
            teams: vec![TeamDef {
                id: "platform".to_string(),
                lead: Some("swe-backend".to_string()),
                members: vec!["swe-backend".to_string(), "swe-frontend".to_string()],
            }],
            roles: BTreeMap::from([
                ("qa".to_string(), "swe-frontend".to_string()),
                ("ghost".to_string(), "nobody".to_string()),
            ]),
        }
    }

    #[test]
    fn test_explicit_agent_wins() {
        let routing = Routing {
            agent: Some("swe-backend".to_string()),
            role: Some("qa".to_string()),
            ..Routing::default()
        };
        assert_eq!(chart().resolve_routing(&routing).as_deref(), Some("swe-backend"));
    }

    #[test]
    fn test_explicit_inactive_agent_does_not_fall_through() {
        let routing = Routing {
            agent: Some("retired".to_string()),
            role: Some("qa".to_string()),
            ..Routing::default()
        };
        assert_eq!(chart().resolve_routing(&routing), None);
    }

    #[test]
    fn test_role_and_team_resolution() {
        let by_role = Routing {
            role: Some("qa".to_string()),
            ..Routing::default()
        };
        assert_eq!(chart().resolve_routing(&by_role).as_deref(), Some("swe-frontend"));

        let by_team = Routing {
            team: Some("platform".to_string()),
            ..Routing::default()
        };
        assert_eq!(chart().resolve_routing(&by_team).as_deref(), Some("swe-backend"));

        // Role mapped to an unknown agent does not resolve through the role,
        // but capability tags may still match
        let ghost_role = Routing {
            role: Some("ghost".to_string()),
            ..Routing::default()
        };
        assert_eq!(chart().resolve_routing(&ghost_role), None);
    }

    #[test]
    fn test_capability_fallback_skips_inactive() {
        let routing = Routing {
            tags: vec!["rust".to_string()],
            ..Routing::default()
        };
        // "retired" also has the rust capability but is inactive
        assert_eq!(chart().resolve_routing(&routing).as_deref(), Some("swe-backend"));

        let unmatched = Routing {
            tags: vec!["haskell".to_string()],
            ..Routing::default()
        };
        assert_eq!(chart().resolve_routing(&unmatched), None);
    }
}
