//! Ready-made fixtures shared across integration tests.

use aof_core::{AgentDef, OrgChart, TeamDef, Workflow};
use std::collections::BTreeMap;

use crate::builders::WorkflowBuilder;

/// An org chart with a backend agent, a frontend agent, a QA role mapping,
/// and a platform team.
pub fn standard_org_chart() -> OrgChart {
    OrgChart {
        agents: vec![
            AgentDef {
                id: "swe-backend".to_string(),
                name: Some("Backend Engineer".to_string()),
                capabilities: vec!["rust".to_string(), "sql".to_string()],
                active: true,
            },
            AgentDef {
                id: "swe-frontend".to_string(),
                name: Some("Frontend Engineer".to_string()),
                capabilities: vec!["ts".to_string(), "css".to_string()],
                active: true,
            },
            AgentDef {
                id: "qa-agent".to_string(),
                name: Some("QA".to_string()),
                capabilities: vec!["testing".to_string()],
                active: true,
            },
            AgentDef {
                id: "pm-agent".to_string(),
                name: Some("PM".to_string()),
                capabilities: vec![],
                active: true,
            },
        ],
        teams: vec![TeamDef {
            id: "platform".to_string(),
            lead: Some("swe-backend".to_string()),
            members: vec!["swe-backend".to_string(), "swe-frontend".to_string()],
        }],
        roles: BTreeMap::from([
            ("architect".to_string(), "swe-backend".to_string()),
            ("swe".to_string(), "swe-backend".to_string()),
            ("qa".to_string(), "qa-agent".to_string()),
            ("pm".to_string(), "pm-agent".to_string()),
        ]),
    }
}

/// A three-gate feature workflow with a rejecting, escalating review gate.
pub fn review_workflow() -> Workflow {
    WorkflowBuilder::new("feature")
        .gate("design", "architect")
        .gate("build", "swe")
        .gate_with("review", "qa", |g| {
            g.can_reject = true;
            g.timeout = Some("1h".to_string());
            g.escalate_to = Some("pm".to_string());
        })
        .build()
}
