//! Default agent and tool catalog, registered on first start

use crate::types::{NewAgent, NewTool};

fn agent(name: &str, agent_type: &str, purpose: &str, system_prompt: &str, success_rate: f64) -> NewAgent {
    NewAgent {
        name: name.to_string(),
        agent_type: agent_type.to_string(),
        purpose: purpose.to_string(),
        system_prompt: system_prompt.to_string(),
        tools_enabled: vec!["filesystem".to_string(), "github".to_string()],
        model_config: serde_json::json!({"max_tokens": 4096}),
        routing_priority: 0.5,
        initial_success_rate: Some(success_rate),
    }
}

pub fn default_agents() -> Vec<NewAgent> {
    let mut database = agent(
        "Database Specialist",
        "database",
        "Write and optimize SQL queries, schemas and migrations",
        "You are a database expert. Write correct, efficient SQL, design schemas and plan safe migrations.",
        0.87,
    );
    database.tools_enabled.push("postgresql".to_string());

    vec![
        agent(
            "Code Review Specialist",
            "code_review",
            "Deep code review focusing on security, performance, and best practices",
            "You are an expert code reviewer. Analyze code for security vulnerabilities, performance issues, and best practice violations.",
            0.88,
        ),
        agent(
            "Refactoring Specialist",
            "refactoring",
            "Transform messy code into clean, maintainable architecture",
            "You are a refactoring expert. Apply SOLID principles, reduce complexity, and improve code structure.",
            0.91,
        ),
        agent(
            "Test Engineer",
            "testing",
            "Generate comprehensive test suites for maximum coverage",
            "You are a test automation expert. Write unit tests, integration tests, and identify edge cases.",
            0.86,
        ),
        agent(
            "Software Architect",
            "architecture",
            "Design scalable system architectures and make strategic decisions",
            "You are a software architect. Provide system design recommendations and technology advice.",
            0.92,
        ),
        agent(
            "Bug Detection Specialist",
            "debugging",
            "Find and fix bugs with root cause analysis",
            "You are a debugging expert. Identify root causes and suggest targeted fixes.",
            0.85,
        ),
        database,
    ]
}

fn tool(name: &str, tool_type: &str, description: &str, reliability: f64, package: &str) -> NewTool {
    NewTool {
        name: name.to_string(),
        tool_type: tool_type.to_string(),
        description: description.to_string(),
        reliability,
        install_command: Some(format!("npx -y {}", package)),
    }
}

pub fn default_tools() -> Vec<NewTool> {
    vec![
        tool(
            "filesystem",
            "filesystem",
            "Read, write and search files in the project workspace",
            0.98,
            "@modelcontextprotocol/server-filesystem",
        ),
        tool(
            "github",
            "git",
            "Version control: repositories, branches, pull requests and issues",
            0.95,
            "@modelcontextprotocol/server-github",
        ),
        tool(
            "memory",
            "knowledge_base",
            "Persistent knowledge graph memory across sessions",
            0.92,
            "@modelcontextprotocol/server-memory",
        ),
        tool(
            "postgresql",
            "database",
            "Query PostgreSQL databases and inspect schemas",
            0.90,
            "@modelcontextprotocol/server-postgres",
        ),
        tool(
            "puppeteer",
            "browser",
            "Browser automation for end-to-end testing and web scraping",
            0.85,
            "@modelcontextprotocol/server-puppeteer",
        ),
        tool(
            "slack",
            "communication",
            "Post messages and read channels for team collaboration",
            0.88,
            "@modelcontextprotocol/server-slack",
        ),
        tool(
            "brave-search",
            "search",
            "Web search for research and documentation lookup",
            0.87,
            "@modelcontextprotocol/server-brave-search",
        ),
        tool(
            "docker",
            "container",
            "Build images and manage containers",
            0.86,
            "mcp-server-docker",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_catalog_is_valid_and_unique() {
        let agents = default_agents();
        assert_eq!(agents.len(), 6);
        assert!(agents.iter().all(|a| a.validate().is_ok()));
        let names: HashSet<_> = agents.iter().map(|a| &a.name).collect();
        assert_eq!(names.len(), agents.len());

        let tools = default_tools();
        assert!(tools.iter().all(|t| t.validate().is_ok()));
        assert!(tools.iter().all(|t| t.reliability > 0.8));
    }
}
