//! Database credential resolution.
//!
//! Each field is taken from, in order: explicit configuration, the local
//! process environment, the environment of the running Infrahub services,
//! and finally the stock defaults of an Infrahub deployment.

use crate::config::{Neo4jConfig, PostgresConfig};
use crate::env::{service, EnvironmentBackend, ExecOptions};
use crate::runner::argv;
use std::collections::HashMap;
use tracing::{debug, warn};
use url::Url;

const NEO4J_DATABASE_VAR: &str = "INFRAHUB_DB_DATABASE";
const NEO4J_USERNAME_VAR: &str = "INFRAHUB_DB_USERNAME";
const NEO4J_PASSWORD_VAR: &str = "INFRAHUB_DB_PASSWORD";
const PREFECT_URL_VAR: &str = "PREFECT_API_DATABASE_CONNECTION_URL";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseCredentials {
    pub database: String,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub neo4j: DatabaseCredentials,
    pub postgres: DatabaseCredentials,
}

#[derive(Debug, Clone, Default)]
struct Partial {
    database: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl Partial {
    fn is_complete(&self) -> bool {
        self.database.is_some() && self.username.is_some() && self.password.is_some()
    }

    fn fill(
        &mut self,
        database: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) {
        let keep = |slot: &mut Option<String>, value: Option<String>| {
            if slot.is_none() {
                *slot = value.filter(|v| !v.is_empty());
            }
        };
        keep(&mut self.database, database);
        keep(&mut self.username, username);
        keep(&mut self.password, password);
    }

    fn finish(self, database: &str, username: &str, password: &str) -> DatabaseCredentials {
        DatabaseCredentials {
            database: self.database.unwrap_or_else(|| database.to_string()),
            username: self.username.unwrap_or_else(|| username.to_string()),
            password: self.password.unwrap_or_else(|| password.to_string()),
        }
    }
}

/// Resolves credentials against a snapshot of the local environment.
pub struct CredentialResolver {
    neo4j: Partial,
    postgres: Partial,
}

impl CredentialResolver {
    pub fn new(
        neo4j: &Neo4jConfig,
        postgres: &PostgresConfig,
        local_env: &HashMap<String, String>,
    ) -> Self {
        let mut resolver = Self {
            neo4j: Partial::default(),
            postgres: Partial::default(),
        };
        resolver.neo4j.fill(
            neo4j.database.clone(),
            neo4j.username.clone(),
            neo4j.password.clone(),
        );
        resolver.postgres.fill(
            postgres.database.clone(),
            postgres.username.clone(),
            postgres.password.clone(),
        );
        resolver.apply_env(local_env);
        resolver
    }

    fn apply_env(&mut self, vars: &HashMap<String, String>) {
        self.neo4j.fill(
            vars.get(NEO4J_DATABASE_VAR).cloned(),
            vars.get(NEO4J_USERNAME_VAR).cloned(),
            vars.get(NEO4J_PASSWORD_VAR).cloned(),
        );
        if let Some(url) = vars.get(PREFECT_URL_VAR) {
            self.apply_prefect_url(url);
        }
    }

    fn apply_prefect_url(&mut self, raw: &str) {
        match parse_connection_url(raw) {
            Some(parsed) => self.postgres.fill(parsed.database, parsed.username, parsed.password),
            None => warn!("Could not parse {}", PREFECT_URL_VAR),
        }
    }

    /// Completes the credentials, inspecting the running services when needed.
    pub async fn resolve(mut self, backend: &dyn EnvironmentBackend) -> Credentials {
        if !self.neo4j.is_complete() {
            match remote_env(backend, service::INFRAHUB_SERVER).await {
                Some(vars) => self.neo4j.fill(
                    vars.get(NEO4J_DATABASE_VAR).cloned(),
                    vars.get(NEO4J_USERNAME_VAR).cloned(),
                    vars.get(NEO4J_PASSWORD_VAR).cloned(),
                ),
                None => warn!(
                    "Could not fetch Neo4j credentials from {}",
                    service::INFRAHUB_SERVER
                ),
            }
        }

        if !self.postgres.is_complete() {
            match remote_env(backend, service::TASK_MANAGER).await {
                Some(vars) => {
                    if let Some(url) = vars.get(PREFECT_URL_VAR) {
                        self.apply_prefect_url(url);
                    }
                }
                None => warn!(
                    "Could not fetch PostgreSQL credentials from {}",
                    service::TASK_MANAGER
                ),
            }
        }

        Credentials {
            neo4j: self.neo4j.finish("neo4j", "neo4j", "admin"),
            postgres: self.postgres.finish("prefect", "postgres", "prefect"),
        }
    }
}

async fn remote_env(
    backend: &dyn EnvironmentBackend,
    target: &str,
) -> Option<HashMap<String, String>> {
    match backend.exec(target, &argv(&["env"]), &ExecOptions::default()).await {
        Ok(output) => Some(parse_env_lines(&output)),
        Err(e) => {
            debug!(service = target, "env lookup failed: {}", e);
            None
        }
    }
}

/// Parses `KEY=VALUE` lines as printed by `env`.
pub fn parse_env_lines(output: &str) -> HashMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim_end_matches('\r').to_string()))
        .collect()
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ConnectionParts {
    pub database: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Extracts database, user and password from a Postgres URL, accepting
/// driver-qualified schemes such as `postgresql+asyncpg://`.
pub fn parse_connection_url(raw: &str) -> Option<ConnectionParts> {
    let (scheme, rest) = raw.trim().split_once("://")?;
    if !scheme.starts_with("postgres") {
        return None;
    }
    let url = Url::parse(&format!("postgres://{}", rest)).ok()?;

    let non_empty = |s: &str| (!s.is_empty()).then(|| percent_decode(s));
    Some(ConnectionParts {
        database: non_empty(url.path().trim_start_matches('/')),
        username: non_empty(url.username()),
        password: url.password().and_then(non_empty),
    })
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
