//! Test doubles for the command runner and the environment backend.

use crate::credentials::DatabaseCredentials;
use crate::env::{service, EnvironmentBackend, ExecOptions};
use crate::runner::{command_line, CommandRunner};
use crate::utils::{OpsError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[derive(Clone)]
enum Reply {
    Output(String),
    Failure(String),
}

struct Rule {
    fragment: String,
    reply: Reply,
    once: bool,
    used: bool,
}

#[derive(Default)]
struct Rules(Vec<Rule>);

impl Rules {
    fn push(&mut self, fragment: &str, reply: Reply, once: bool) {
        self.0.push(Rule {
            fragment: fragment.to_string(),
            reply,
            once,
            used: false,
        });
    }

    fn reply(&mut self, line: &str) -> Option<Reply> {
        let rule = self
            .0
            .iter_mut()
            .find(|rule| !(rule.once && rule.used) && line.contains(&rule.fragment))?;
        rule.used = true;
        Some(rule.reply.clone())
    }
}

fn into_result(line: &str, reply: Option<Reply>) -> Result<String> {
    match reply {
        Some(Reply::Output(output)) => Ok(output),
        Some(Reply::Failure(output)) => Err(OpsError::Command {
            command: line.to_string(),
            status: "exit status: 1".to_string(),
            output,
        }),
        None => Ok(String::new()),
    }
}

/// Answers commands from a script of `(fragment, reply)` rules. The first
/// rule whose fragment occurs in the command line wins; unmatched commands
/// succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Rules>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, fragment: &str, output: &str) -> Self {
        self.push(fragment, Reply::Output(output.to_string()), false)
    }

    pub fn once(self, fragment: &str, output: &str) -> Self {
        self.push(fragment, Reply::Output(output.to_string()), true)
    }

    pub fn fail(self, fragment: &str, output: &str) -> Self {
        self.push(fragment, Reply::Failure(output.to_string()), false)
    }

    fn push(self, fragment: &str, reply: Reply, once: bool) -> Self {
        self.rules.lock().unwrap().push(fragment, reply, once);
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, fragment: &str) -> bool {
        self.count(fragment) > 0
    }

    pub fn count(&self, fragment: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.contains(fragment))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String> {
        let line = command_line(program, args);
        self.calls.lock().unwrap().push(line.clone());
        let reply = self.rules.lock().unwrap().reply(&line);
        into_result(&line, reply)
    }

    async fn run_streaming(&self, program: &str, args: &[String]) -> Result<String> {
        self.run(program, args).await
    }
}

/// Content placed on the local side by a matching `copy_from`.
pub enum Fixture {
    File(Vec<u8>),
    Dir(Vec<(String, Vec<u8>)>),
}

type DetectFn = Box<dyn Fn() -> Result<()> + Send + Sync>;

/// In-memory backend. Every operation is recorded as a line:
///
/// * `<service>: <command> [user=<u>] [env K=V]` for exec and exec_stream
/// * `copy_to <service>:<dest>` and `copy_from <service>:<src>`
/// * `start <service>`, `stop <service>`, `is_running <service>`
///
/// Rules match against these lines the same way [`ScriptedRunner`] does.
pub struct FakeBackend {
    name: &'static str,
    detect: Option<DetectFn>,
    rules: Mutex<Rules>,
    fixtures: Mutex<Vec<(String, Fixture)>>,
    calls: Mutex<Vec<String>>,
    running: Mutex<BTreeSet<String>>,
}

impl Default for FakeBackend {
    fn default() -> Self {
        let running = [
            service::DATABASE,
            service::TASK_MANAGER_DB,
            service::INFRAHUB_SERVER,
            service::TASK_WORKER,
            service::TASK_MANAGER,
            service::TASK_MANAGER_BACKGROUND,
            service::CACHE,
            service::MESSAGE_QUEUE,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        Self {
            name: "docker",
            detect: None,
            rules: Mutex::new(Rules::default()),
            fixtures: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            running: Mutex::new(running),
        }
    }
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn detect_with(mut self, detect: impl Fn() -> Result<()> + Send + Sync + 'static) -> Self {
        self.detect = Some(Box::new(detect));
        self
    }

    pub fn on(self, fragment: &str, output: &str) -> Self {
        self.push(fragment, Reply::Output(output.to_string()), false)
    }

    pub fn once(self, fragment: &str, output: &str) -> Self {
        self.push(fragment, Reply::Output(output.to_string()), true)
    }

    pub fn fail(self, fragment: &str, output: &str) -> Self {
        self.push(fragment, Reply::Failure(output.to_string()), false)
    }

    pub fn fail_once(self, fragment: &str, output: &str) -> Self {
        self.push(fragment, Reply::Failure(output.to_string()), true)
    }

    fn push(self, fragment: &str, reply: Reply, once: bool) -> Self {
        self.rules.lock().unwrap().push(fragment, reply, once);
        self
    }

    /// Materializes `fixture` at the local destination of a matching `copy_from`.
    pub fn fixture(self, fragment: &str, fixture: Fixture) -> Self {
        self.fixtures
            .lock()
            .unwrap()
            .push((fragment.to_string(), fixture));
        self
    }

    /// Replaces the set of services reported as running.
    pub fn running(self, services: &[&str]) -> Self {
        *self.running.lock().unwrap() = services.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, fragment: &str) -> bool {
        self.calls().iter().any(|call| call.contains(fragment))
    }

    /// Index of the first recorded call containing `fragment`.
    pub fn position(&self, fragment: &str) -> Option<usize> {
        self.calls().iter().position(|call| call.contains(fragment))
    }

    pub fn count(&self, fragment: &str) -> usize {
        self.calls().iter().filter(|call| call.contains(fragment)).count()
    }

    pub fn is_up(&self, service: &str) -> bool {
        self.running.lock().unwrap().contains(service)
    }

    fn run_detect(&self) -> Result<()> {
        match &self.detect {
            Some(detect) => detect(),
            None => Ok(()),
        }
    }

    fn record(&self, line: String) -> Result<String> {
        self.calls.lock().unwrap().push(line.clone());
        let reply = self.rules.lock().unwrap().reply(&line);
        into_result(&line, reply)
    }

    fn exec_line(service: &str, command: &[String], opts: &ExecOptions) -> String {
        let mut line = format!("{}: {}", service, command.join(" "));
        if let Some(user) = &opts.user {
            line.push_str(&format!(" [user={}]", user));
        }
        for (key, value) in &opts.env {
            line.push_str(&format!(" [env {}={}]", key, value));
        }
        line
    }
}

#[async_trait]
impl EnvironmentBackend for FakeBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn target(&self) -> Option<String> {
        Some("fake".to_string())
    }

    async fn detect(&mut self) -> Result<()> {
        self.run_detect()
    }

    async fn exec(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String> {
        self.record(Self::exec_line(service, command, opts))
    }

    async fn exec_stream(
        &self,
        service: &str,
        command: &[String],
        opts: &ExecOptions,
    ) -> Result<String> {
        self.record(Self::exec_line(service, command, opts))
    }

    async fn copy_to(&self, service: &str, _src: &Path, dest: &str) -> Result<()> {
        self.record(format!("copy_to {}:{}", service, dest)).map(|_| ())
    }

    async fn copy_from(&self, service: &str, src: &str, dest: &Path) -> Result<()> {
        let line = format!("copy_from {}:{}", service, src);
        self.record(line.clone())?;

        let fixtures = self.fixtures.lock().unwrap();
        let Some((_, fixture)) = fixtures
            .iter()
            .find(|(fragment, _)| line.contains(fragment))
        else {
            return Ok(());
        };
        match fixture {
            Fixture::File(bytes) => {
                if let Some(parent) = dest.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(dest, bytes)?;
            }
            Fixture::Dir(files) => {
                for (relative, bytes) in files {
                    let path = dest.join(relative);
                    if let Some(parent) = path.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(path, bytes)?;
                }
            }
        }
        Ok(())
    }

    async fn start(&self, services: &[&str]) -> Result<()> {
        for service in services {
            self.record(format!("start {}", service))?;
            self.running.lock().unwrap().insert(service.to_string());
        }
        Ok(())
    }

    async fn stop(&self, services: &[&str]) -> Result<()> {
        for service in services {
            self.record(format!("stop {}", service))?;
            self.running.lock().unwrap().remove(*service);
        }
        Ok(())
    }

    async fn is_running(&self, service: &str) -> Result<bool> {
        self.record(format!("is_running {}", service))?;
        Ok(self.is_up(service))
    }
}

/// Lets a session own a [`FakeBackend`] while the test keeps a handle on it.
pub struct SharedBackend(pub Arc<FakeBackend>);

#[async_trait]
impl EnvironmentBackend for SharedBackend {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn target(&self) -> Option<String> {
        self.0.target()
    }

    async fn detect(&mut self) -> Result<()> {
        self.0.run_detect()
    }

    async fn exec(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String> {
        self.0.exec(service, command, opts).await
    }

    async fn exec_stream(
        &self,
        service: &str,
        command: &[String],
        opts: &ExecOptions,
    ) -> Result<String> {
        self.0.exec_stream(service, command, opts).await
    }

    async fn copy_to(&self, service: &str, src: &Path, dest: &str) -> Result<()> {
        self.0.copy_to(service, src, dest).await
    }

    async fn copy_from(&self, service: &str, src: &str, dest: &Path) -> Result<()> {
        self.0.copy_from(service, src, dest).await
    }

    async fn start(&self, services: &[&str]) -> Result<()> {
        self.0.start(services).await
    }

    async fn stop(&self, services: &[&str]) -> Result<()> {
        self.0.stop(services).await
    }

    async fn is_running(&self, service: &str) -> Result<bool> {
        self.0.is_running(service).await
    }
}

pub fn neo4j_credentials() -> DatabaseCredentials {
    DatabaseCredentials {
        database: "neo4j".to_string(),
        username: "neo4j".to_string(),
        password: "admin".to_string(),
    }
}

pub fn postgres_credentials() -> DatabaseCredentials {
    DatabaseCredentials {
        database: "prefect".to_string(),
        username: "postgres".to_string(),
        password: "prefect".to_string(),
    }
}
