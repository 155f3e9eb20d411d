//! Implementation of the `run` task.

use std::process::Stdio;
use std::time::Duration;
use std::time::Instant;

use bollard::Docker;
use bollard::container::Config as ContainerConfig;
use bollard::container::LogOutput;
use bollard::container::LogsOptions;
use bollard::container::RemoveContainerOptions;
use bollard::image::CreateImageOptions;
use futures::StreamExt;
use serde_json::Value;
use serde_json::json;
use thand_model::ContainerProcess;
use thand_model::PullPolicy;
use thand_model::RunClause;
use thand_model::RunTask;
use thand_model::ShellProcess;
use thand_model::SubflowSpec;
use tokio::process::Command;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::TaskEvaluator;
use super::TaskOutcome;
use crate::TaskPath;
use crate::WorkflowContext;
use crate::WorkflowId;
use crate::WorkflowResult;
use crate::error::runtime;
use crate::error::validation;
use crate::expr;

impl TaskEvaluator<'_> {
    /// Executes a `run` task: an external shell process, a container, or a
    /// nested workflow.
    pub(crate) async fn execute_run(
        &mut self,
        task: &RunTask,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        match &task.run {
            RunClause::Shell { shell } => self.run_shell(shell, reference, input).await,
            RunClause::Container { container } => {
                self.run_container(container, reference, input).await
            }
            RunClause::Workflow { workflow } => self.run_subflow(workflow, reference, input).await,
        }
    }

    /// Runs a shell process.
    ///
    /// The command is executed without a shell interpreter; arguments are
    /// expression-evaluated and passed verbatim. The result carries
    /// `{code, stdout, stderr, timeMs}`; on timeout the process is killed
    /// and the result carries `code = -1` and `error = "timeout"`.
    async fn run_shell(
        &mut self,
        shell: &ShellProcess,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let bindings = self.bindings();

        let evaluate = |s: &str| -> WorkflowResult<String> {
            match expr::evaluate_value(&Value::String(s.to_string()), &input, &bindings, reference)?
            {
                Value::String(s) => Ok(s),
                other => Ok(other.to_string()),
            }
        };

        let program = evaluate(&shell.command)?;
        let arguments = shell
            .arguments
            .iter()
            .map(|a| evaluate(a))
            .collect::<WorkflowResult<Vec<_>>>()?;

        let mut command = Command::new(&program);
        command
            .args(&arguments)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in &shell.environment {
            command.env(key, evaluate(value)?);
        }

        let started = Instant::now();
        let child = command
            .spawn()
            .map_err(|e| runtime(format!("failed to spawn `{program}`: {e}"), reference))?;

        if let Some(id) = child.id() {
            info!("spawned process {id} (`{program}`) for task `{reference}`");
        }

        let timeout = Duration::from_secs(self.engine.config().run.shell_timeout_seconds);
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => {
                let elapsed = started.elapsed().as_millis() as u64;
                let code = output.status.code().unwrap_or(-1);
                debug!("process for `{reference}` exited with code {code} in {elapsed}ms");

                Ok(TaskOutcome::Output(json!({
                    "code": code,
                    "stdout": String::from_utf8_lossy(&output.stdout),
                    "stderr": String::from_utf8_lossy(&output.stderr),
                    "timeMs": elapsed,
                })))
            }
            Ok(Err(e)) => Err(runtime(
                format!("failed to wait for `{program}`: {e}"),
                reference,
            )),
            Err(_) => {
                // The dropped future kills the process tree via
                // kill_on_drop; the captured output is lost with it.
                warn!("process for `{reference}` timed out after {timeout:?}");
                Ok(TaskOutcome::Output(json!({
                    "code": -1,
                    "stdout": "",
                    "stderr": "",
                    "error": "timeout",
                    "timeMs": started.elapsed().as_millis() as u64,
                })))
            }
        }
    }

    /// Runs a container: pull per the configured policy, create, start,
    /// wait for exit, harvest the logs, and remove in the background.
    ///
    /// On timeout the container is killed and the result carries `code = -1`
    /// and `error = "timeout"`.
    async fn run_container(
        &mut self,
        container: &ContainerProcess,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let bindings = self.bindings();

        let evaluate = |s: &str| -> WorkflowResult<String> {
            match expr::evaluate_value(&Value::String(s.to_string()), &input, &bindings, reference)?
            {
                Value::String(s) => Ok(s),
                other => Ok(other.to_string()),
            }
        };

        let image = evaluate(&container.image)?;
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| runtime(format!("failed to connect to the container runtime: {e}"), reference))?;

        let should_pull = match container.pull_policy.unwrap_or(PullPolicy::IfNotPresent) {
            PullPolicy::Always => true,
            PullPolicy::Never => false,
            PullPolicy::IfNotPresent => docker.inspect_image(&image).await.is_err(),
        };

        if should_pull {
            info!("pulling image `{image}` for task `{reference}`");
            let mut pull = docker.create_image(
                Some(CreateImageOptions {
                    from_image: image.clone(),
                    ..Default::default()
                }),
                None,
                None,
            );
            while let Some(progress) = pull.next().await {
                progress.map_err(|e| {
                    runtime(format!("failed to pull image `{image}`: {e}"), reference)
                })?;
            }
        }

        let cmd = match &container.command {
            Some(command) => Some(
                command
                    .iter()
                    .map(|c| evaluate(c))
                    .collect::<WorkflowResult<Vec<_>>>()?,
            ),
            None => None,
        };

        let env = container
            .environment
            .iter()
            .map(|(key, value)| Ok(format!("{key}={value}", value = evaluate(value)?)))
            .collect::<WorkflowResult<Vec<_>>>()?;

        let created = docker
            .create_container::<String, String>(
                None,
                ContainerConfig {
                    image: Some(image.clone()),
                    cmd,
                    env: Some(env),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| runtime(format!("failed to create container: {e}"), reference))?;

        let id = created.id;
        docker
            .start_container::<String>(&id, None)
            .await
            .map_err(|e| runtime(format!("failed to start container `{id}`: {e}"), reference))?;

        info!("started container `{id}` (`{image}`) for task `{reference}`");

        let started = Instant::now();
        let timeout = Duration::from_secs(self.engine.config().run.container_timeout_seconds);

        let mut wait = docker.wait_container::<String>(&id, None);
        let status = match tokio::time::timeout(timeout, wait.next()).await {
            Ok(Some(Ok(exit))) => exit.status_code,
            Ok(Some(Err(e))) => {
                remove_container(&docker, &id);
                return Err(runtime(
                    format!("failed to wait for container `{id}`: {e}"),
                    reference,
                ));
            }
            Ok(None) => {
                remove_container(&docker, &id);
                return Err(runtime(
                    format!("container `{id}` produced no exit status"),
                    reference,
                ));
            }
            Err(_) => {
                warn!("container `{id}` timed out after {timeout:?}; killing");
                if let Err(e) = docker.kill_container::<String>(&id, None).await {
                    warn!("failed to kill container `{id}`: {e}");
                }
                remove_container(&docker, &id);
                return Ok(TaskOutcome::Output(json!({
                    "code": -1,
                    "stdout": "",
                    "stderr": "",
                    "error": "timeout",
                    "timeMs": started.elapsed().as_millis() as u64,
                })));
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut logs = docker.logs::<String>(
            &id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );
        while let Some(entry) = logs.next().await {
            match entry {
                Ok(LogOutput::StdOut { message }) => {
                    stdout.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(LogOutput::StdErr { message }) => {
                    stderr.push_str(&String::from_utf8_lossy(&message));
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("failed to read logs of container `{id}`: {e}");
                    break;
                }
            }
        }

        remove_container(&docker, &id);

        Ok(TaskOutcome::Output(json!({
            "code": status,
            "stdout": stdout,
            "stderr": stderr,
            "timeMs": started.elapsed().as_millis() as u64,
        })))
    }

    /// Runs a nested workflow resolved from the subflow registry.
    async fn run_subflow(
        &mut self,
        subflow: &SubflowSpec,
        reference: &TaskPath,
        input: Value,
    ) -> WorkflowResult<TaskOutcome> {
        let document = self
            .engine
            .subflows()
            .get(&subflow.name)
            .cloned()
            .ok_or_else(|| {
                validation(
                    format!("unknown nested workflow `{name}`", name = subflow.name),
                    reference,
                )
            })?;

        let bindings = self.bindings();
        let subflow_input = match &subflow.input {
            Some(spec) => expr::evaluate_value(spec, &input, &bindings, reference)?,
            None => input,
        };

        // The nested instance shares the backend, so its suspension and
        // activity semantics match the parent's.
        let mut context = WorkflowContext::new(
            WorkflowId::generate(),
            document,
            std::sync::Arc::clone(self.context.backend()),
        );

        let output = super::evaluate_document(&self.engine, &mut context, subflow_input).await?;
        Ok(TaskOutcome::Output(output))
    }
}

/// Removes a container in the background.
fn remove_container(docker: &Docker, id: &str) {
    let docker = docker.clone();
    let id = id.to_string();
    tokio::spawn(async move {
        if let Err(e) = docker
            .remove_container(
                &id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            debug!("failed to remove container `{id}`: {e}");
        }
    });
}
