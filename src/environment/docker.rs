#![forbid(unsafe_code)]

//! Container runtime driver that shells out to the `docker` CLI.

use std::io::{BufRead as _, BufReader, Write as _};
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use regex::Regex;

use crate::entity::WorkspaceKind;
use crate::environment::definition;
use crate::environment::{EnvironmentDriver, RunOptions, RunOutcome};
use crate::error::{DatmoError, io_at};

const RSTUDIO_URL: &str = "http://localhost:8787";

#[derive(Debug, Clone)]
pub struct DockerDriver {
    pub docker_command: String,
    pub definition_filename: String,
}

impl DockerDriver {
    #[must_use]
    pub fn new(docker_command: String, definition_filename: String) -> Self {
        Self {
            docker_command,
            definition_filename,
        }
    }

    fn command(&self) -> Command {
        Command::new(&self.docker_command)
    }

    fn spawn_error(&self, e: &std::io::Error) -> DatmoError {
        match e.kind() {
            std::io::ErrorKind::NotFound => DatmoError::EnvironmentInitFailed(format!(
                "container runtime not found: {}",
                self.docker_command
            )),
            _ => DatmoError::EnvironmentExecution(format!(
                "failed to run {}: {e}",
                self.docker_command
            )),
        }
    }

    fn output(&self, args: &[&str]) -> Result<Output, DatmoError> {
        self.command()
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| self.spawn_error(&e))
    }

    /// Runs `args` and returns stdout; a non-zero exit becomes an execution error.
    fn run_checked(&self, args: &[&str]) -> Result<String, DatmoError> {
        let out = self.output(args)?;
        if out.status.success() {
            Ok(String::from_utf8_lossy(&out.stdout).to_string())
        } else {
            Err(DatmoError::EnvironmentExecution(format!(
                "{} {}: {}",
                self.docker_command,
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            )))
        }
    }

    /// `run` arguments after the subcommand, image and command last.
    #[must_use]
    pub fn run_args(image: &str, options: &RunOptions, runtime: Option<&str>) -> Vec<String> {
        let mut args = vec!["run".to_owned()];
        if let Some(name) = &options.name {
            args.push("--name".to_owned());
            args.push(name.clone());
        }
        if let Some(runtime) = runtime {
            args.push("--runtime".to_owned());
            args.push(runtime.to_owned());
        }
        if let Some(mem) = &options.mem_limit {
            args.push("-m".to_owned());
            args.push(mem.clone());
            args.push("--memory-swap".to_owned());
            args.push("-1".to_owned());
        }
        if options.stdin_open {
            args.push("-i".to_owned());
        }
        if options.tty {
            args.push("-t".to_owned());
        }
        if options.detach {
            args.push("-d".to_owned());
        }
        for v in &options.volumes {
            args.push("-v".to_owned());
            args.push(format!("{}:{}:{}", v.host.display(), v.bind, v.mode));
        }
        for p in &options.ports {
            args.push("-p".to_owned());
            args.push(p.clone());
        }
        args.push(image.to_owned());
        if let Some(cmd) = &options.command {
            args.extend(cmd.iter().cloned());
        }
        args
    }

    fn container_id(&self, name: Option<&str>) -> Result<String, DatmoError> {
        let out = match name {
            Some(name) => {
                let filter = format!("name=^/?{name}$");
                self.run_checked(&["ps", "-a", "-q", "--filter", &filter])?
            }
            None => self.run_checked(&["ps", "-q", "-l"])?,
        };
        let id = out.lines().next().unwrap_or_default().trim().to_owned();
        if id.is_empty() {
            return Err(DatmoError::EnvironmentExecution(
                "could not determine the container id of the run".to_owned(),
            ));
        }
        Ok(id)
    }

    /// Copies the container's output into `log_path` line by line and returns it.
    pub fn log_container(
        &self,
        container_id: &str,
        log_path: &Path,
        follow: bool,
    ) -> Result<String, DatmoError> {
        let mut cmd = self.command();
        cmd.arg("logs");
        if follow {
            cmd.arg("--follow");
        }
        let mut child = cmd
            .arg(container_id)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| self.spawn_error(&e))?;

        let file = std::fs::File::create(log_path).map_err(io_at(log_path))?;
        let sink = Mutex::new((file, String::new()));
        let streams: Vec<Box<dyn std::io::Read + Send>> = [
            child
                .stdout
                .take()
                .map(|o| Box::new(o) as Box<dyn std::io::Read + Send>),
            child
                .stderr
                .take()
                .map(|e| Box::new(e) as Box<dyn std::io::Read + Send>),
        ]
        .into_iter()
        .flatten()
        .collect();

        std::thread::scope(|s| {
            for stream in streams {
                let sink = &sink;
                s.spawn(move || {
                    for line in BufReader::new(stream).lines() {
                        let Ok(line) = line else { break };
                        let line = line.trim().replace('\u{8}', " ");
                        if let Ok(mut guard) = sink.lock() {
                            let (file, text) = &mut *guard;
                            let _ = writeln!(file, "{line}");
                            text.push_str(&line);
                            text.push('\n');
                        }
                    }
                });
            }
        });

        let _ = child.wait();
        let (mut file, logs) = sink
            .into_inner()
            .map_err(|_| DatmoError::Other("log writer panicked".to_owned()))?;
        file.flush().map_err(io_at(log_path))?;
        Ok(logs)
    }

    /// Ids of all containers whose name contains `term`.
    pub fn containers_matching(&self, term: &str) -> Result<Vec<String>, DatmoError> {
        let out = self.run_checked(&["ps", "-a", "--format", "{{.ID}} {{.Names}}"])?;
        Ok(out
            .lines()
            .filter_map(|line| {
                let (id, names) = line.trim().split_once(' ')?;
                names.contains(term).then(|| id.to_owned())
            })
            .collect())
    }

    fn image_exists(&self, image: &str) -> Result<bool, DatmoError> {
        Ok(self.output(&["image", "inspect", image])?.status.success())
    }
}

impl EnvironmentDriver for DockerDriver {
    fn driver_type(&self) -> &'static str {
        "docker"
    }

    fn init(&self) -> Result<(), DatmoError> {
        let out = self.output(&["version", "--format", "{{.Server.Version}}"])?;
        if out.status.success() {
            Ok(())
        } else {
            Err(DatmoError::EnvironmentInitFailed(
                String::from_utf8_lossy(&out.stderr).trim().to_owned(),
            ))
        }
    }

    fn is_initialized(&self) -> bool {
        self.init().is_ok()
    }

    fn definition_filename(&self) -> &str {
        &self.definition_filename
    }

    fn default_definition_content(&self) -> Result<String, DatmoError> {
        Ok(definition::default_definition().to_owned())
    }

    fn build(
        &self,
        tag: &str,
        definition_path: &Path,
        workspace: Option<WorkspaceKind>,
    ) -> Result<(), DatmoError> {
        let derived = definition::write_derived(definition_path, workspace)?;
        let context = derived
            .parent()
            .ok_or_else(|| DatmoError::EnvironmentDoesNotExist(derived.display().to_string()))?;
        tracing::info!(tag, definition = %derived.display(), "building image");
        let status = self
            .command()
            .arg("build")
            .args(["-t", tag])
            .arg("-f")
            .arg(&derived)
            .arg(context)
            .arg("--rm")
            .stdin(Stdio::null())
            .status()
            .map_err(|e| self.spawn_error(&e))?;
        if status.success() {
            Ok(())
        } else {
            Err(DatmoError::EnvironmentExecution(format!(
                "image build failed with exit code {code}",
                code = status.code().unwrap_or(1)
            )))
        }
    }

    fn run(
        &self,
        image: &str,
        options: &RunOptions,
        log_path: &Path,
    ) -> Result<RunOutcome, DatmoError> {
        let runtime = if options.gpu {
            if !self.gpu_enabled()? {
                return Err(DatmoError::GpuSupportNotEnabled("nvidia".to_owned()));
            }
            Some("nvidia")
        } else {
            None
        };
        let args = Self::run_args(image, options, runtime);
        tracing::debug!(args = ?args, "starting container");

        let mut cmd = self.command();
        cmd.args(&args);
        if !options.stdin_open {
            cmd.stdin(Stdio::null());
        }
        if options.detach {
            cmd.stdout(Stdio::null());
        }
        let status = cmd.status().map_err(|e| self.spawn_error(&e))?;

        if options.detach {
            if !status.success() {
                return Err(DatmoError::EnvironmentExecution(format!(
                    "container failed to start with exit code {code}",
                    code = status.code().unwrap_or(1)
                )));
            }
            let run_id = self.container_id(options.name.as_deref())?;
            let logs = self.log_container(&run_id, log_path, false)?;
            return Ok(RunOutcome {
                exit_code: 0,
                run_id,
                logs,
            });
        }

        let exit_code = status.code().unwrap_or(1);
        let run_id = self.container_id(options.name.as_deref())?;
        let logs = self.log_container(&run_id, log_path, true)?;
        Ok(RunOutcome {
            exit_code,
            run_id,
            logs,
        })
    }

    fn stop(&self, run_id: &str) -> Result<(), DatmoError> {
        self.run_checked(&["stop", run_id])?;
        self.run_checked(&["rm", "-f", run_id])?;
        Ok(())
    }

    fn stop_remove_containers_by_term(&self, term: &str) -> Result<(), DatmoError> {
        let ids = self.containers_matching(term)?;
        if ids.is_empty() {
            return Ok(());
        }
        tracing::info!(term, count = ids.len(), "stopping containers");
        let mut stop = vec!["stop"];
        stop.extend(ids.iter().map(String::as_str));
        // Already-exited containers make `stop` complain; removal below is what matters.
        let _ = self.output(&stop)?;
        let mut rm = vec!["rm", "-f"];
        rm.extend(ids.iter().map(String::as_str));
        self.run_checked(&rm)?;
        Ok(())
    }

    fn remove(&self, image: &str) -> Result<(), DatmoError> {
        self.stop_remove_containers_by_term(image)?;
        if self.image_exists(image)? {
            self.run_checked(&["rmi", "-f", image])?;
        }
        Ok(())
    }

    fn gpu_enabled(&self) -> Result<bool, DatmoError> {
        let out = self.output(&["run", "--runtime=nvidia", "--rm", "nvidia/cuda", "nvidia-smi"])?;
        let stderr = String::from_utf8_lossy(&out.stderr);
        if stderr.contains("Unknown runtime specified nvidia")
            || stderr.contains("OCI runtime create failed")
        {
            return Ok(false);
        }
        if !out.status.success() {
            return Err(DatmoError::GpuSupportNotEnabled(stderr.trim().to_owned()));
        }
        Ok(true)
    }

    fn extract_workspace_url(
        &self,
        container_name: &str,
        workspace: Option<WorkspaceKind>,
        attempts: u32,
    ) -> Option<String> {
        match workspace? {
            WorkspaceKind::Notebook | WorkspaceKind::Jupyterlab => {
                let re = Regex::new(r"https?://[^\s]+").ok()?;
                for _ in 0..attempts {
                    if let Ok(out) =
                        self.output(&["exec", container_name, "jupyter", "notebook", "list"])
                    {
                        let stdout = String::from_utf8_lossy(&out.stdout);
                        if let Some(m) = re.find(&stdout) {
                            return Some(m.as_str().to_owned());
                        }
                    }
                    std::thread::sleep(Duration::from_secs(1));
                }
                None
            }
            WorkspaceKind::Rstudio => {
                std::thread::sleep(Duration::from_secs(2));
                Some(RSTUDIO_URL.to_owned())
            }
            WorkspaceKind::Terminal => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::VolumeMount;

    #[test]
    fn run_args_follow_flag_order() {
        let options = RunOptions {
            command: Some(vec!["python".to_owned(), "script.py".to_owned()]),
            ports: vec!["8888:8888".to_owned()],
            name: Some("datmo-task-p-t".to_owned()),
            volumes: vec![VolumeMount {
                host: "/proj".into(),
                bind: "/home/".to_owned(),
                mode: "rw".to_owned(),
            }],
            mem_limit: Some("4g".to_owned()),
            gpu: false,
            detach: true,
            stdin_open: true,
            tty: false,
        };
        let args = DockerDriver::run_args("img", &options, Some("nvidia"));
        assert_eq!(
            args,
            vec![
                "run", "--name", "datmo-task-p-t", "--runtime", "nvidia", "-m", "4g",
                "--memory-swap", "-1", "-i", "-d", "-v", "/proj:/home/:rw", "-p", "8888:8888",
                "img", "python", "script.py",
            ]
        );
    }

    #[test]
    fn missing_runtime_is_an_init_failure() {
        let d = DockerDriver::new("datmo-no-such-runtime".to_owned(), "Dockerfile".to_owned());
        assert_eq!(d.init().unwrap_err().key(), "environment-init-failed");
        assert!(!d.is_initialized());
        assert_eq!(
            d.extract_workspace_url("x", Some(WorkspaceKind::Notebook), 0),
            None
        );
        assert_eq!(d.extract_workspace_url("x", None, 3), None);
    }
}
