//! Instance lifecycle engine
//!
//! Every entry point re-reads the live instance state before mutating it, so
//! calls are idempotent and safe to retry from scratch after any transient
//! failure. Each entry point runs under its own deadline from [`Timeouts`]
//! and aborts promptly when the caller's cancellation token fires.
//!
//! State machine: `Absent -> Stopped -> Running`, with delete returning to
//! `Absent`.
//!
//! [`Timeouts`]: crate::config::Timeouts

use std::path::Path;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use lattice_common::{Error, Result, ResultExt};

use crate::addresses::host_addresses;
use crate::api::{
    ImageMetadataTemplate, Instance, InstanceExecPost, InstanceFileArgs, InstanceStatePut,
    WriteMode,
};
use crate::client::Client;
use crate::filter::{matches_all, ListFilter};
use crate::launch::{apply_replacements, InstanceFiles, LaunchSpec};
use crate::operation::{find_instance_create_operation, poll_tick, wait_for_operation, with_deadline};
use crate::transport::OperationHandle;

/// Status reported by a running instance
const STATUS_RUNNING: &str = "Running";

/// Output of a command run inside an instance
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status of the command
    pub exit_code: i64,
    /// Recorded stdout
    pub stdout: String,
    /// Recorded stderr
    pub stderr: String,
}

impl Client {
    /// Create and start an instance, returning its host addresses
    ///
    /// - If the instance exists, behaves as [`Client::start_instance`].
    /// - If a create operation for the name is in flight, awaits it instead
    ///   of issuing a duplicate create.
    /// - Otherwise completes `spec` and creates the instance.
    ///
    /// Once created, templates are uploaded and file actions and replacements
    /// applied, in that order, before the first start.
    #[instrument(skip_all, fields(instance = %name))]
    pub async fn launch_instance(
        &self,
        cancel: &CancellationToken,
        name: &str,
        spec: LaunchSpec,
    ) -> Result<Vec<String>> {
        with_deadline(
            cancel,
            "LaunchInstance",
            self.timeouts().create,
            self.launch(cancel, name, spec),
        )
        .await
    }

    async fn launch(
        &self,
        cancel: &CancellationToken,
        name: &str,
        spec: LaunchSpec,
    ) -> Result<Vec<String>> {
        match self.api().get_instance_state(name).await {
            Ok(_) => {
                debug!("Instance already exists");
                return self.start_instance(cancel, name).await;
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e.context("failed to GetInstanceState")),
        }

        let files = match find_instance_create_operation(self.api(), name).await? {
            Some(op) => {
                info!(operation = %op.id, "Instance create already in progress");
                wait_for_operation(self.api(), cancel, "CreateInstance", OperationHandle::Pending(op))
                    .await
                    .context("failed to create instance")?;
                spec.into_files()
            }
            None => {
                let spec = spec
                    .complete(self.server_name())
                    .context("failed to complete launch options")?;
                info!(
                    image = %spec.image,
                    kind = spec.instance_kind.as_str(),
                    flavor = %spec.flavor,
                    profiles = ?spec.profiles,
                    devices = ?spec.devices.keys().collect::<Vec<_>>(),
                    "Creating instance"
                );
                let handle = match self.api().create_instance(&spec.to_request(name)).await {
                    Ok(handle) => handle,
                    Err(e) if e.is_conflict() => {
                        debug!("Instance was created concurrently");
                        return self.start_instance(cancel, name).await;
                    }
                    Err(e) => return Err(e.context("failed to create instance")),
                };
                wait_for_operation(self.api(), cancel, "CreateInstance", handle)
                    .await
                    .context("failed to create instance")?;
                spec.files
            }
        };

        self.provision_files(name, &files).await?;
        self.start_instance(cancel, name).await
    }

    async fn provision_files(&self, name: &str, files: &InstanceFiles) -> Result<()> {
        let api = self.api();

        if !files.instance_templates.is_empty() {
            let mut metadata = api
                .get_instance_metadata(name)
                .await
                .context("failed to GetInstanceMetadata")?;

            for (path, contents) in &files.instance_templates {
                let base = Path::new(path)
                    .file_name()
                    .map(|f| f.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.clone());
                let template_name = format!("{}.tpl", base);
                api.create_instance_template_file(name, &template_name, contents)
                    .await
                    .with_context(|| format!("failed to CreateInstanceTemplateFile({})", template_name))?;

                metadata.templates.insert(
                    path.clone(),
                    ImageMetadataTemplate {
                        when: vec!["create".to_string()],
                        create_only: true,
                        template: template_name,
                        ..Default::default()
                    },
                );
            }

            api.update_instance_metadata(name, &metadata)
                .await
                .context("failed to UpdateInstanceMetadata")?;
        }

        for action in &files.file_actions {
            debug!(action = %action, "Applying file action");
            api.create_instance_file(name, action.path(), &action.args())
                .await
                .with_context(|| format!("failed to {}", action))?;
        }

        for (path, rules) in &files.replacements {
            let file = api
                .get_instance_file(name, path)
                .await
                .with_context(|| format!("failed to replace text in {:?}: failed to GetInstanceFile", path))?;

            let Some(replaced) = apply_replacements(&file.content, rules) else {
                debug!(path = %path, "Replacements already applied");
                continue;
            };

            api.create_instance_file(
                name,
                path,
                &InstanceFileArgs {
                    content: replaced,
                    uid: file.uid,
                    gid: file.gid,
                    mode: file.mode,
                    file_type: file.file_type,
                    write_mode: WriteMode::Overwrite,
                },
            )
            .await
            .with_context(|| format!("failed to replace text in {:?}: failed to CreateInstanceFile", path))?;
        }

        Ok(())
    }

    /// Start an instance if needed and wait for a host address
    #[instrument(skip_all, fields(instance = %name))]
    pub async fn start_instance(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Vec<String>> {
        with_deadline(cancel, "StartInstance", self.timeouts().start, async {
            let state = self
                .api()
                .get_instance_state(name)
                .await
                .context("failed to GetInstanceState")?;

            if state.status == STATUS_RUNNING {
                debug!("Instance is already running");
            } else {
                debug!(status = %state.status, "Starting instance");
                let handle = self
                    .api()
                    .update_instance_state(name, &InstanceStatePut::start())
                    .await
                    .context("failed to start instance")?;
                wait_for_operation(self.api(), cancel, "StartInstance", handle)
                    .await
                    .context("failed to start instance")?;
            }

            self.poll_addresses(cancel, name).await
        })
        .await
    }

    /// Wait until the instance reports at least one host address
    #[instrument(skip_all, fields(instance = %name))]
    pub async fn await_address(
        &self,
        cancel: &CancellationToken,
        name: &str,
    ) -> Result<Vec<String>> {
        with_deadline(
            cancel,
            "AwaitAddress",
            self.timeouts().start,
            self.poll_addresses(cancel, name),
        )
        .await
    }

    async fn poll_addresses(&self, cancel: &CancellationToken, name: &str) -> Result<Vec<String>> {
        loop {
            let state = self
                .api()
                .get_instance_state(name)
                .await
                .context("failed to GetInstanceState")?;
            let addresses = host_addresses(&state);
            if !addresses.is_empty() {
                debug!(addresses = ?addresses, "Instance has host addresses");
                return Ok(addresses);
            }
            poll_tick(cancel, "AwaitAddress").await?;
        }
    }

    /// Force-stop an instance if it is running
    ///
    /// Fails with a not-found error when the instance does not exist.
    #[instrument(skip_all, fields(instance = %name))]
    pub async fn stop_instance(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        with_deadline(cancel, "StopInstance", self.timeouts().stop, async {
            let state = self
                .api()
                .get_instance_state(name)
                .await
                .context("failed to GetInstanceState")?;

            if state.pid == 0 {
                debug!(status = %state.status, "Instance is not running");
                return Ok(());
            }

            debug!(status = %state.status, pid = state.pid, "Stopping instance");
            let handle = self
                .api()
                .update_instance_state(name, &InstanceStatePut::force_stop())
                .await
                .context("failed to stop instance")?;
            wait_for_operation(self.api(), cancel, "StopInstance", handle)
                .await
                .map(|_| ())
        })
        .await
    }

    /// Stop and remove an instance; succeeds if it does not exist
    #[instrument(skip_all, fields(instance = %name))]
    pub async fn delete_instance(&self, cancel: &CancellationToken, name: &str) -> Result<()> {
        with_deadline(cancel, "DeleteInstance", self.timeouts().delete, async {
            match self.stop_instance(cancel, name).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    debug!("Instance does not exist");
                    return Ok(());
                }
                Err(e) => return Err(e.context("failed to stop instance")),
            }

            debug!("Deleting instance");
            let handle = match self.api().delete_instance(name).await {
                Ok(handle) => handle,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e.context("failed to delete instance")),
            };
            wait_for_operation(self.api(), cancel, "DeleteInstance", handle)
                .await
                .map(|_| ())
        })
        .await
    }

    /// List instances matching every filter, sorted by name
    pub async fn list_instances(&self, filters: &[ListFilter]) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .api()
            .list_instances_full()
            .await
            .context("failed to list instances")?
            .into_iter()
            .filter(|instance| matches_all(filters, instance))
            .collect();
        instances.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(instances)
    }

    /// Run a command inside an instance and collect its recorded output
    ///
    /// A non-zero exit status is not an error here; see [`Client::run_command`].
    pub async fn exec_command(
        &self,
        cancel: &CancellationToken,
        name: &str,
        command: &[&str],
    ) -> Result<CommandOutput> {
        let request =
            InstanceExecPost::recorded(command.iter().map(|c| c.to_string()).collect());
        let handle = self
            .api()
            .exec_instance(name, &request)
            .await
            .with_context(|| format!("failed to exec {:?}", command))?;
        let op = wait_for_operation(self.api(), cancel, "ExecInstance", handle).await?;

        let metadata = op.and_then(|op| op.metadata).unwrap_or(Value::Null);
        let exit_code = metadata
            .get("return")
            .and_then(Value::as_i64)
            .ok_or_else(|| {
                Error::internal_with_context("exec", "operation did not report an exit status")
            })?;

        let mut output = CommandOutput {
            exit_code,
            ..Default::default()
        };
        for (fd, target) in [("1", &mut output.stdout), ("2", &mut output.stderr)] {
            if let Some(path) = metadata
                .get("output")
                .and_then(|o| o.get(fd))
                .and_then(Value::as_str)
            {
                let log = self
                    .api()
                    .get_log_file(path)
                    .await
                    .context("failed to read command output")?;
                *target = String::from_utf8_lossy(&log).into_owned();
            }
        }
        Ok(output)
    }

    /// Run a command inside an instance, failing on a non-zero exit status
    #[instrument(skip_all, fields(instance = %name, command = ?command))]
    pub async fn run_command(
        &self,
        cancel: &CancellationToken,
        name: &str,
        command: &[&str],
    ) -> Result<CommandOutput> {
        let output = self.exec_command(cancel, name, command).await?;
        if output.exit_code != 0 {
            return Err(Error::operation(
                "ExecInstance",
                format!("exit status {}", output.exit_code),
                output.stderr.trim().to_string(),
            ));
        }
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{
        FileType, InstanceFile, InstanceNetwork, InstanceNetworkAddress, InstanceState,
        Operation, Server, ServerEnvironment, STATUS_RUNNING as OP_RUNNING, STATUS_SUCCESS,
    };
    use crate::config::Timeouts;
    use crate::image::Image;
    use crate::transport::MockLxcApi;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn running_state(address: &str) -> InstanceState {
        InstanceState {
            status: "Running".to_string(),
            pid: 42,
            network: Some(BTreeMap::from([(
                "eth0".to_string(),
                InstanceNetwork {
                    addresses: vec![InstanceNetworkAddress {
                        family: "inet".to_string(),
                        address: address.to_string(),
                        netmask: "24".to_string(),
                        scope: "global".to_string(),
                    }],
                    ..Default::default()
                },
            )])),
            ..Default::default()
        }
    }

    fn stopped_state() -> InstanceState {
        InstanceState {
            status: "Stopped".to_string(),
            ..Default::default()
        }
    }

    fn done(id: &str) -> OperationHandle {
        OperationHandle::Pending(Operation {
            id: id.to_string(),
            status_code: STATUS_SUCCESS,
            status: "Success".to_string(),
            ..Default::default()
        })
    }

    fn not_found() -> Error {
        Error::api("GetInstanceState", 404, "Instance not found")
    }

    async fn client(mut api: MockLxcApi) -> Client {
        api.expect_get_server().returning(|| {
            Ok(Server {
                environment: ServerEnvironment {
                    server: "incus".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            })
        });
        Client::from_api(Arc::new(api))
            .await
            .expect("client should connect")
            .with_timeouts(Timeouts::default())
    }

    fn spec() -> LaunchSpec {
        LaunchSpec::new()
            .with_image(Image {
                alias: "ubuntu/24.04".to_string(),
                ..Default::default()
            })
            .with_profiles(["default", "k8s"])
    }

    /// Story: launching an existing, running instance performs no mutation
    #[tokio::test]
    async fn story_launch_existing_instance_only_reads() {
        let mut api = MockLxcApi::new();
        api.expect_get_instance_state()
            .returning(|_| Ok(running_state("10.0.0.7")));
        api.expect_create_instance().never();
        api.expect_update_instance_state().never();

        let client = client(api).await;
        let addrs = client
            .launch_instance(&CancellationToken::new(), "node-1", spec())
            .await
            .expect("launch should succeed");
        assert_eq!(addrs, vec!["10.0.0.7"]);
    }

    /// Story: an in-flight create is awaited instead of duplicated, even
    /// when this caller's spec would not validate
    #[tokio::test(start_paused = true)]
    async fn story_launch_awaits_in_flight_create() {
        let mut api = MockLxcApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_get_instance_state()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(not_found()));
        api.expect_list_operations().returning(|| {
            Ok(vec![Operation {
                id: "create-op".to_string(),
                class: "task".to_string(),
                description: "Creating instance".to_string(),
                status_code: OP_RUNNING,
                resources: BTreeMap::from([(
                    "instances".to_string(),
                    vec!["/1.0/instances/node-1".to_string()],
                )]),
                ..Default::default()
            }])
        });
        api.expect_get_operation().returning(|id| {
            Ok(Operation {
                id: id.to_string(),
                status_code: STATUS_SUCCESS,
                ..Default::default()
            })
        });
        api.expect_create_instance().never();
        api.expect_get_instance_state()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(stopped_state()));
        api.expect_update_instance_state()
            .withf(|_, state| state.action == "start")
            .returning(|_, _| Ok(done("start-op")));
        api.expect_get_instance_state()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(running_state("10.0.0.8")));

        let client = client(api).await;
        let addrs = client
            .launch_instance(&CancellationToken::new(), "node-1", LaunchSpec::new())
            .await
            .expect("launch should succeed");
        assert_eq!(addrs, vec!["10.0.0.8"]);
    }

    /// Story: a fresh instance is provisioned between create and first start
    ///
    /// Templates are uploaded and registered, then file actions run in
    /// registration order, then replacements, and start comes last.
    #[tokio::test]
    async fn story_launch_provisions_before_first_start() {
        let mut api = MockLxcApi::new();
        let mut seq = mockall::Sequence::new();

        api.expect_get_instance_state()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(not_found()));
        api.expect_list_operations()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|| Ok(vec![]));
        api.expect_create_instance()
            .withf(|req| req.name == "node-1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(done("create-op")));
        api.expect_get_instance_metadata()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(Default::default()));
        api.expect_create_instance_template_file()
            .withf(|name, template, content| {
                name == "node-1" && template == "hostname.tpl" && content == "{{ container.name }}"
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        api.expect_update_instance_metadata()
            .withf(|_, metadata| {
                metadata.templates.get("/etc/hostname").is_some_and(|t| {
                    t.template == "hostname.tpl" && t.create_only && t.when == vec!["create"]
                })
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        api.expect_create_instance_file()
            .withf(|_, path, args| path == "/hack" && args.file_type == FileType::Directory)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        api.expect_create_instance_file()
            .withf(|_, path, args| path == "/etc/motd" && args.content == b"hello")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        api.expect_get_instance_file()
            .withf(|_, path| path == "/entrypoint")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(InstanceFile {
                    content: b"echo >/etc/resolv.conf\n".to_vec(),
                    mode: 0o755,
                    ..Default::default()
                })
            });
        api.expect_create_instance_file()
            .withf(|_, path, args| {
                path == "/entrypoint"
                    && args.content == b"echo >/etc/local-resolv.conf\n"
                    && args.mode == 0o755
                    && args.write_mode == WriteMode::Overwrite
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        api.expect_get_instance_state()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(stopped_state()));
        api.expect_update_instance_state()
            .withf(|_, state| state.action == "start")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(done("start-op")));
        api.expect_get_instance_state()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(running_state("10.0.0.3")));

        let spec = spec()
            .with_instance_templates([("/etc/hostname", "{{ container.name }}")])
            .with_directories(["/hack"])
            .with_create_files([("/etc/motd", "hello")])
            .with_replacements([(
                "/entrypoint",
                BTreeMap::from([(">/etc/resolv.conf".to_string(), ">/etc/local-resolv.conf".to_string())]),
            )]);

        let client = client(api).await;
        let addrs = client
            .launch_instance(&CancellationToken::new(), "node-1", spec)
            .await
            .expect("launch should succeed");
        assert_eq!(addrs, vec!["10.0.0.3"]);
    }

    /// Story: a create racing a concurrent create falls back to start
    #[tokio::test]
    async fn story_launch_conflict_falls_back_to_start() {
        let mut api = MockLxcApi::new();
        let mut seq = mockall::Sequence::new();
        api.expect_get_instance_state()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(not_found()));
        api.expect_list_operations().returning(|| Ok(vec![]));
        api.expect_create_instance()
            .times(1)
            .returning(|_| Err(Error::api("CreateInstance", 409, "Instance already exists")));
        // start_instance reads the state, then polls for an address
        api.expect_get_instance_state()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Ok(running_state("10.0.0.9")));

        let client = client(api).await;
        let addrs = client
            .launch_instance(&CancellationToken::new(), "node-1", spec())
            .await
            .expect("conflict should be tolerated");
        assert_eq!(addrs, vec!["10.0.0.9"]);
    }

    /// Story: a terminal spec error surfaces before any create call
    #[tokio::test]
    async fn story_launch_invalid_spec_is_terminal() {
        let mut api = MockLxcApi::new();
        api.expect_get_instance_state().returning(|_| Err(not_found()));
        api.expect_list_operations().returning(|| Ok(vec![]));
        api.expect_create_instance().never();

        let client = client(api).await;
        let err = client
            .launch_instance(&CancellationToken::new(), "node-1", LaunchSpec::new())
            .await
            .expect_err("no image");
        assert!(err.is_terminal());
    }

    #[tokio::test]
    async fn test_stop_is_noop_without_pid() {
        let mut api = MockLxcApi::new();
        api.expect_get_instance_state()
            .returning(|_| Ok(stopped_state()));
        api.expect_update_instance_state().never();

        let client = client(api).await;
        client
            .stop_instance(&CancellationToken::new(), "node-1")
            .await
            .expect("stopped instance needs no stop");
    }

    #[tokio::test]
    async fn test_stop_forces_running_instance() {
        let mut api = MockLxcApi::new();
        api.expect_get_instance_state()
            .returning(|_| Ok(running_state("10.0.0.2")));
        api.expect_update_instance_state()
            .withf(|name, state| name == "node-1" && state.action == "stop" && state.force)
            .times(1)
            .returning(|_, _| Ok(done("stop-op")));

        let client = client(api).await;
        client
            .stop_instance(&CancellationToken::new(), "node-1")
            .await
            .expect("stop should succeed");
    }

    /// Story: deleting an absent instance succeeds without any mutation
    #[tokio::test]
    async fn story_delete_absent_instance_succeeds() {
        let mut api = MockLxcApi::new();
        api.expect_get_instance_state().returning(|_| Err(not_found()));
        api.expect_delete_instance().never();

        let client = client(api).await;
        client
            .delete_instance(&CancellationToken::new(), "ghost")
            .await
            .expect("absent instance is already deleted");
    }

    #[tokio::test]
    async fn test_delete_propagates_transient_errors() {
        let mut api = MockLxcApi::new();
        api.expect_get_instance_state()
            .returning(|_| Err(Error::transport("GetInstanceState", "connection reset")));

        let client = client(api).await;
        let err = client
            .delete_instance(&CancellationToken::new(), "node-1")
            .await
            .expect_err("transport errors are not swallowed");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("failed to stop instance"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_await_address_times_out() {
        let mut api = MockLxcApi::new();
        api.expect_get_instance_state()
            .returning(|_| Ok(InstanceState {
                status: "Running".to_string(),
                pid: 1,
                ..Default::default()
            }));

        let client = client(api).await.with_timeouts(Timeouts {
            start: Duration::from_secs(5),
            ..Timeouts::default()
        });
        let err = client
            .await_address(&CancellationToken::new(), "node-1")
            .await
            .expect_err("no address is ever reported");
        assert!(err.is_timeout());
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let api = MockLxcApi::new();
        let client = client(api).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = client
            .start_instance(&cancel, "node-1")
            .await
            .expect_err("cancelled token");
        assert!(matches!(err, Error::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_run_command_non_zero_exit_is_error() {
        let mut api = MockLxcApi::new();
        api.expect_exec_instance()
            .withf(|_, req| req.command == vec!["systemctl", "reload", "haproxy.service"] && req.record_output)
            .returning(|_, _| {
                Ok(OperationHandle::Pending(Operation {
                    id: "exec".to_string(),
                    status_code: STATUS_SUCCESS,
                    metadata: Some(serde_json::json!({
                        "return": 1,
                        "output": {
                            "1": "/1.0/instances/lb/logs/exec-output/exec_1.stdout",
                            "2": "/1.0/instances/lb/logs/exec-output/exec_1.stderr"
                        }
                    })),
                    ..Default::default()
                }))
            });
        api.expect_get_log_file().returning(|path| {
            Ok(if path.ends_with(".stderr") {
                b"Job for haproxy.service failed\n".to_vec()
            } else {
                Vec::new()
            })
        });

        let client = client(api).await;
        let err = client
            .run_command(
                &CancellationToken::new(),
                "lb",
                &["systemctl", "reload", "haproxy.service"],
            )
            .await
            .expect_err("exit status 1");
        assert!(err.to_string().contains("exit status 1"));
        assert!(err.to_string().contains("Job for haproxy.service failed"));
    }

    #[tokio::test]
    async fn test_list_instances_filters_and_sorts() {
        let mut api = MockLxcApi::new();
        api.expect_list_instances_full().returning(|| {
            let labelled = |name: &str, role: &str| Instance {
                name: name.to_string(),
                config: BTreeMap::from([("user.cluster-role".to_string(), role.to_string())]),
                ..Default::default()
            };
            Ok(vec![
                labelled("cp-b", "control-plane"),
                labelled("lb", "loadbalancer"),
                labelled("cp-a", "control-plane"),
            ])
        });

        let client = client(api).await;
        let names: Vec<String> = client
            .list_instances(&[ListFilter::with_config([("user.cluster-role", "control-plane")])])
            .await
            .expect("list should succeed")
            .into_iter()
            .map(|i| i.name)
            .collect();
        assert_eq!(names, vec!["cp-a", "cp-b"]);
    }
}
