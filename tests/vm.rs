use std::{sync::Arc, time::Duration};

use assert_matches::assert_matches;
use harpoon::{
    bootloader::KERNEL_FILE_NAME,
    config::ImageConfig,
    error::{Classify, ErrorKind, ExitCode},
    exec::ExecError,
    image::{MANIFEST_FILE_NAME, RUNTIME_FS_DIRECTORY},
    shim::{ShimError, exec_exit_code},
    vm::{StopMode, Vm, VmError, VmState},
    vsock::BridgeState,
};
use test_framework::{
    FakeBehavior, MIB, TEST_PLATFORM, VmBuilder, get_image_config, get_layer_url, get_test_environment,
    init_tracing, shutdown_test_vm,
};
use tokio_util::sync::CancellationToken;


#[test]
fn vm_can_exec_echo() {
    VmBuilder::new().run(|vm| async move {
        let output = vm.exec("echo hello", &CancellationToken::new()).await.unwrap();
        assert_eq!(output.stdout_lossy(), "hello\n");
        assert!(output.stderr.is_empty());
        assert_eq!(output.exit_code, 0);
        assert_eq!(vm.state(), VmState::Running);
        shutdown_test_vm(&vm).await;
    });
}

#[test]
fn vm_runs_image_tooling() {
    VmBuilder::new()
        .image_config(
            ImageConfig::new("docker.io/oven/bun:latest", TEST_PLATFORM, 512 * MIB, 2).no_forwards(),
        )
        .run(|vm| async move {
            let output = vm.exec("bun --version", &CancellationToken::new()).await.unwrap();
            assert!(output.success());
            assert!(!output.stdout.is_empty());
            shutdown_test_vm(&vm).await;
        });
}

#[test]
fn vm_reports_failed_guest_commands_without_stopping() {
    VmBuilder::new().run(|vm| async move {
        let result = vm.exec("definitely-not-a-command", &CancellationToken::new()).await;
        let output = result.as_ref().unwrap();
        assert_eq!(output.exit_code, 127);
        assert!(output.stderr_lossy().contains("command not found"));

        let facade = exec_exit_code(&result.map_err(ShimError::VmError));
        assert_eq!(facade, ExitCode::GuestExecFailed);
        assert_eq!(vm.state(), VmState::Running);
        shutdown_test_vm(&vm).await;
    });
}

#[test]
fn vm_hard_stop_keeps_workdir_until_cleanup() {
    VmBuilder::new().run(|vm| async move {
        let workdir = vm.workdir().to_owned();
        vm.stop(StopMode::Hard, &CancellationToken::new()).await.unwrap();
        assert_eq!(vm.state(), VmState::Stopped);
        assert!(tokio::fs::try_exists(&workdir).await.unwrap());
        assert!(tokio::fs::try_exists(workdir.join(KERNEL_FILE_NAME)).await.unwrap());

        vm.cleanup().await.unwrap();
        assert!(!tokio::fs::try_exists(&workdir).await.unwrap());
    });
}

#[test]
fn vm_stop_is_idempotent() {
    VmBuilder::new().run(|vm| async move {
        vm.stop(StopMode::Graceful, &CancellationToken::new()).await.unwrap();
        vm.stop(StopMode::Graceful, &CancellationToken::new()).await.unwrap();
        vm.stop(StopMode::Hard, &CancellationToken::new()).await.unwrap();
        assert_eq!(vm.state(), VmState::Stopped);
        vm.cleanup().await.unwrap();
    });
}

#[test]
fn vm_graceful_stop_escalates_when_the_guest_ignores_it() {
    VmBuilder::new()
        .behavior(FakeBehavior {
            ignore_stop_requests: true,
            ..Default::default()
        })
        .run(|vm| async move {
            vm.stop(StopMode::Graceful, &CancellationToken::new()).await.unwrap();
            assert_eq!(vm.state(), VmState::Stopped);
            vm.cleanup().await.unwrap();
        });
}

#[test]
fn vm_stop_closes_exec() {
    VmBuilder::new().run(|vm| async move {
        vm.stop(StopMode::Hard, &CancellationToken::new()).await.unwrap();
        assert_eq!(vm.bridge_state(), BridgeState::Closed);
        assert_matches!(
            vm.exec("echo late", &CancellationToken::new()).await,
            Err(VmError::ExecError(ExecError::Closed))
        );
        vm.cleanup().await.unwrap();
    });
}

#[test]
fn vm_can_pause_and_resume() {
    VmBuilder::new().run(|vm| async move {
        vm.pause(&CancellationToken::new()).await.unwrap();
        assert_eq!(vm.state(), VmState::Paused);
        assert_matches!(
            vm.pause(&CancellationToken::new()).await,
            Err(VmError::ExpectedState {
                operation: "pause",
                actual: VmState::Paused
            })
        );
        vm.resume(&CancellationToken::new()).await.unwrap();
        assert_eq!(vm.state(), VmState::Running);
        shutdown_test_vm(&vm).await;
    });
}

#[test]
fn vm_history_is_a_legal_path() {
    VmBuilder::new().run(|vm| async move {
        vm.pause(&CancellationToken::new()).await.unwrap();
        vm.resume(&CancellationToken::new()).await.unwrap();
        vm.stop(StopMode::Graceful, &CancellationToken::new()).await.unwrap();

        let history = vm.history();
        assert_eq!(history.first(), Some(&VmState::Unknown));
        assert_eq!(history.last(), Some(&VmState::Stopped));
        assert!(history.contains(&VmState::Paused));
        assert!(VmState::is_legal_path(&history), "{history:?}");
        assert_eq!(vm.overruns(), 0);
        vm.cleanup().await.unwrap();
    });
}

#[test]
fn vm_rejects_a_second_start() {
    VmBuilder::new().run(|vm| async move {
        let error = vm.start(Duration::from_secs(1), &CancellationToken::new()).await.unwrap_err();
        assert_matches!(
            error,
            VmError::ExpectedState {
                operation: "start",
                actual: VmState::Running
            }
        );
        assert_eq!(error.kind(), ErrorKind::ConfigInvalid);
        shutdown_test_vm(&vm).await;
    });
}

#[test]
fn vm_balloon_can_be_resized() {
    VmBuilder::new().run(|vm| async move {
        assert_eq!(vm.balloon().await.unwrap(), 256 * MIB);
        vm.set_balloon(300 * MIB).await.unwrap();
        assert_eq!(vm.balloon().await.unwrap(), 300 * MIB);
        shutdown_test_vm(&vm).await;
    });
}

#[test]
fn vm_concurrent_execs_never_interleave() {
    VmBuilder::new().run(|vm| async move {
        let mut tasks = Vec::new();
        for i in 0..16 {
            let vm = vm.clone();
            tasks.push(tokio::spawn(async move {
                let output = vm
                    .exec(&format!("echo request-{i}"), &CancellationToken::new())
                    .await
                    .unwrap();
                assert_eq!(output.stdout_lossy(), format!("request-{i}\n"));
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        shutdown_test_vm(&vm).await;
    });
}

#[test]
fn vm_exec_returns_large_outputs_whole() {
    VmBuilder::new().run(|vm| async move {
        for _ in 0..4 {
            let word: String = std::iter::repeat_with(fastrand::alphanumeric)
                .take(fastrand::usize(1..64 * 1024))
                .collect();
            let output = vm
                .exec(&format!("echo {word}"), &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(output.stdout.len(), word.len() + 1);
            assert_eq!(output.stdout_lossy(), format!("{word}\n"));
        }
        shutdown_test_vm(&vm).await;
    });
}

#[test]
fn vm_canceled_exec_does_not_leak_into_the_next_one() {
    VmBuilder::new().run(|vm| async move {
        let cancel = CancellationToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let error = vm.exec("sleep 300", &cancel).await.unwrap_err();
        assert_matches!(error, VmError::ExecError(ExecError::Canceled));
        assert_eq!(error.kind().exit_code(), ExitCode::Canceled);

        let output = vm.exec("echo after", &CancellationToken::new()).await.unwrap();
        assert_eq!(output.stdout_lossy(), "after\n");
        assert_eq!(vm.state(), VmState::Running);
        shutdown_test_vm(&vm).await;
    });
}

#[test]
fn vm_exec_reconnects_after_the_guest_hangs_up() {
    VmBuilder::new().run(|vm| async move {
        assert_matches!(
            vm.exec("hangup", &CancellationToken::new()).await,
            Err(VmError::ExecError(ExecError::ConnectionLost(_)))
        );
        assert_eq!(vm.bridge_state(), BridgeState::Disconnected);
        assert_matches!(
            vm.exec("echo early", &CancellationToken::new()).await,
            Err(VmError::ExecError(ExecError::NotReady))
        );

        vm.reconnect_exec().await.unwrap();
        let output = vm.exec("echo again", &CancellationToken::new()).await.unwrap();
        assert_eq!(output.stdout_lossy(), "again\n");
        shutdown_test_vm(&vm).await;
    });
}

#[test]
fn vm_exposes_vsock_descriptors() {
    VmBuilder::new().run(|vm| async move {
        let fd = vm.vsock_fd(2019).await.unwrap();
        drop(fd);
        shutdown_test_vm(&vm).await;
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_exec_before_the_guest_binds_is_not_ready() {
    init_tracing();
    let env = get_test_environment(FakeBehavior {
        guest_ready_delay: Duration::from_millis(500),
        ..Default::default()
    });
    let vm = Vm::create(&env, get_image_config(), &CancellationToken::new())
        .await
        .unwrap();
    assert_matches!(
        vm.exec("echo early", &CancellationToken::new()).await,
        Err(VmError::ExecError(ExecError::NotReady))
    );

    vm.start(Duration::from_secs(5), &CancellationToken::new()).await.unwrap();
    let error = vm.exec("echo early", &CancellationToken::new()).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::ExecNotReady);

    vm.wait_ready_to_exec(Duration::from_secs(5), &CancellationToken::new()).await.unwrap();
    vm.wait_ready_to_exec(Duration::from_millis(1), &CancellationToken::new()).await.unwrap();
    let output = vm.exec("echo late", &CancellationToken::new()).await.unwrap();
    assert_eq!(output.stdout_lossy(), "late\n");
    shutdown_test_vm(&vm).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_conversions_are_shared_between_vms() {
    init_tracing();
    let env = get_test_environment(FakeBehavior::default());
    let cancel = CancellationToken::new();
    let (first, second) = tokio::join!(
        Vm::create(&env, get_image_config(), &cancel),
        Vm::create(&env, get_image_config(), &cancel),
    );
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_eq!(env.assembler().fetcher().calls(), 1);
    assert_ne!(first.id(), second.id());
    assert_ne!(first.workdir(), second.workdir());

    let third = Vm::create(&env, get_image_config(), &cancel).await.unwrap();
    assert_eq!(env.assembler().fetcher().calls(), 1);

    for vm in [first, second, third] {
        vm.cleanup().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_image_blobs_are_downloaded_once() {
    init_tracing();
    let env = get_test_environment(FakeBehavior::default());
    let cancel = CancellationToken::new();
    let pinned = ImageConfig::new("docker.io/library/alpine:3.20", TEST_PLATFORM, 256 * MIB, 1).no_forwards();
    let (first, second) = tokio::join!(
        Vm::create(&env, pinned, &cancel),
        Vm::create(&env, get_image_config(), &cancel),
    );
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(env.assembler().fetcher().calls(), 2);
    let artifacts = env.assembler().artifacts();
    assert_eq!(artifacts.downloader().downloads(), 1);
    let layer = artifacts.path_for(&get_layer_url("docker.io/library/alpine:latest")).unwrap();
    assert!(layer.starts_with(env.config().get_cache_dir().join("artifacts")));
    assert!(tokio::fs::try_exists(&layer).await.unwrap());

    for vm in [first, second] {
        vm.cleanup().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_create_rejects_zero_memory() {
    let env = get_test_environment(FakeBehavior::default());
    let config = ImageConfig::new("docker.io/library/alpine:latest", TEST_PLATFORM, 0, 1);
    let error = Vm::create(&env, config, &CancellationToken::new()).await.unwrap_err();
    assert_matches!(error, VmError::ConfigInvalid(_));
    assert_eq!(error.kind(), ErrorKind::ConfigInvalid);
    assert_eq!(env.assembler().fetcher().calls(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_create_surfaces_hypervisor_rejection() {
    let env = get_test_environment(FakeBehavior {
        reject: true,
        ..Default::default()
    });
    let error = Vm::create(&env, get_image_config(), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(error.kind(), ErrorKind::HypervisorRejected);
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_create_surfaces_missing_images() {
    let env = get_test_environment(FakeBehavior::default());
    let config = ImageConfig::new("missing/image:latest", TEST_PLATFORM, 256 * MIB, 1).no_forwards();
    let error = Vm::create(&env, config, &CancellationToken::new()).await.unwrap_err();
    assert_matches!(error, VmError::ImageError(_));
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_create_can_be_canceled() {
    let env = get_test_environment(FakeBehavior::default());
    let cancel = CancellationToken::new();
    cancel.cancel();
    let error = Vm::create(&env, get_image_config(), &cancel).await.unwrap_err();
    assert_matches!(error, VmError::Canceled);
    assert_eq!(error.kind().exit_code().code(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_start_times_out_and_stops() {
    let env = get_test_environment(FakeBehavior {
        hang_on_start: true,
        ..Default::default()
    });
    let vm = Vm::create(&env, get_image_config(), &CancellationToken::new())
        .await
        .unwrap();
    let error = vm.start(Duration::from_millis(200), &CancellationToken::new()).await.unwrap_err();
    assert_matches!(error, VmError::StartTimeout(_));
    assert_eq!(error.kind().exit_code(), ExitCode::Timeout);

    vm.wait_for_state(VmState::Stopped, Duration::from_secs(2), &CancellationToken::new()).await.unwrap();
    vm.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_start_can_be_canceled() {
    init_tracing();
    let env = get_test_environment(FakeBehavior {
        hang_on_start: true,
        ..Default::default()
    });
    let vm = Vm::create(&env, get_image_config(), &CancellationToken::new())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });
    let started_at = tokio::time::Instant::now();
    let error = vm.start(Duration::from_secs(30), &cancel).await.unwrap_err();
    assert_matches!(error, VmError::Canceled);
    assert_eq!(error.kind().exit_code(), ExitCode::Canceled);
    assert!(started_at.elapsed() < Duration::from_secs(5));

    vm.wait_for_state(VmState::Stopped, Duration::from_secs(2), &CancellationToken::new())
        .await
        .unwrap();
    vm.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_start_with_a_canceled_token_does_not_boot() {
    let env = get_test_environment(FakeBehavior::default());
    let vm = Vm::create(&env, get_image_config(), &CancellationToken::new())
        .await
        .unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();
    assert_matches!(vm.start(Duration::from_secs(5), &cancel).await, Err(VmError::Canceled));
    assert_eq!(vm.state(), VmState::Unknown);
    vm.cleanup().await.unwrap();
}

#[test]
fn vm_canceled_graceful_stop_falls_back_to_a_hard_stop() {
    VmBuilder::new()
        .behavior(FakeBehavior {
            ignore_stop_requests: true,
            ..Default::default()
        })
        .run(|vm| async move {
            let cancel = CancellationToken::new();
            let canceller = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                canceller.cancel();
            });

            let error = vm.stop(StopMode::Graceful, &cancel).await.unwrap_err();
            assert_matches!(error, VmError::Canceled);
            assert_eq!(vm.bridge_state(), BridgeState::Closed);
            vm.wait_for_state(VmState::Stopped, Duration::from_secs(1), &CancellationToken::new())
                .await
                .unwrap();
            vm.cleanup().await.unwrap();
        });
}

#[test]
fn vm_waits_can_be_canceled() {
    VmBuilder::new().run(|vm| async move {
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_matches!(
            vm.wait_for_state(VmState::Paused, Duration::from_secs(30), &cancel).await,
            Err(VmError::Canceled)
        );
        assert_matches!(
            vm.wait_ready_to_exec(Duration::from_secs(30), &cancel).await,
            Err(VmError::Canceled)
        );
        assert_eq!(vm.state(), VmState::Running);
        shutdown_test_vm(&vm).await;
    });
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_cleanup_without_start_removes_the_workdir() {
    let env = get_test_environment(FakeBehavior::default());
    let vm = Arc::new(
        Vm::create(&env, get_image_config(), &CancellationToken::new())
            .await
            .unwrap(),
    );
    assert_eq!(vm.state(), VmState::Unknown);
    let workdir = vm.workdir().to_owned();
    assert!(tokio::fs::try_exists(workdir.join(RUNTIME_FS_DIRECTORY).join(MANIFEST_FILE_NAME)).await.unwrap());

    vm.stop(StopMode::Graceful, &CancellationToken::new()).await.unwrap();
    vm.cleanup().await.unwrap();
    assert!(!tokio::fs::try_exists(&workdir).await.unwrap());
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_retained_workdir_survives_cleanup() {
    let env = get_test_environment(FakeBehavior::default());
    let vm = Vm::create(
        &env,
        get_image_config().retain_workdir(true),
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    vm.cleanup().await.unwrap();
    assert!(tokio::fs::try_exists(vm.workdir()).await.unwrap());
    tokio::fs::remove_dir_all(vm.workdir()).await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn vm_forwards_get_a_host_port() {
    let env = get_test_environment(FakeBehavior::default());
    let config = ImageConfig::new("docker.io/library/alpine:latest", TEST_PLATFORM, 256 * MIB, 1);
    let vm = Vm::create(&env, config, &CancellationToken::new()).await.unwrap();
    assert!(vm.forwarded_host_port().is_some());
    vm.cleanup().await.unwrap();
}
