//! End-to-end pipeline runs against the simulated accelerator.
//!
//! Every test checks the resource ledger as well as the outcome: whatever
//! stage a run stops at, each handle it created must have been released.

use std::io::Write;
use std::path::{Path, PathBuf};

use mmult_host::buffers::{MemoryBank, Operand};
use mmult_host::runtime::simulated::{
    Fault, SimCommand, SimPlatform, SimulatedRuntime, XCLBIN_MAGIC,
};
use mmult_host::runtime::ResourceKind;
use mmult_host::{
    default_operands, run_default, run_pipeline, HostConfig, HostError, Matrix, PipelineOutcome,
    Stage,
};
use tempfile::NamedTempFile;

const DEVICE: &str = "xilinx_u200_xdma_201830_2";

fn image_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(XCLBIN_MAGIC).unwrap();
    file.write_all(&[0u8; 64]).unwrap();
    file.flush().unwrap();
    file
}

fn runtime(faults: Vec<Fault>) -> SimulatedRuntime {
    SimulatedRuntime::builder()
        .platform(SimPlatform::new("Xilinx").with_device(DEVICE, 4))
        .faults(faults)
        .build()
}

fn run_with(
    rt: &SimulatedRuntime,
    config: &HostConfig,
    image: &Path,
) -> mmult_host::Result<PipelineOutcome> {
    run_default(rt, config, image)
}

fn missing_path() -> PathBuf {
    let dir = tempfile::tempdir().unwrap();
    dir.path().join("missing.xclbin")
}

// ── Scenarios ────────────────────────────────────────────────────────

#[test]
fn default_run_matches_reference() {
    let rt = runtime(Vec::new());
    let image = image_file();
    let outcome = run_with(&rt, &HostConfig::default(), image.path()).unwrap();

    assert!(outcome.passed());
    assert_eq!(outcome.report.compared, 256);
    assert_eq!(outcome.device_output, outcome.reference);
    assert!(outcome.ensure_verified().is_ok());
    assert!(rt.ledger().is_balanced());
}

#[test]
fn absent_vendor_is_platform_not_found() {
    let rt = SimulatedRuntime::builder()
        .platform(SimPlatform::new("Intel(R) Corporation").with_device(DEVICE, 4))
        .build();
    let image = image_file();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();

    assert!(matches!(err, HostError::PlatformNotFound { ref vendor } if vendor == "Xilinx"));
    assert_eq!(err.stage(), Stage::Resolve);
    assert_eq!(rt.ledger().created(ResourceKind::Buffer), 0);
    assert_eq!(rt.ledger().total_created(), 0);
}

#[test]
fn missing_image_creates_no_resources() {
    let rt = runtime(Vec::new());
    let err = run_with(&rt, &HostConfig::default(), &missing_path()).unwrap_err();

    assert!(matches!(err, HostError::FileOpenError { .. }));
    assert_eq!(err.stage(), Stage::Load);
    assert_eq!(rt.ledger().total_created(), 0);
}

#[test]
fn corrupted_element_is_the_only_mismatch() {
    let rt = runtime(vec![Fault::CorruptOutput { index: 37, value: -1 }]);
    let image = image_file();
    let outcome = run_with(&rt, &HostConfig::default(), image.path()).unwrap();

    assert!(!outcome.passed());
    let indices: Vec<usize> = outcome.report.mismatches.iter().map(|m| m.index).collect();
    assert_eq!(indices, vec![37]);
    assert_eq!(outcome.report.mismatches[0].actual, -1);
    assert_eq!(outcome.report.mismatches[0].expected, outcome.reference.as_slice()[37]);

    let err = outcome.ensure_verified().unwrap_err();
    assert_eq!(err.stage(), Stage::Verify);
    assert!(rt.ledger().is_balanced());
}

// ── Properties of a run ──────────────────────────────────────────────

#[test]
fn single_element_product() {
    let rt = runtime(Vec::new());
    let image = image_file();
    let config = HostConfig { dimension: 1, ..HostConfig::default() };
    let a = Matrix::from_vec(1, vec![3]).unwrap();
    let b = Matrix::from_vec(1, vec![-4]).unwrap();
    let outcome = run_pipeline(&rt, &config, image.path(), &a, &b).unwrap();

    assert_eq!(outcome.device_output.as_slice(), &[-12]);
    assert!(outcome.passed());
}

#[test]
fn repeated_runs_are_identical() {
    let rt = runtime(Vec::new());
    let image = image_file();
    let config = HostConfig::default();
    let first = run_with(&rt, &config, image.path()).unwrap();
    let second = run_with(&rt, &config, image.path()).unwrap();

    assert_eq!(first, second);
    assert_eq!(rt.ledger().created(ResourceKind::Context), 2);
    assert!(rt.ledger().is_balanced());
}

#[test]
fn commands_form_a_strict_chain() {
    let rt = runtime(Vec::new());
    let image = image_file();
    run_with(&rt, &HostConfig::default(), image.path()).unwrap();

    assert_eq!(
        rt.commands(),
        vec![
            SimCommand::Write { bank: MemoryBank::Bank0 },
            SimCommand::Write { bank: MemoryBank::Bank1 },
            SimCommand::Launch { global: 1, local: 1 },
            SimCommand::Finish,
            SimCommand::Read { bank: MemoryBank::Bank2 },
            SimCommand::Wait,
        ]
    );
    assert_eq!(rt.launches(), 1);
}

#[test]
fn buffers_release_before_context() {
    let rt = runtime(Vec::new());
    let image = image_file();
    run_with(&rt, &HostConfig::default(), image.path()).unwrap();

    assert_eq!(
        rt.ledger().release_order(),
        &[
            ResourceKind::Event,
            ResourceKind::Buffer,
            ResourceKind::Buffer,
            ResourceKind::Buffer,
            ResourceKind::Kernel,
            ResourceKind::Program,
            ResourceKind::Queue,
            ResourceKind::Context,
        ]
    );
}

#[test]
fn custom_placement_is_honoured() {
    let rt = runtime(Vec::new());
    let image = image_file();
    let mut config = HostConfig::default();
    config.placement.a = MemoryBank::Bank3;
    config.placement.b = MemoryBank::Bank2;
    config.placement.c = MemoryBank::Bank0;
    run_with(&rt, &config, image.path()).unwrap();

    let commands = rt.commands();
    assert_eq!(commands[0], SimCommand::Write { bank: MemoryBank::Bank3 });
    assert_eq!(commands[1], SimCommand::Write { bank: MemoryBank::Bank2 });
    assert_eq!(commands[4], SimCommand::Read { bank: MemoryBank::Bank0 });
}

// ── Abort paths ──────────────────────────────────────────────────────

fn query_failure(fault: Fault) -> (SimulatedRuntime, HostError) {
    let rt = runtime(vec![fault]);
    let image = image_file();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();
    (rt, err)
}

#[test]
fn platform_enumeration_failure() {
    let (rt, err) = query_failure(Fault::PlatformQuery);

    assert!(matches!(err, HostError::RuntimeQuery { query: "platform ids", .. }));
    assert_eq!(err.stage(), Stage::Resolve);
    assert_eq!(rt.ledger().total_created(), 0);
}

#[test]
fn platform_vendor_query_failure() {
    let (rt, err) = query_failure(Fault::PlatformVendorQuery);

    assert!(matches!(err, HostError::RuntimeQuery { query: "platform vendor", .. }));
    assert_eq!(err.stage(), Stage::Resolve);
    assert_eq!(rt.ledger().total_created(), 0);
}

#[test]
fn device_enumeration_failure() {
    let (rt, err) = query_failure(Fault::DeviceQuery);

    assert!(matches!(err, HostError::RuntimeQuery { query: "device ids", .. }));
    assert_eq!(err.stage(), Stage::Resolve);
    assert_eq!(rt.ledger().total_created(), 0);
}

#[test]
fn device_name_query_failure() {
    let (rt, err) = query_failure(Fault::DeviceNameQuery);

    assert!(matches!(err, HostError::RuntimeQuery { query: "device name", .. }));
    assert_eq!(err.stage(), Stage::Resolve);
    assert_eq!(rt.ledger().total_created(), 0);
}

#[test]
fn missing_device_is_device_not_found() {
    let rt = runtime(Vec::new());
    let image = image_file();
    let config = HostConfig { device_name: "xilinx_u280".into(), ..HostConfig::default() };
    let err = run_with(&rt, &config, image.path()).unwrap_err();

    assert!(matches!(err, HostError::DeviceNotFound { ref device, .. } if device == "xilinx_u280"));
    assert_eq!(rt.ledger().total_created(), 0);
}

#[test]
fn incompatible_image_is_load_error() {
    let rt = runtime(Vec::new());
    let mut image = NamedTempFile::new().unwrap();
    image.write_all(b"\x7fELF not a device image").unwrap();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();

    assert!(matches!(err, HostError::ProgramLoadError(_)));
    assert_eq!(rt.ledger().created(ResourceKind::Buffer), 0);
    assert!(rt.ledger().is_balanced());
}

#[test]
fn build_failure_reports_log() {
    let rt = runtime(vec![Fault::BuildProgram { log: "ERROR: no matching device".into() }]);
    let image = image_file();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();

    match err {
        HostError::ProgramBuildError { ref log, .. } => assert!(log.contains("no matching device")),
        ref other => panic!("expected ProgramBuildError, got {other:?}"),
    }
    assert!(rt.ledger().is_balanced());
}

#[test]
fn unknown_kernel_name() {
    let rt = runtime(Vec::new());
    let image = image_file();
    let config = HostConfig { kernel_name: "vadd".into(), ..HostConfig::default() };
    let err = run_with(&rt, &config, image.path()).unwrap_err();

    assert!(matches!(err, HostError::KernelNotFound { ref name, .. } if name == "vadd"));
    assert!(rt.ledger().is_balanced());
}

#[test]
fn allocation_failure_names_operand_and_releases_earlier_buffers() {
    let rt = runtime(vec![Fault::AllocateBuffer { bank: MemoryBank::Bank2 }]);
    let image = image_file();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();

    assert!(matches!(
        err,
        HostError::BufferAllocError {
            operand: Operand::C,
            bank: MemoryBank::Bank2,
            bytes: 1024,
            ..
        }
    ));
    let ledger = rt.ledger();
    assert_eq!(ledger.created(ResourceKind::Buffer), 2);
    assert!(ledger.is_balanced());
}

#[test]
fn bank_beyond_device_is_rejected_before_allocation() {
    let rt = SimulatedRuntime::builder()
        .platform(SimPlatform::new("Xilinx").with_device(DEVICE, 2))
        .build();
    let image = image_file();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();

    assert!(matches!(err, HostError::BankOutOfRange { bank: MemoryBank::Bank2, available: 2 }));
    assert_eq!(rt.ledger().created(ResourceKind::Buffer), 0);
    assert!(rt.ledger().is_balanced());
}

#[test]
fn write_failure_names_operand_b() {
    let rt = runtime(vec![Fault::WriteBuffer { bank: MemoryBank::Bank1 }]);
    let image = image_file();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();

    assert!(matches!(err, HostError::TransferError { operand: Operand::B, .. }));
    assert_eq!(rt.launches(), 0);
    assert!(rt.ledger().is_balanced());
}

#[test]
fn write_failure_on_a_skips_b() {
    let rt = runtime(vec![Fault::WriteBuffer { bank: MemoryBank::Bank0 }]);
    let image = image_file();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();

    assert!(matches!(err, HostError::TransferError { operand: Operand::A, .. }));
    assert_eq!(rt.commands(), vec![SimCommand::Write { bank: MemoryBank::Bank0 }]);
}

#[test]
fn bind_failure_reports_first_failing_index() {
    let rt = runtime(vec![Fault::SetKernelArg { index: 3 }, Fault::SetKernelArg { index: 5 }]);
    let image = image_file();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();

    assert!(matches!(err, HostError::ArgumentBindError { index: 3, .. }));
    assert_eq!(err.stage(), Stage::Dispatch);
    assert_eq!(rt.launches(), 0);
    assert!(rt.ledger().is_balanced());
}

#[test]
fn launch_failure_is_reported() {
    let rt = runtime(vec![Fault::LaunchKernel]);
    let image = image_file();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();

    assert!(matches!(err, HostError::KernelLaunchError(_)));
    assert!(rt.ledger().is_balanced());
}

#[test]
fn drain_failure_is_launch_error_and_skips_read() {
    let rt = runtime(vec![Fault::Finish]);
    let image = image_file();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();

    assert!(matches!(err, HostError::KernelLaunchError(_)));
    assert!(!rt.commands().iter().any(|c| matches!(c, SimCommand::Read { .. })));
    assert!(rt.ledger().is_balanced());
}

#[test]
fn read_failure_names_operand_c() {
    let rt = runtime(vec![Fault::ReadBuffer]);
    let image = image_file();
    let err = run_with(&rt, &HostConfig::default(), image.path()).unwrap_err();

    assert!(matches!(err, HostError::TransferError { operand: Operand::C, .. }));
    assert_eq!(rt.ledger().created(ResourceKind::Event), 0);
    assert!(rt.ledger().is_balanced());
}

#[test]
fn invalid_config_is_rejected_before_resolution() {
    let rt = runtime(Vec::new());
    let image = image_file();
    let config = HostConfig { dimension: 0, ..HostConfig::default() };
    let err = run_with(&rt, &config, image.path()).unwrap_err();

    assert_eq!(err.stage(), Stage::Configure);
    assert_eq!(rt.ledger().total_created(), 0);
}

#[test]
fn operand_size_mismatch_is_rejected() {
    let rt = runtime(Vec::new());
    let image = image_file();
    let (a, _) = default_operands(4);
    let (b, _) = default_operands(3);
    let err = run_pipeline(&rt, &HostConfig::default(), image.path(), &a, &b).unwrap_err();

    assert!(matches!(err, HostError::DimensionMismatch { expected: 16, actual: 9 }));
    assert_eq!(rt.ledger().total_created(), 0);
}

#[test]
fn operands_must_match_configured_dimension() {
    let rt = runtime(Vec::new());
    let image = image_file();
    let (a, b) = default_operands(4);
    let err = run_pipeline(&rt, &HostConfig::default(), image.path(), &a, &b).unwrap_err();

    assert!(matches!(err, HostError::DimensionMismatch { expected: 256, actual: 16 }));
    assert_eq!(rt.ledger().total_created(), 0);
}
