// tests/faults.rs
//
// Fault reports flow from the watcher channel into dispatch errors, poison
// the device until an explicit recovery, and name the offending core.

use std::sync::Arc;
use std::time::Duration;

use spindle::command::{CommandHeader, CommandKind, COMPLETION_HEADER_BYTES};
use spindle::fault::{FaultKind, FaultReport};
use spindle::sim::{SimDevice, SimOptions};
use spindle::sysmem::{queue_layouts, SysmemConfig, SysmemManager};
use spindle::{CoreCoord, DeviceId, DispatchError, PollBudget, QueueId, RegisterFile};

const Q: QueueId = QueueId::new(0);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[test]
fn injected_fault_surfaces_on_the_faulting_completion() {
    init_tracing();
    let config = SysmemConfig {
        queue_region_size: 4096,
        ..SysmemConfig::default()
    };
    let layouts = queue_layouts(&config).unwrap();
    let regs = Arc::new(RegisterFile::new(&layouts));
    let manager = Arc::new(SysmemManager::new(DeviceId::new(3), config, regs.clone()).unwrap());
    let _sim = SimDevice::spawn(
        DeviceId::new(3),
        manager.window().clone(),
        regs,
        layouts,
        Some(manager.fault_reporter()),
        SimOptions {
            fault_on_seq: Some(2),
            fault_core: Some(CoreCoord::new(4, 7)),
        },
    );

    for seq in 1..=2u64 {
        let header =
            CommandHeader::new(CommandKind::WriteBuffer, seq, 64, COMPLETION_HEADER_BYTES);
        manager.write_then_push(Q, &header, &[0; 64], false).unwrap();
    }

    let (completion, _) = manager.wait_and_pop(Q).unwrap();
    assert_eq!(completion.seq, 1);

    let err = manager.wait_and_pop(Q).unwrap_err();
    let report = match err {
        DispatchError::Fault(report) => report,
        other => panic!("expected a fault, got {other}"),
    };
    assert_eq!(report.device, DeviceId::new(3));
    assert_eq!(report.core, CoreCoord::new(4, 7));
    assert_eq!(report.kind, FaultKind::IllegalAccess);
    // The report names device and core for whoever reads the error message.
    let text = report.to_string();
    assert!(text.contains("device 3"), "report was: {text}");
    assert!(text.contains("(x=4,y=7)"), "report was: {text}");

    // Poisoned: every subsequent dispatch call fails fast.
    let header = CommandHeader::new(CommandKind::Barrier, 3, 0, COMPLETION_HEADER_BYTES);
    assert!(matches!(
        manager.write_then_push(Q, &header, &[], false),
        Err(DispatchError::Fault(_))
    ));
    assert!(matches!(
        manager.synchronize(Q),
        Err(DispatchError::Fault(_))
    ));
}

#[test]
fn watcher_report_fails_synchronize_even_without_a_completion() {
    init_tracing();
    // No device at all: a hang with a watcher report must fail the drain
    // instead of spinning until the deadline.
    let config = SysmemConfig {
        queue_region_size: 4096,
        budget: PollBudget::unbounded().with_deadline(Duration::from_secs(5)),
        ..SysmemConfig::default()
    };
    let layouts = queue_layouts(&config).unwrap();
    let regs = Arc::new(RegisterFile::new(&layouts));
    let manager = SysmemManager::new(DeviceId::new(0), config, regs).unwrap();

    let header = CommandHeader::new(CommandKind::Barrier, 1, 0, COMPLETION_HEADER_BYTES);
    manager.write_then_push(Q, &header, &[], false).unwrap();
    manager.fault_reporter().report(FaultReport::new(
        DeviceId::new(0),
        CoreCoord::new(2, 2),
        FaultKind::Hang,
        "dispatch core stopped fetching".to_string(),
    ));

    let err = manager.synchronize(Q).unwrap_err();
    assert!(matches!(
        err,
        DispatchError::Fault(FaultReport {
            kind: FaultKind::Hang,
            ..
        })
    ));
}

#[test]
fn recover_clears_the_poison_and_resets_queues() {
    init_tracing();
    let config = SysmemConfig {
        queue_region_size: 4096,
        ..SysmemConfig::default()
    };
    let layouts = queue_layouts(&config).unwrap();
    let regs = Arc::new(RegisterFile::new(&layouts));
    let manager = SysmemManager::new(DeviceId::new(0), config, regs).unwrap();

    manager.fault_reporter().report(FaultReport::new(
        DeviceId::new(0),
        CoreCoord::new(1, 1),
        FaultKind::IllegalAccess,
        "poisoning".to_string(),
    ));
    assert!(manager.synchronize(Q).is_err());
    assert!(matches!(
        manager.flush(Q),
        Err(DispatchError::Fault(_))
    ));

    manager.recover();
    // Cursors, pending lists, and the poison flag are back to creation
    // state; the stale watcher report is gone too.
    manager.flush(Q).unwrap();
    manager.synchronize(Q).unwrap();
    assert_eq!(manager.in_flight(Q).unwrap(), 0);
}
